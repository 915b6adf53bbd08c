//! Cell-text cleanup shared by every extraction strategy: bidi controls,
//! Arabic presentation forms, visual-order runs, digits and diacritics.

use unicode_bidi::{bidi_class, BidiClass};
use unicode_normalization::UnicodeNormalization;

const BIDI_CONTROLS: &[char] = &[
    '\u{061C}', '\u{200E}', '\u{200F}', '\u{202A}', '\u{202B}', '\u{202C}', '\u{202D}', '\u{202E}',
    '\u{2066}', '\u{2067}', '\u{2068}', '\u{2069}',
];

pub fn strip_bidi_controls(text: &str) -> String {
    text.chars().filter(|c| !BIDI_CONTROLS.contains(c)).collect()
}

pub fn has_presentation_forms(text: &str) -> bool {
    text.chars()
        .any(|c| matches!(c, '\u{FB50}'..='\u{FDFF}' | '\u{FE70}'..='\u{FEFF}'))
}

pub fn fold_presentation_forms(text: &str) -> String {
    text.nfkc().collect()
}

fn is_strong_rtl(c: char) -> bool {
    matches!(bidi_class(c), BidiClass::R | BidiClass::AL)
}

fn is_strong_ltr(c: char) -> bool {
    bidi_class(c) == BidiClass::L
}

fn is_digit_like(c: char) -> bool {
    matches!(bidi_class(c), BidiClass::EN | BidiClass::AN)
}

fn is_number_separator(c: char) -> bool {
    matches!(c, '.' | ',' | '\u{066B}' | '\u{066C}')
}

fn mirror(c: char) -> char {
    match c {
        '(' => ')',
        ')' => '(',
        '[' => ']',
        ']' => '[',
        '{' => '}',
        '}' => '{',
        '<' => '>',
        '>' => '<',
        '\u{00AB}' => '\u{00BB}',
        '\u{00BB}' => '\u{00AB}',
        other => other,
    }
}

/// Reverse one visual-order RTL run into logical order. Numbers inside the
/// run keep their digit order.
fn reverse_run(run: &[char]) -> Vec<char> {
    let mut out: Vec<char> = run.iter().rev().map(|c| mirror(*c)).collect();
    let mut i = 0;
    while i < out.len() {
        if !is_digit_like(out[i]) {
            i += 1;
            continue;
        }
        let start = i;
        let mut end = i;
        while end + 1 < out.len()
            && (is_digit_like(out[end + 1])
                || (is_number_separator(out[end + 1])
                    && out.get(end + 2).copied().is_some_and(is_digit_like)))
        {
            end += 1;
        }
        out[start..=end].reverse();
        i = end + 1;
    }
    out
}

/// Convert visually ordered text (as laid out on a page) to logical order.
/// Only maximal right-to-left runs are touched; Latin text is left alone.
pub fn visual_to_logical(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if !is_strong_rtl(chars[i]) {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        let mut last_rtl = i;
        let mut j = i + 1;
        while j < chars.len() && !is_strong_ltr(chars[j]) {
            if is_strong_rtl(chars[j]) {
                last_rtl = j;
            }
            j += 1;
        }
        out.extend(reverse_run(&chars[i..=last_rtl]));
        i = last_rtl + 1;
    }
    out
}

/// More strong right-to-left than left-to-right characters.
pub fn rtl_dominant(text: &str) -> bool {
    let (rtl, ltr) = text.chars().fold((0usize, 0usize), |(r, l), c| {
        if is_strong_rtl(c) {
            (r + 1, l)
        } else if is_strong_ltr(c) {
            (r, l + 1)
        } else {
            (r, l)
        }
    });
    rtl > ltr
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize one extracted cell. `visual_order` forces run reversal; it is
/// also applied whenever the raw text carries presentation-form glyphs.
pub fn clean_cell(raw: &str, visual_order: bool) -> String {
    let stripped = strip_bidi_controls(raw);
    let shaped = has_presentation_forms(&stripped);
    let folded = fold_presentation_forms(&stripped);
    let logical = if visual_order || shaped {
        visual_to_logical(&folded)
    } else {
        folded
    };
    collapse_whitespace(&logical)
}

/// Whitespace collapsed and harakat removed; used for names and matching keys.
pub fn normalize_arabic(text: &str) -> String {
    let without_marks: String = text
        .chars()
        .filter(|c| !matches!(c, '\u{064B}'..='\u{0652}' | '\u{0640}'))
        .collect();
    collapse_whitespace(&without_marks)
}

/// Arabic-Indic and Persian digits to ASCII, Arabic decimal/thousands marks to `.`/`,`.
pub fn fold_digits(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
            '\u{066B}' => '.',
            '\u{066C}' => ',',
            other => other,
        })
        .collect()
}

/// Cheap numeric test used for header detection and confidence scoring.
pub fn looks_numeric(cell: &str) -> bool {
    let folded = fold_digits(cell);
    let core: String = folded
        .chars()
        .filter(|c| !matches!(c, ',' | '%' | '(' | ')' | ' ' | '+' | '-'))
        .collect();
    !core.is_empty()
        && core.chars().any(|c| c.is_ascii_digit())
        && core.chars().all(|c| c.is_ascii_digit() || c == '.')
        && core.matches('.').count() <= 1
}

/// Three to six digits, in any of the digit scripts `fold_digits` knows.
pub fn looks_like_ticker(cell: &str) -> bool {
    let folded = fold_digits(cell.trim());
    (3..=6).contains(&folded.len()) && folded.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_controls_and_collapses_whitespace() {
        assert_eq!(clean_cell("\u{200F}  الراجحي \u{202B}المالية\u{202C} ", false), "الراجحي المالية");
    }

    #[test]
    fn reverses_rtl_runs_but_keeps_numbers() {
        let visual: String = "يحجارلا 1120 ةكرش".to_string();
        assert_eq!(visual_to_logical(&visual), "شركة 1120 الراجحي");
    }

    #[test]
    fn decimal_numbers_keep_their_order() {
        assert_eq!(visual_to_logical("غلبم 12.50 ريهطت"), "تطهير 12.50 مبلغ");
    }

    #[test]
    fn latin_text_is_untouched() {
        assert_eq!(visual_to_logical("Saudi Aramco 2222"), "Saudi Aramco 2222");
    }

    #[test]
    fn brackets_are_mirrored_inside_runs() {
        assert_eq!(visual_to_logical("ي(ب)ا"), "ا(ب)ي");
    }

    #[test]
    fn presentation_forms_trigger_folding_and_reversal() {
        // "ﺏﺍ" is visual order for "اب" in presentation forms.
        let raw = "\u{FE8F}\u{FE8D}";
        assert!(has_presentation_forms(raw));
        assert_eq!(clean_cell(raw, false), "اب");
    }

    #[test]
    fn normalizes_diacritics() {
        assert_eq!(normalize_arabic("  الرَّاجِحِي   المالية "), "الراجحي المالية");
    }

    #[test]
    fn folds_arabic_indic_digits() {
        assert_eq!(fold_digits("١٢٣٫٥"), "123.5");
        assert_eq!(fold_digits("۴۵"), "45");
        assert!(looks_numeric("١٬٢٣٤"));
        assert!(looks_numeric("(12.5)"));
        assert!(!looks_numeric("الراجحي"));
        assert!(!looks_numeric("-"));
    }
}
