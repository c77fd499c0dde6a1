//! Detects questions that name a specific page ("page 7", "the third page").

use once_cell::sync::Lazy;
use regex::Regex;

static NUMERIC_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\b(\d{1,3})(?:st|nd|rd|th)?\s*pages?\b",
        r"(?i)\bpages?\s*(\d{1,3})\b",
    ]
    .into_iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

const ORDINALS: [&str; 20] = [
    "first",
    "second",
    "third",
    "fourth",
    "fifth",
    "sixth",
    "seventh",
    "eighth",
    "ninth",
    "tenth",
    "eleventh",
    "twelfth",
    "thirteenth",
    "fourteenth",
    "fifteenth",
    "sixteenth",
    "seventeenth",
    "eighteenth",
    "nineteenth",
    "twentieth",
];

const CARDINALS: [&str; 20] = [
    "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten", "eleven",
    "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen", "nineteen",
    "twenty",
];

/// Returns the 1-based page a query refers to, if any.
///
/// Numeric patterns win; otherwise the word right before "page"/"pages" is
/// read as a number or an ordinal up to "twentieth".
pub fn extract_page_reference(query: &str) -> Option<u32> {
    let numeric = NUMERIC_PATTERNS
        .iter()
        .filter_map(|pattern| pattern.captures(query))
        .filter_map(|captures| captures.get(1))
        .min_by_key(|capture| capture.start())
        .and_then(|capture| capture.as_str().parse::<u32>().ok());

    numeric
        .or_else(|| from_words(query))
        .filter(|page| *page >= 1)
}

fn from_words(query: &str) -> Option<u32> {
    let tokens = query
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>();

    tokens
        .windows(2)
        .filter(|pair| pair[1] == "page" || pair[1] == "pages")
        .find_map(|pair| word_value(&pair[0]))
}

fn word_value(word: &str) -> Option<u32> {
    if let Ok(number) = word.parse::<u32>() {
        return Some(number);
    }
    ORDINALS
        .iter()
        .chain(CARDINALS.iter())
        .position(|candidate| *candidate == word)
        .map(|position| (position % 20) as u32 + 1)
}
