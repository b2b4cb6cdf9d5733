//! Member-state VAT number formats
//!
//! Patterns apply to the part after the two-letter prefix and are anchored
//! when compiled, so a number is valid only if it matches its country's
//! pattern in full.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// One VIES member state: prefix, English name and number pattern
#[derive(Debug, Clone, Copy)]
pub struct Country {
    pub code: &'static str,
    pub name: &'static str,
    pattern: &'static str,
}

const fn country(code: &'static str, name: &'static str, pattern: &'static str) -> Country {
    Country {
        code,
        name,
        pattern,
    }
}

pub static COUNTRIES: &[Country] = &[
    country("AT", "Austria", r"U\d{8}"),
    country("BE", "Belgium", r"\d{10}"),
    country("BG", "Bulgaria", r"\d{9,10}"),
    country("CY", "Cyprus", r"\d{8}[A-Z]"),
    country("CZ", "Czech Republic", r"\d{8,10}"),
    country("DE", "Germany", r"\d{9}"),
    country("DK", "Denmark", r"\d{8}"),
    country("EE", "Estonia", r"\d{9}"),
    country("EL", "Greece", r"\d{9}"),
    country("ES", "Spain", r"[A-Z]\d{7}[A-Z]|\d{8}[A-Z]|[A-Z]\d{8}"),
    country("FI", "Finland", r"\d{8}"),
    country("FR", "France", r"[A-Z]{2}\d{9}|\d{11}"),
    country("HR", "Croatia", r"\d{11}"),
    country("HU", "Hungary", r"\d{8}"),
    country("IE", "Ireland", r"\d[A-Z\d]\d{5}[A-Z]|\d{7}[A-Z]{1,2}"),
    country("IT", "Italy", r"\d{11}"),
    country("LT", "Lithuania", r"\d{9}|\d{12}"),
    country("LU", "Luxembourg", r"\d{8}"),
    country("LV", "Latvia", r"\d{11}"),
    country("MT", "Malta", r"\d{8}"),
    country("NL", "Netherlands", r"\d{9}B\d{2}"),
    country("PL", "Poland", r"\d{10}"),
    country("PT", "Portugal", r"\d{9}"),
    country("RO", "Romania", r"\d{2,10}"),
    country("SE", "Sweden", r"\d{12}"),
    country("SI", "Slovenia", r"\d{8}"),
    country("SK", "Slovakia", r"\d{10}"),
];

static PATTERNS: LazyLock<HashMap<&'static str, Regex>> = LazyLock::new(|| {
    COUNTRIES
        .iter()
        .map(|c| {
            let anchored = format!("^(?:{})$", c.pattern);
            let regex = Regex::new(&anchored).expect("Invalid country pattern");
            (c.code, regex)
        })
        .collect()
});

pub fn lookup(code: &str) -> Option<&'static Country> {
    COUNTRIES.iter().find(|c| c.code == code)
}

pub fn is_supported(code: &str) -> bool {
    PATTERNS.contains_key(code)
}

/// `false` for unknown countries as well as for non-matching numbers.
pub fn matches(code: &str, number: &str) -> bool {
    PATTERNS
        .get(code)
        .is_some_and(|regex| regex.is_match(number))
}

/// Country name for display, falling back to the code itself.
pub fn country_name(code: &str) -> &str {
    lookup(code).map(|c| c.name).unwrap_or(code)
}

/// Codes and names of every supported member state, in table order
pub fn supported_countries() -> Vec<(&'static str, &'static str)> {
    COUNTRIES.iter().map(|c| (c.code, c.name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_complete() {
        assert_eq!(COUNTRIES.len(), 27);
        assert_eq!(supported_countries().len(), 27);
        assert!(is_supported("EL"));
        // ISO code for Greece is not the VIES prefix
        assert!(!is_supported("GR"));
    }

    #[test]
    fn test_patterns_are_anchored() {
        assert!(matches("DE", "123456789"));
        assert!(!matches("DE", "1234567890"));
        assert!(!matches("DE", "X123456789"));
    }

    #[test]
    fn test_alternative_patterns() {
        assert!(matches("FR", "12345678901"));
        assert!(matches("FR", "AB123456789"));
        assert!(!matches("FR", "A1234567890"));

        assert!(matches("ES", "A1234567B"));
        assert!(matches("ES", "12345678Z"));
        assert!(matches("ES", "X12345678"));

        assert!(matches("IE", "1234567WA"));
        assert!(matches("IE", "1A23456B"));

        assert!(matches("NL", "123456789B01"));
        assert!(!matches("NL", "123456789C01"));

        assert!(matches("AT", "U12345678"));
    }

    #[test]
    fn test_country_name() {
        assert_eq!(country_name("FR"), "France");
        assert_eq!(country_name("ZZ"), "ZZ");
    }
}
