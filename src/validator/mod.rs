//! Format validation for raw VAT strings
//!
//! Pure and deterministic: the same input list always yields the same report,
//! in input order, with 1-based line numbers preserved for echoing back to
//! the submitter. Nothing here touches the network or the ledger.

pub mod countries;
mod report;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub use countries::{country_name, supported_countries};
pub use report::{Candidate, ValidationReport};

const MIN_CLEANED_LEN: usize = 3;
const MAX_CLEANED_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    TooShort,
    TooLong,
    UnknownCountry,
    FormatMismatch,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InvalidReason::TooShort => "too short",
            InvalidReason::TooLong => "too long",
            InvalidReason::UnknownCountry => "missing/unknown country code",
            InvalidReason::FormatMismatch => "does not match the country format",
        };
        f.write_str(text)
    }
}

/// Outcome for one input line. Transient: never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub line_number: usize,
    pub original: String,
    pub cleaned: String,
    pub country_code: Option<String>,
    pub number: Option<String>,
    /// Format validity; a duplicate is still format-valid
    pub is_valid: bool,
    pub is_duplicate: bool,
    pub duplicate_of_line: Option<usize>,
    pub error: Option<InvalidReason>,
    /// Fix-up hints for an invalid entry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

/// Keep ASCII letters and digits only, uppercased.
pub fn clean(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Split a cleaned string into `(country, number)` and check the country format.
pub fn classify(cleaned: &str) -> Result<(&str, &str), InvalidReason> {
    if cleaned.len() < MIN_CLEANED_LEN {
        return Err(InvalidReason::TooShort);
    }
    if cleaned.len() > MAX_CLEANED_LEN {
        return Err(InvalidReason::TooLong);
    }

    let (prefix, number) = cleaned.split_at(2);
    if !prefix.chars().all(|c| c.is_ascii_alphabetic()) || !countries::is_supported(prefix) {
        return Err(InvalidReason::UnknownCountry);
    }

    if !countries::matches(prefix, number) {
        return Err(InvalidReason::FormatMismatch);
    }

    Ok((prefix, number))
}

/// Validate a list of raw strings.
///
/// Valid entries are deduplicated on `(country, number)`: the first occurrence
/// is canonical, later ones are flagged and point back at its line.
pub fn validate<I, S>(raw: I) -> ValidationReport
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen: HashMap<(String, String), usize> = HashMap::new();
    let mut results = Vec::new();

    for (index, item) in raw.into_iter().enumerate() {
        let line_number = index + 1;
        let original = item.as_ref().to_string();
        let cleaned = clean(&original);

        let result = match classify(&cleaned) {
            Ok((country, number)) => {
                let key = (country.to_string(), number.to_string());
                let duplicate_of_line = seen.get(&key).copied();
                if duplicate_of_line.is_none() {
                    seen.insert(key, line_number);
                }
                ValidationResult {
                    line_number,
                    country_code: Some(country.to_string()),
                    number: Some(number.to_string()),
                    original,
                    cleaned,
                    is_valid: true,
                    is_duplicate: duplicate_of_line.is_some(),
                    duplicate_of_line,
                    error: None,
                    hints: Vec::new(),
                }
            }
            Err(reason) => {
                // Keep whatever prefix was recognized so the UI can echo it
                let country_code = (cleaned.len() >= 2)
                    .then(|| &cleaned[..2])
                    .filter(|prefix| countries::is_supported(prefix))
                    .map(str::to_string);
                let number = country_code.as_ref().map(|_| cleaned[2..].to_string());
                let hints = suggest_corrections(&original);
                ValidationResult {
                    line_number,
                    original,
                    country_code,
                    number,
                    cleaned,
                    is_valid: false,
                    is_duplicate: false,
                    duplicate_of_line: None,
                    error: Some(reason),
                    hints,
                }
            }
        };
        results.push(result);
    }

    ValidationReport::from_results(results)
}

/// Human-friendly rendering, e.g. `FR 12 345 678 901`.
pub fn format_display(country: &str, number: &str) -> String {
    if country.is_empty() || number.is_empty() {
        return String::new();
    }

    match (country, number.len()) {
        ("FR", 11) => format!(
            "FR {} {} {} {}",
            &number[..2],
            &number[2..5],
            &number[5..8],
            &number[8..]
        ),
        ("DE", 9) => format!("DE {} {} {}", &number[..3], &number[3..6], &number[6..]),
        ("NL", 12) => format!("NL {} {}", &number[..9], &number[9..]),
        _ => format!("{country} {number}"),
    }
}

/// Hints for fixing an entry that failed validation.
pub fn suggest_corrections(raw: &str) -> Vec<String> {
    let cleaned = clean(raw);
    if cleaned.is_empty() {
        return vec!["Enter a non-empty VAT number".to_string()];
    }

    let prefix: String = cleaned.chars().take(2).collect();
    if prefix.len() < 2 || !prefix.chars().all(|c| c.is_ascii_alphabetic()) {
        return vec!["Add the country prefix at the start (e.g. FR, DE, IT, ES)".to_string()];
    }

    let mut hints = Vec::new();
    let number = &cleaned[2..];

    if !countries::is_supported(&prefix) {
        let mut letters = prefix.chars();
        let (first, second) = (letters.next(), letters.next());
        let close: Vec<&str> = countries::COUNTRIES
            .iter()
            .map(|c| c.code)
            .filter(|code| {
                let mut chars = code.chars();
                chars.next() == first || chars.next() == second
            })
            .take(3)
            .collect();
        if !close.is_empty() {
            hints.push(format!(
                "Country code '{prefix}' is not recognized. Try: {}",
                close.join(", ")
            ));
        }
    } else {
        let expected = match prefix.as_str() {
            "FR" => Some(("French", 11)),
            "DE" => Some(("German", 9)),
            "IT" => Some(("Italian", 11)),
            _ => None,
        };
        if let Some((label, len)) = expected.filter(|(_, len)| number.len() != *len) {
            hints.push(format!("{label} numbers have {len} characters after {prefix}"));
        }
    }

    if hints.is_empty() {
        hints.push("Check the format expected for the country of origin".to_string());
    }
    hints
}
