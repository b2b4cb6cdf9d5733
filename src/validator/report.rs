use super::{ValidationResult, countries, format_display};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

const RENDER_LIMIT: usize = 10;

/// Aggregate view over a validated list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total: usize,
    /// Valid and not a duplicate
    pub valid: usize,
    pub invalid: usize,
    pub duplicates: usize,
    /// Per-country count over non-duplicate valid entries
    pub countries: BTreeMap<String, usize>,
    pub results: Vec<ValidationResult>,
}

/// A valid, non-duplicate entry ready to become a Job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub country_code: String,
    pub number: String,
    pub original: String,
    pub line_number: usize,
}

impl ValidationReport {
    pub(super) fn from_results(results: Vec<ValidationResult>) -> Self {
        let mut report = ValidationReport {
            total: results.len(),
            valid: 0,
            invalid: 0,
            duplicates: 0,
            countries: BTreeMap::new(),
            results: Vec::new(),
        };

        for result in &results {
            match (result.is_valid, result.is_duplicate) {
                (false, _) => report.invalid += 1,
                (true, true) => report.duplicates += 1,
                (true, false) => {
                    report.valid += 1;
                    if let Some(code) = &result.country_code {
                        *report.countries.entry(code.clone()).or_default() += 1;
                    }
                }
            }
        }

        report.results = results;
        report
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationResult> {
        self.results.iter().filter(|r| !r.is_valid)
    }

    pub fn duplicate_entries(&self) -> impl Iterator<Item = &ValidationResult> {
        self.results.iter().filter(|r| r.is_duplicate)
    }

    /// Entries to turn into Jobs, in input order.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.results
            .iter()
            .filter(|r| r.is_valid && !r.is_duplicate)
            .filter_map(|r| {
                Some(Candidate {
                    country_code: r.country_code.clone()?,
                    number: r.number.clone()?,
                    original: r.original.clone(),
                    line_number: r.line_number,
                })
            })
            .collect()
    }

    /// Plain-text summary for download or terminal output.
    pub fn render_text(&self, source: Option<&str>) -> String {
        let rule = "=".repeat(50);
        let thin = "-".repeat(40);
        let mut out = String::new();

        // Writing into a String cannot fail
        let _ = writeln!(out, "VAT VALIDATION REPORT");
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out);
        let _ = writeln!(out, "Source: {}", source.unwrap_or("manual entry"));
        let _ = writeln!(
            out,
            "Date: {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "SUMMARY:");
        let _ = writeln!(out, "- Numbers analysed: {}", self.total);
        let _ = writeln!(out, "- Valid: {}", self.valid);
        let _ = writeln!(out, "- Invalid: {}", self.invalid);
        let _ = writeln!(out, "- Duplicates: {}", self.duplicates);
        let _ = writeln!(out);
        let _ = writeln!(out, "BY COUNTRY:");
        if self.countries.is_empty() {
            let _ = writeln!(out, "- No country detected");
        }
        for (code, count) in &self.countries {
            let _ = writeln!(
                out,
                "- {} ({code}): {count} number(s)",
                countries::country_name(code)
            );
        }

        if self.invalid > 0 {
            let _ = writeln!(out);
            let _ = writeln!(out, "ERRORS ({}):", self.invalid);
            let _ = writeln!(out, "{thin}");
            for entry in self.errors().take(RENDER_LIMIT) {
                let reason = entry.error.map(|e| e.to_string()).unwrap_or_default();
                let _ = writeln!(
                    out,
                    "Line {}: '{}' - {reason}",
                    entry.line_number, entry.original
                );
                if let Some(hint) = entry.hints.first() {
                    let _ = writeln!(out, "  hint: {hint}");
                }
            }
            if self.invalid > RENDER_LIMIT {
                let _ = writeln!(out, "... and {} more error(s)", self.invalid - RENDER_LIMIT);
            }
        }

        if self.duplicates > 0 {
            let _ = writeln!(out);
            let _ = writeln!(out, "DUPLICATES ({}):", self.duplicates);
            let _ = writeln!(out, "{thin}");
            for entry in self.duplicate_entries().take(RENDER_LIMIT) {
                let shown = match (&entry.country_code, &entry.number) {
                    (Some(cc), Some(num)) => format_display(cc, num),
                    _ => entry.original.clone(),
                };
                let first = entry
                    .duplicate_of_line
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "?".to_string());
                let _ = writeln!(
                    out,
                    "Line {}: '{shown}' (same as line {first})",
                    entry.line_number
                );
            }
            if self.duplicates > RENDER_LIMIT {
                let _ = writeln!(
                    out,
                    "... and {} more duplicate(s)",
                    self.duplicates - RENDER_LIMIT
                );
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "{rule}");
        out
    }
}
