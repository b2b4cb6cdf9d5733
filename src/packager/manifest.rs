use chrono::{DateTime, Utc};
use std::fmt::Write;

use crate::batch::Job;

pub const MANIFEST_NAME: &str = "VATProof_Summary.txt";

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const MAX_COMPANY_CHARS: usize = 50;

/// Company name fit for a file name: forbidden characters replaced, length capped
pub fn sanitize_company(name: Option<&str>) -> String {
    let cleaned: String = name
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if FORBIDDEN.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .take(MAX_COMPANY_CHARS)
        .collect();

    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        "Unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Base entry name for a job's proof, before collision suffixes
pub fn proof_entry_name(job: &Job, fallback_time: DateTime<Utc>) -> String {
    let company = job.verified_name.as_deref().or(job.company_name.as_deref());
    let stamp = job.verified_at.unwrap_or(fallback_time);
    format!(
        "{}{}_{}_{}",
        job.country_code,
        job.vat_number,
        sanitize_company(company),
        stamp.format("%Y%m%d_%H%M%S")
    )
}

fn or_na(value: Option<&str>) -> &str {
    value.filter(|v| !v.trim().is_empty()).unwrap_or("N/A")
}

/// Human-readable summary placed at the root of the archive
pub fn render(batch_id: &str, generated_at: DateTime<Utc>, jobs: &[&Job]) -> String {
    let mut out = String::new();
    let rule = "=".repeat(64);

    let _ = writeln!(out, "VATProof - Intra-community VAT verification proofs");
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out);
    let _ = writeln!(out, "Batch: {}", batch_id);
    let _ = writeln!(out, "Generated: {}", generated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(out, "Proof documents: {}", jobs.len());
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Each document was issued by the official registry at the time of"
    );
    let _ = writeln!(
        out,
        "verification and evidences the validity of the VAT number on that date."
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "VERIFICATIONS");
    let _ = writeln!(out, "{}", "-".repeat(13));
    let _ = writeln!(out);

    for (idx, job) in jobs.iter().enumerate() {
        let verified = job
            .verified_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string());
        let _ = writeln!(out, "{}. VAT number: {}{}", idx + 1, job.country_code, job.vat_number);
        let _ = writeln!(
            out,
            "   Company: {}",
            or_na(job.verified_name.as_deref().or(job.company_name.as_deref()))
        );
        let _ = writeln!(out, "   Address: {}", or_na(job.verified_address.as_deref()));
        let _ = writeln!(out, "   Verified: {}", or_na(verified.as_deref()));
        let _ = writeln!(out, "   Status: VALID");
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "{}", rule);
    out
}
