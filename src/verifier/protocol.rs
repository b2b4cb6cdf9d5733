//! One verification attempt, end to end
//!
//! open session → dismiss consent → select country → enter number → submit →
//! wait for a result marker → classify → capture counterparty → (valid only)
//! request and wait for the proof document → close session.
//!
//! Every attempt runs in its own scratch directory, removed when the attempt
//! ends whatever the outcome.

use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::target::{TargetSession, VerificationTarget};
use super::{ProofCapture, ProofDocument, ProtocolError, VerificationOutcome};
use crate::config::VerifierConfig;

/// Bounded excerpt of page content kept in the trace
const TRACE_CONTENT_LIMIT: usize = 4000;

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("Invalid tag pattern"));

/// Classification of the result page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Valid,
    Invalid,
    Rejected,
    Unavailable,
    Indeterminate,
}

/// Case-insensitive content markers for each result class
#[derive(Debug, Clone)]
pub struct Markers {
    valid: Vec<String>,
    invalid: Vec<String>,
    rejected: Vec<String>,
    unavailable: Vec<String>,
}

impl Markers {
    pub fn from_config(config: &VerifierConfig) -> Self {
        let lower = |values: &[String]| -> Vec<String> {
            values
                .iter()
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .collect()
        };
        Self {
            valid: lower(&config.valid_markers),
            invalid: lower(&config.invalid_markers),
            rejected: lower(&config.rejected_markers),
            unavailable: lower(&config.unavailable_markers),
        }
    }

    /// Classify page content.
    ///
    /// Error classes win over verdicts, and the invalid verdict is checked
    /// before the valid one since "invalid" markers often contain "valid" ones.
    pub fn classify(&self, content: &str) -> Classification {
        let content = content.to_lowercase();
        let hit = |markers: &[String]| markers.iter().any(|m| content.contains(m.as_str()));

        if hit(&self.unavailable) {
            Classification::Unavailable
        } else if hit(&self.rejected) {
            Classification::Rejected
        } else if hit(&self.invalid) {
            Classification::Invalid
        } else if hit(&self.valid) {
            Classification::Valid
        } else {
            Classification::Indeterminate
        }
    }
}

/// Timing bounds for one attempt
#[derive(Debug, Clone, Copy)]
pub struct ProtocolTimings {
    pub result_timeout: Duration,
    pub proof_timeout: Duration,
    pub poll_interval: Duration,
}

impl ProtocolTimings {
    pub fn from_config(config: &VerifierConfig) -> Self {
        Self {
            result_timeout: config.result_timeout.as_duration(),
            proof_timeout: config.proof_timeout.as_duration(),
            poll_interval: config.proof_poll_interval.as_duration(),
        }
    }
}

/// Step log accumulated during an attempt, kept for audit
#[derive(Debug, Default)]
struct Trace {
    lines: Vec<String>,
}

impl Trace {
    fn step(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!(step = %line, "Protocol step");
        self.lines.push(line);
    }

    fn content(&mut self, content: &str) {
        let excerpt: String = content.chars().take(TRACE_CONTENT_LIMIT).collect();
        self.lines.push(format!("content: {}", excerpt));
    }

    fn render(&self) -> String {
        self.lines.join("\n")
    }
}

/// What the drive phase learned before the session was closed
struct Drive {
    is_valid: bool,
    company_name: Option<String>,
    company_address: Option<String>,
    proof: ProofCapture,
}

/// Drives the interaction against a [`VerificationTarget`]
pub struct VerifierProtocol {
    target: Arc<dyn VerificationTarget>,
    markers: Markers,
    timings: ProtocolTimings,
}

impl VerifierProtocol {
    pub fn new(target: Arc<dyn VerificationTarget>, config: &VerifierConfig) -> Self {
        Self {
            target,
            markers: Markers::from_config(config),
            timings: ProtocolTimings::from_config(config),
        }
    }

    pub fn with_timings(
        target: Arc<dyn VerificationTarget>,
        markers: Markers,
        timings: ProtocolTimings,
    ) -> Self {
        Self {
            target,
            markers,
            timings,
        }
    }

    pub fn target_name(&self) -> &str {
        self.target.name()
    }

    /// Run one attempt. Never panics and never leaves a session open.
    pub async fn verify(&self, country_code: &str, vat_number: &str) -> VerificationOutcome {
        let mut trace = Trace::default();
        trace.step(format!(
            "verify {}{} via {}",
            country_code,
            vat_number,
            self.target.name()
        ));

        let result = self.attempt(country_code, vat_number, &mut trace).await;

        match result {
            Ok(drive) => {
                info!(
                    country_code,
                    vat_number,
                    is_valid = drive.is_valid,
                    proof = drive.proof.is_captured(),
                    "Verification attempt finished"
                );
                VerificationOutcome {
                    success: true,
                    is_valid: Some(drive.is_valid),
                    company_name: drive.company_name,
                    company_address: drive.company_address,
                    verified_at: Some(Utc::now()),
                    proof: drive.proof,
                    raw_trace: trace.render(),
                    error: None,
                }
            }
            Err(error) => {
                warn!(
                    country_code,
                    vat_number,
                    code = error.code(),
                    error = %error,
                    "Verification attempt failed"
                );
                trace.step(format!("error: {}", error));
                VerificationOutcome::failed(error, trace.render())
            }
        }
    }

    async fn attempt(
        &self,
        country_code: &str,
        vat_number: &str,
        trace: &mut Trace,
    ) -> Result<Drive, ProtocolError> {
        let workdir = tempfile::Builder::new()
            .prefix("vatproof-attempt-")
            .tempdir()
            .map_err(|e| ProtocolError::Target(e.into()))?;

        let mut session = self.target.open(workdir.path()).await?;
        trace.step("session opened");

        let result = self
            .drive(session.as_mut(), country_code, vat_number, workdir.path(), trace)
            .await;

        match session.close().await {
            Ok(()) => trace.step("session closed"),
            Err(e) => {
                warn!(error = %e, "Failed to close target session");
                trace.step(format!("session close failed: {}", e));
            }
        }

        // workdir is removed on drop
        result
    }

    async fn drive(
        &self,
        session: &mut dyn TargetSession,
        country_code: &str,
        vat_number: &str,
        download_dir: &Path,
        trace: &mut Trace,
    ) -> Result<Drive, ProtocolError> {
        // Best effort: a broken consent banner must not sink the attempt
        match session.dismiss_consent().await {
            Ok(true) => trace.step("consent dismissed"),
            Ok(false) => trace.step("no consent prompt"),
            Err(e) => trace.step(format!("consent dismissal failed: {}", e)),
        }

        session.select_country(country_code).await?;
        trace.step(format!("country selected: {}", country_code));

        session.enter_number(vat_number).await?;
        trace.step("number entered");

        session.submit().await?;
        trace.step("form submitted");

        let (classification, content) = self.wait_for_result(session).await?;
        trace.content(&content);
        trace.step(format!("classified: {:?}", classification));

        let is_valid = match classification {
            Classification::Valid => true,
            Classification::Invalid => false,
            Classification::Rejected => {
                return Err(ProtocolError::Rejected(
                    "target rejected the input format".to_string(),
                ));
            }
            Classification::Unavailable => {
                return Err(ProtocolError::Unavailable(
                    "target reported the service as unavailable".to_string(),
                ));
            }
            Classification::Indeterminate => return Err(ProtocolError::Indeterminate),
        };

        let (company_name, company_address) = extract_counterparty(&content);

        let proof = if is_valid {
            self.capture_proof(session, download_dir, trace).await
        } else {
            ProofCapture::NotRequested
        };

        Ok(Drive {
            is_valid,
            company_name,
            company_address,
            proof,
        })
    }

    /// Poll page content until a marker shows up or the result timeout passes
    async fn wait_for_result(
        &self,
        session: &mut dyn TargetSession,
    ) -> Result<(Classification, String), ProtocolError> {
        let deadline = Instant::now() + self.timings.result_timeout;
        let mut last = String::new();

        loop {
            let content = session.content().await?;
            let classification = self.markers.classify(&content);
            if classification != Classification::Indeterminate {
                return Ok((classification, content));
            }
            last = if content.is_empty() { last } else { content };

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.timings.poll_interval).await;
        }

        if last.trim().is_empty() {
            Err(ProtocolError::Timeout {
                stage: "result",
                after: self.timings.result_timeout,
            })
        } else {
            Ok((Classification::Indeterminate, last))
        }
    }

    /// Request the proof document and wait for it in the download directory.
    ///
    /// Any failure here leaves the verdict standing with the proof missing.
    async fn capture_proof(
        &self,
        session: &mut dyn TargetSession,
        download_dir: &Path,
        trace: &mut Trace,
    ) -> ProofCapture {
        if let Err(e) = session.request_proof().await {
            trace.step(format!("proof request failed: {}", e));
            return ProofCapture::Missing;
        }
        trace.step("proof requested");

        let deadline = Instant::now() + self.timings.proof_timeout;
        loop {
            let found = match find_proof(download_dir).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(error = %e, "Failed to scan download directory");
                    trace.step(format!("proof lookup failed: {}", e));
                    return ProofCapture::Missing;
                }
            };

            if let Some(path) = found {
                let bytes = match tokio::fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to read proof document");
                        trace.step(format!("proof read failed: {}", e));
                        return ProofCapture::Missing;
                    }
                };
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "proof.pdf".to_string());
                trace.step(format!("proof captured: {} ({} bytes)", file_name, bytes.len()));
                return ProofCapture::Captured(ProofDocument { file_name, bytes });
            }

            if Instant::now() >= deadline {
                trace.step("proof did not appear in time");
                return ProofCapture::Missing;
            }
            tokio::time::sleep(self.timings.poll_interval).await;
        }
    }
}

/// First finished PDF in the download directory. Partial downloads are skipped.
async fn find_proof(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_pdf = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if is_pdf {
            found.push(path);
        }
    }

    found.sort();
    Ok(found.into_iter().next())
}

/// Flatten markup into trimmed, non-empty text lines
fn text_lines(content: &str) -> Vec<String> {
    let text = TAG_RE.replace_all(content, "\n");
    text.lines()
        .map(|line| {
            line.replace("&amp;", "&")
                .replace("&nbsp;", " ")
                .replace("&#39;", "'")
                .replace("&quot;", "\"")
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .collect()
}

/// Value following a label, either on the same line ("Name: X") or the next
fn field_after(lines: &[String], label: &str) -> Option<String> {
    for (idx, line) in lines.iter().enumerate() {
        if line.eq_ignore_ascii_case(label) {
            return lines.get(idx + 1).cloned().and_then(meaningful);
        }
        let inline = line
            .get(..label.len())
            .filter(|head| head.eq_ignore_ascii_case(label))
            .and_then(|_| line[label.len()..].trim_start().strip_prefix(':'));
        if let Some(value) = inline {
            return meaningful(value.to_string());
        }
    }
    None
}

fn meaningful(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '-') {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Counterparty name and address from the result page, when shown
pub fn extract_counterparty(content: &str) -> (Option<String>, Option<String>) {
    let lines = text_lines(content);
    (field_after(&lines, "name"), field_after(&lines, "address"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::scripted::{Script, ScriptedTarget};

    fn timings() -> ProtocolTimings {
        ProtocolTimings {
            result_timeout: Duration::from_secs(5),
            proof_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(500),
        }
    }

    fn protocol(target: Arc<ScriptedTarget>) -> VerifierProtocol {
        VerifierProtocol::with_timings(
            target,
            Markers::from_config(&VerifierConfig::default()),
            timings(),
        )
    }

    #[test]
    fn test_classify_order() {
        let markers = Markers::from_config(&VerifierConfig::default());
        assert_eq!(markers.classify("<div class='invalidStyle'>"), Classification::Invalid);
        assert_eq!(markers.classify("<div class='validStyle'>"), Classification::Valid);
        assert_eq!(markers.classify("MS_UNAVAILABLE"), Classification::Unavailable);
        assert_eq!(markers.classify("INVALID_INPUT"), Classification::Rejected);
        assert_eq!(markers.classify("<html>loading</html>"), Classification::Indeterminate);
    }

    #[test]
    fn test_extract_counterparty() {
        let page = "<table><tr><td>Name</td><td>ACME &amp; Sons SARL</td></tr>\
                    <tr><td>Address</td><td>1 Rue de Paris</td></tr></table>";
        let (name, address) = extract_counterparty(page);
        assert_eq!(name.as_deref(), Some("ACME & Sons SARL"));
        assert_eq!(address.as_deref(), Some("1 Rue de Paris"));

        let (name, address) = extract_counterparty("Name: Beta GmbH\nAddress: ---");
        assert_eq!(name.as_deref(), Some("Beta GmbH"));
        assert_eq!(address, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_with_proof() {
        let target = Arc::new(ScriptedTarget::new());
        target.push(Script::valid("ACME SA").with_proof(b"%PDF-proof".to_vec()));

        let outcome = protocol(target.clone()).verify("FR", "12345678901").await;
        assert!(outcome.success);
        assert_eq!(outcome.is_valid, Some(true));
        assert_eq!(outcome.company_name.as_deref(), Some("ACME SA"));
        match &outcome.proof {
            ProofCapture::Captured(doc) => assert_eq!(doc.bytes, b"%PDF-proof"),
            other => panic!("expected proof, got {:?}", other),
        }
        assert_eq!(target.closed_sessions(), 1);
        assert!(outcome.raw_trace.contains("form submitted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_skips_proof() {
        let target = Arc::new(ScriptedTarget::new());
        target.push(Script::invalid());

        let outcome = protocol(target.clone()).verify("DE", "123456789").await;
        assert!(outcome.success);
        assert_eq!(outcome.is_valid, Some(false));
        assert!(matches!(outcome.proof, ProofCapture::NotRequested));
        assert_eq!(target.proof_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_without_proof_is_missing() {
        let target = Arc::new(ScriptedTarget::new());
        target.push(Script::valid("ACME SA"));

        let outcome = protocol(target.clone()).verify("FR", "12345678901").await;
        assert!(outcome.success);
        assert!(matches!(outcome.proof, ProofCapture::Missing));
        assert_eq!(target.proof_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_is_transient() {
        let target = Arc::new(ScriptedTarget::new());
        target.push(Script::page("<p>MS_UNAVAILABLE</p>"));

        let outcome = protocol(target.clone()).verify("IT", "12345678901").await;
        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert!(error.is_transient());
        assert_eq!(error.code(), "UNAVAILABLE");
        assert_eq!(target.closed_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_is_definitive() {
        let target = Arc::new(ScriptedTarget::new());
        target.push(Script::page("INVALID_INPUT"));

        let outcome = protocol(target).verify("IT", "12345678901").await;
        let error = outcome.error.unwrap();
        assert!(!error.is_transient());
        assert_eq!(error.code(), "REJECTED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_content_times_out() {
        let target = Arc::new(ScriptedTarget::new());
        target.push(Script::page(""));

        let outcome = protocol(target.clone()).verify("NL", "123456789B01").await;
        assert!(matches!(
            outcome.error,
            Some(ProtocolError::Timeout { stage: "result", .. })
        ));
        assert_eq!(target.closed_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmarked_content_is_indeterminate() {
        let target = Arc::new(ScriptedTarget::new());
        target.push(Script::page("<html>something else</html>"));

        let outcome = protocol(target).verify("NL", "123456789B01").await;
        assert!(matches!(outcome.error, Some(ProtocolError::Indeterminate)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_failure_still_closes_session() {
        let target = Arc::new(ScriptedTarget::new());
        target.push(Script::fail_submit("connection reset"));

        let outcome = protocol(target.clone()).verify("BE", "0123456789").await;
        assert!(matches!(outcome.error, Some(ProtocolError::Target(_))));
        assert_eq!(target.closed_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_proof_keeps_verdict() {
        let target = Arc::new(ScriptedTarget::new());
        target.push(Script::valid("ACME SA").with_unreadable_proof());

        let outcome = protocol(target.clone()).verify("FR", "12345678901").await;
        assert!(outcome.success);
        assert_eq!(outcome.is_valid, Some(true));
        assert!(outcome.error.is_none());
        assert!(matches!(outcome.proof, ProofCapture::Missing));
        assert!(outcome.proof_missing());
        assert!(outcome.raw_trace.contains("proof read failed"));
        assert_eq!(target.closed_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_after_empty_polls_behind_consent_banner() {
        let target = Arc::new(ScriptedTarget::new().with_consent_banner());
        target.push(
            Script::valid("ACME SA")
                .with_proof(b"%PDF".to_vec())
                .after_empty_polls(4),
        );

        let outcome = protocol(target.clone()).verify("FR", "12345678901").await;
        assert!(outcome.success);
        assert_eq!(outcome.is_valid, Some(true));
        assert!(outcome.proof.is_captured());
        assert!(outcome.raw_trace.contains("consent dismissed"));
        assert!(outcome.raw_trace.contains("classified: Valid"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_later_than_result_timeout() {
        let target = Arc::new(ScriptedTarget::new());
        // 500ms polls against a 5s budget
        target.push(Script::valid("ACME SA").after_empty_polls(50));

        let outcome = protocol(target.clone()).verify("FR", "12345678901").await;
        assert!(matches!(
            outcome.error,
            Some(ProtocolError::Timeout { stage: "result", .. })
        ));
        assert_eq!(target.closed_sessions(), 1);
    }
}
