//! Verification against the external VAT registry
//!
//! [`target`] is the capability seam an automation adapter implements,
//! [`protocol`] drives one attempt through it, [`http`] is the form-posting
//! adapter used in production and [`scripted`] a deterministic one for tests.

pub mod http;
pub mod protocol;
pub mod scripted;
pub mod target;

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub use http::HttpFormTarget;
pub use protocol::{Classification, Markers, ProtocolTimings, VerifierProtocol, extract_counterparty};
pub use target::{TargetError, TargetSession, VerificationTarget};

/// Why an attempt produced no verdict
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("timed out waiting for {stage} after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error("result page carried no recognizable marker")]
    Indeterminate,

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("input rejected: {0}")]
    Rejected(String),

    #[error("target interaction failed: {0}")]
    Target(#[from] TargetError),
}

impl ProtocolError {
    /// Transient failures are retried; a rejection is final
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProtocolError::Rejected(_))
    }

    /// Short code recorded on dead-lettered tasks
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Timeout { .. } => "TIMEOUT",
            ProtocolError::Indeterminate => "INDETERMINATE",
            ProtocolError::Unavailable(_) => "UNAVAILABLE",
            ProtocolError::Rejected(_) => "REJECTED",
            ProtocolError::Target(TargetError::Timeout(_)) => "TIMEOUT",
            ProtocolError::Target(TargetError::Unavailable(_)) => "UNAVAILABLE",
            ProtocolError::Target(_) => "TARGET_ERROR",
        }
    }
}

/// A proof document read out of the attempt's download directory
#[derive(Clone, PartialEq, Eq)]
pub struct ProofDocument {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for ProofDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofDocument")
            .field("file_name", &self.file_name)
            .field("size", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofCapture {
    Captured(ProofDocument),
    /// Valid verdict, but the document never materialized
    Missing,
    /// Invalid verdicts have no proof
    NotRequested,
}

impl ProofCapture {
    pub fn is_captured(&self) -> bool {
        matches!(self, ProofCapture::Captured(_))
    }
}

/// Result of one verification attempt
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub success: bool,
    pub is_valid: Option<bool>,
    pub company_name: Option<String>,
    pub company_address: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub proof: ProofCapture,
    pub raw_trace: String,
    pub error: Option<ProtocolError>,
}

impl VerificationOutcome {
    pub fn failed(error: ProtocolError, raw_trace: String) -> Self {
        Self {
            success: false,
            is_valid: None,
            company_name: None,
            company_address: None,
            verified_at: None,
            proof: ProofCapture::NotRequested,
            raw_trace,
            error: Some(error),
        }
    }

    /// A valid verdict whose proof document is missing
    pub fn proof_missing(&self) -> bool {
        self.success && self.is_valid == Some(true) && !self.proof.is_captured()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProtocolError::Indeterminate.is_transient());
        assert!(ProtocolError::Unavailable("x".into()).is_transient());
        assert!(
            ProtocolError::Timeout {
                stage: "result",
                after: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(ProtocolError::Target(TargetError::Io("disk".into())).is_transient());
        assert!(!ProtocolError::Rejected("bad".into()).is_transient());
    }

    #[test]
    fn test_codes() {
        assert_eq!(
            ProtocolError::Target(TargetError::Unavailable("503".into())).code(),
            "UNAVAILABLE"
        );
        assert_eq!(
            ProtocolError::Target(TargetError::Step {
                step: "submit",
                message: "x".into()
            })
            .code(),
            "TARGET_ERROR"
        );
    }

    #[test]
    fn test_proof_missing() {
        let mut outcome = VerificationOutcome::failed(ProtocolError::Indeterminate, String::new());
        assert!(!outcome.proof_missing());

        outcome.success = true;
        outcome.is_valid = Some(true);
        outcome.proof = ProofCapture::Missing;
        assert!(outcome.proof_missing());

        outcome.is_valid = Some(false);
        assert!(!outcome.proof_missing());
    }
}
