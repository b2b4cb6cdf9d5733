//! Capability interface over the external verification service
//!
//! One adapter per automation technology implements these traits; the
//! protocol in [`super::protocol`] only ever talks to them.

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("target did not answer in time: {0}")]
    Timeout(String),

    #[error("target unavailable: {0}")]
    Unavailable(String),

    #[error("{step} failed: {message}")]
    Step { step: &'static str, message: String },

    #[error("local I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TargetError {
    fn from(err: std::io::Error) -> Self {
        TargetError::Io(err.to_string())
    }
}

/// Opens independent interaction sessions against the target
#[async_trait]
pub trait VerificationTarget: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Start a fresh session. Any proof document the session downloads must
    /// be written into `download_dir`.
    async fn open(&self, download_dir: &Path) -> Result<Box<dyn TargetSession>, TargetError>;
}

/// One live interaction, used for a single attempt and then closed
#[async_trait]
pub trait TargetSession: Send {
    /// Dismiss a consent interstitial. `Ok(false)` when none was shown.
    async fn dismiss_consent(&mut self) -> Result<bool, TargetError>;

    async fn select_country(&mut self, country_code: &str) -> Result<(), TargetError>;

    async fn enter_number(&mut self, number: &str) -> Result<(), TargetError>;

    async fn submit(&mut self) -> Result<(), TargetError>;

    /// Current page content; polled until a result marker shows up
    async fn content(&mut self) -> Result<String, TargetError>;

    /// Ask for the proof document, which then materializes in the download dir
    async fn request_proof(&mut self) -> Result<(), TargetError>;

    async fn close(&mut self) -> Result<(), TargetError>;
}
