use super::models::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("dispatcher.pool_size must be at least 1")]
    EmptyWorkerPool,

    #[error("dispatcher.channel_size must be at least 1")]
    EmptyChannel,

    #[error("{field}: minimum ({min}) is greater than maximum ({max})")]
    InvertedRange {
        field: &'static str,
        min: String,
        max: String,
    },

    #[error("verifier.target_url must be an http(s) URL, got '{0}'")]
    InvalidTargetUrl(String),

    #[error("verifier.{0} must contain at least one marker")]
    EmptyMarkers(&'static str),

    #[error("verifier.proof_poll_interval must be positive")]
    ZeroPollInterval,

    #[error("packager.archive_prefix must only contain letters, digits, '-' or '_'")]
    InvalidArchivePrefix,

    #[error("server.max_entries_per_submission must be at least 1")]
    InvalidEntryLimit,

    #[error("server.batch_retention must be positive")]
    ZeroRetention,

    #[error("server.admin_token must not be blank")]
    BlankAdminToken,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_server(config)?;
    validate_dispatcher(config)?;
    validate_verifier(config)?;
    validate_packager(config)?;
    Ok(())
}

fn validate_server(config: &Config) -> Result<(), ValidationError> {
    let server = &config.server;
    if server.max_entries_per_submission == 0 {
        return Err(ValidationError::InvalidEntryLimit);
    }
    if server.batch_retention.as_duration().is_zero() {
        return Err(ValidationError::ZeroRetention);
    }
    if server.admin_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(ValidationError::BlankAdminToken);
    }
    Ok(())
}

fn validate_dispatcher(config: &Config) -> Result<(), ValidationError> {
    let dispatcher = &config.dispatcher;

    if dispatcher.pool_size == 0 {
        return Err(ValidationError::EmptyWorkerPool);
    }

    if dispatcher.channel_size == 0 {
        return Err(ValidationError::EmptyChannel);
    }

    if dispatcher.jitter_min > dispatcher.jitter_max {
        return Err(ValidationError::InvertedRange {
            field: "dispatcher.jitter",
            min: dispatcher.jitter_min.to_string(),
            max: dispatcher.jitter_max.to_string(),
        });
    }

    if dispatcher.backoff_base > dispatcher.backoff_max {
        return Err(ValidationError::InvertedRange {
            field: "dispatcher.backoff",
            min: dispatcher.backoff_base.to_string(),
            max: dispatcher.backoff_max.to_string(),
        });
    }

    Ok(())
}

fn validate_verifier(config: &Config) -> Result<(), ValidationError> {
    let verifier = &config.verifier;

    let url = verifier.target_url.trim();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ValidationError::InvalidTargetUrl(verifier.target_url.clone()));
    }

    let marker_sets = [
        ("valid_markers", &verifier.valid_markers),
        ("invalid_markers", &verifier.invalid_markers),
        ("rejected_markers", &verifier.rejected_markers),
    ];
    for (name, set) in marker_sets {
        if set.iter().all(|m| m.trim().is_empty()) {
            return Err(ValidationError::EmptyMarkers(name));
        }
    }

    if verifier.proof_poll_interval.as_duration().is_zero() {
        return Err(ValidationError::ZeroPollInterval);
    }

    Ok(())
}

fn validate_packager(config: &Config) -> Result<(), ValidationError> {
    let prefix = &config.packager.archive_prefix;
    let allowed = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if prefix.is_empty() || !prefix.chars().all(allowed) {
        return Err(ValidationError::InvalidArchivePrefix);
    }
    Ok(())
}
