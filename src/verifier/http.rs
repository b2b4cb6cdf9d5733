//! Form-posting adapter over reqwest
//!
//! Drives the registry's public check form with plain HTTP: the landing page
//! is fetched on open, the form is posted on submit and the proof link found
//! on the result page is downloaded into the attempt directory.

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

use super::target::{TargetError, TargetSession, VerificationTarget};
use crate::config::VerifierConfig;

static PROOF_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href\s*=\s*["']([^"']*(?:\.pdf|pdf[^"']*))["']"#)
        .expect("Invalid proof link pattern")
});

const CONSENT_MARKERS: &[&str] = &["cookie-consent", "cck-actions", "accept all cookies"];

/// HTTP client settings for the adapter
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl HttpConfig {
    pub fn from_verifier(config: &VerifierConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: config.request_timeout.as_duration(),
            user_agent: config.user_agent.clone(),
        }
    }
}

pub struct HttpFormTarget {
    client: Client,
    base_url: Url,
}

impl HttpFormTarget {
    pub fn new(base_url: &str, config: HttpConfig) -> Result<Self, TargetError> {
        let base_url = Url::parse(base_url).map_err(|e| TargetError::Step {
            step: "configure",
            message: format!("invalid target url: {}", e),
        })?;

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| TargetError::Step {
                step: "configure",
                message: e.to_string(),
            })?;

        Ok(Self { client, base_url })
    }

    pub fn from_config(config: &VerifierConfig) -> Result<Self, TargetError> {
        Self::new(&config.target_url, HttpConfig::from_verifier(config))
    }
}

fn request_error(step: &'static str, err: reqwest::Error) -> TargetError {
    if err.is_timeout() {
        TargetError::Timeout(format!("{}: {}", step, err))
    } else if err.is_connect() {
        TargetError::Unavailable(format!("{}: {}", step, err))
    } else {
        TargetError::Step {
            step,
            message: err.to_string(),
        }
    }
}

fn status_error(step: &'static str, status: StatusCode) -> TargetError {
    let message = format!(
        "HTTP {}: {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        TargetError::Unavailable(message)
    } else {
        TargetError::Step { step, message }
    }
}

#[async_trait]
impl VerificationTarget for HttpFormTarget {
    fn name(&self) -> &str {
        "http-form"
    }

    async fn open(&self, download_dir: &Path) -> Result<Box<dyn TargetSession>, TargetError> {
        let landing = fetch_text(&self.client, self.base_url.clone(), "open").await?;
        Ok(Box::new(HttpFormSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            download_dir: download_dir.to_path_buf(),
            country: String::new(),
            number: String::new(),
            page: landing,
            result_url: None,
        }))
    }
}

async fn fetch_text(client: &Client, url: Url, step: &'static str) -> Result<String, TargetError> {
    debug!(%url, step, "GET");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| request_error(step, e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(status_error(step, status));
    }
    response.text().await.map_err(|e| request_error(step, e))
}

struct HttpFormSession {
    client: Client,
    base_url: Url,
    download_dir: PathBuf,
    country: String,
    number: String,
    page: String,
    result_url: Option<Url>,
}

#[async_trait]
impl TargetSession for HttpFormSession {
    async fn dismiss_consent(&mut self) -> Result<bool, TargetError> {
        // A plain HTTP client never renders the banner; only report it
        let lower = self.page.to_lowercase();
        Ok(CONSENT_MARKERS.iter().any(|m| lower.contains(m)))
    }

    async fn select_country(&mut self, country_code: &str) -> Result<(), TargetError> {
        self.country = country_code.to_string();
        Ok(())
    }

    async fn enter_number(&mut self, number: &str) -> Result<(), TargetError> {
        self.number = number.to_string();
        Ok(())
    }

    async fn submit(&mut self) -> Result<(), TargetError> {
        let form = [
            ("memberStateCode", self.country.as_str()),
            ("number", self.number.as_str()),
            ("action", "check"),
        ];

        debug!(url = %self.base_url, country = %self.country, "POST verification form");
        let response = self
            .client
            .post(self.base_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| request_error("submit", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("submit", status));
        }
        self.result_url = Some(response.url().clone());
        self.page = response
            .text()
            .await
            .map_err(|e| request_error("submit", e))?;
        Ok(())
    }

    async fn content(&mut self) -> Result<String, TargetError> {
        Ok(self.page.clone())
    }

    async fn request_proof(&mut self) -> Result<(), TargetError> {
        let link = PROOF_LINK_RE
            .captures(&self.page)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().replace("&amp;", "&"));
        let Some(link) = link else {
            return Err(TargetError::Step {
                step: "request_proof",
                message: "no proof link on result page".to_string(),
            });
        };

        let base = self.result_url.as_ref().unwrap_or(&self.base_url);
        let url = base.join(&link).map_err(|e| TargetError::Step {
            step: "request_proof",
            message: format!("bad proof link {}: {}", link, e),
        })?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error("request_proof", e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error("request_proof", status));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| request_error("request_proof", e))?;

        // Written under a partial name first so pollers never read half a file
        let partial = self.download_dir.join("proof.pdf.part");
        let done = self
            .download_dir
            .join(format!("{}{}.pdf", self.country, self.number));
        tokio::fs::write(&partial, &bytes).await?;
        tokio::fs::rename(&partial, &done).await?;

        debug!(size = bytes.len(), "Proof document downloaded");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TargetError> {
        self.page.clear();
        Ok(())
    }
}
