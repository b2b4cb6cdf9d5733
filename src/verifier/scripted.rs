//! Deterministic in-process target for tests and local development
//!
//! Each session plays back one [`Script`]: scripts queued for a specific
//! number win, then the general queue, then the fallback.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::target::{TargetError, TargetSession, VerificationTarget};

/// What one session sees
#[derive(Debug, Clone, Default)]
pub struct Script {
    content: String,
    proof: Option<Vec<u8>>,
    fail_submit: Option<String>,
    /// Content polls answered with an empty page before `content` shows
    empty_polls: usize,
    /// The proof lands as something that cannot be read back
    unreadable_proof: bool,
}

impl Script {
    pub fn page(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn valid(company_name: &str) -> Self {
        Self::page(format!(
            "<div class=\"validStyle\">Yes, valid VAT number</div>\
             <table><tr><td>Name</td><td>{}</td></tr>\
             <tr><td>Address</td><td>1 Main Street</td></tr></table>",
            company_name
        ))
    }

    pub fn invalid() -> Self {
        Self::page("<div class=\"invalidStyle\">No, invalid VAT number</div>")
    }

    pub fn unavailable() -> Self {
        Self::page("<span>MS_UNAVAILABLE</span>")
    }

    pub fn fail_submit(message: impl Into<String>) -> Self {
        Self {
            fail_submit: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_proof(mut self, bytes: Vec<u8>) -> Self {
        self.proof = Some(bytes);
        self
    }

    pub fn with_unreadable_proof(mut self) -> Self {
        self.unreadable_proof = true;
        self
    }

    pub fn after_empty_polls(mut self, polls: usize) -> Self {
        self.empty_polls = polls;
        self
    }
}

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<Script>>,
    by_number: Mutex<HashMap<String, VecDeque<Script>>>,
    fallback: Mutex<Option<Script>>,
    consent_banner: AtomicBool,
    submissions: Mutex<Vec<(String, String)>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    proof_requests: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn next_script(&self, number: &str) -> Script {
        if let Some(script) = lock(&self.by_number)
            .get_mut(number)
            .and_then(VecDeque::pop_front)
        {
            return script;
        }
        if let Some(script) = lock(&self.queue).pop_front() {
            return script;
        }
        lock(&self.fallback).clone().unwrap_or_default()
    }
}

#[derive(Default)]
pub struct ScriptedTarget {
    shared: Arc<Shared>,
}

impl ScriptedTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a script for the next session, whatever number it checks
    pub fn push(&self, script: Script) {
        lock(&self.shared.queue).push_back(script);
    }

    /// Queue a script for the next session checking `number`
    pub fn push_for(&self, number: &str, script: Script) {
        lock(&self.shared.by_number)
            .entry(number.to_string())
            .or_default()
            .push_back(script);
    }

    /// Script played once every queue is drained
    pub fn set_fallback(&self, script: Script) {
        *lock(&self.shared.fallback) = Some(script);
    }

    /// Every session starts behind a consent banner
    pub fn with_consent_banner(self) -> Self {
        self.shared.consent_banner.store(true, Ordering::SeqCst);
        self
    }

    pub fn opened_sessions(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn closed_sessions(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn proof_requests(&self) -> usize {
        self.shared.proof_requests.load(Ordering::SeqCst)
    }

    /// (country, number) pairs in submission order
    pub fn submissions(&self) -> Vec<(String, String)> {
        lock(&self.shared.submissions).clone()
    }
}

#[async_trait]
impl VerificationTarget for ScriptedTarget {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(&self, download_dir: &Path) -> Result<Box<dyn TargetSession>, TargetError> {
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            shared: self.shared.clone(),
            download_dir: download_dir.to_path_buf(),
            country: String::new(),
            number: String::new(),
            script: None,
            polls: 0,
        }))
    }
}

struct ScriptedSession {
    shared: Arc<Shared>,
    download_dir: PathBuf,
    country: String,
    number: String,
    script: Option<Script>,
    polls: usize,
}

#[async_trait]
impl TargetSession for ScriptedSession {
    async fn dismiss_consent(&mut self) -> Result<bool, TargetError> {
        Ok(self.shared.consent_banner.load(Ordering::SeqCst))
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
        lock(&self.shared.submissions).push((self.country.clone(), self.number.clone()));
        let script = self.shared.next_script(&self.number);

        if let Some(message) = &script.fail_submit {
            return Err(TargetError::Step {
                step: "submit",
                message: message.clone(),
            });
        }
        self.script = Some(script);
        Ok(())
    }

    async fn content(&mut self) -> Result<String, TargetError> {
        let Some(script) = &self.script else {
            return Ok(String::new());
        };
        self.polls += 1;
        if self.polls <= script.empty_polls {
            return Ok(String::new());
        }
        Ok(script.content.clone())
    }

    async fn request_proof(&mut self) -> Result<(), TargetError> {
        self.shared.proof_requests.fetch_add(1, Ordering::SeqCst);
        let Some(script) = &self.script else {
            return Ok(());
        };
        let path = self
            .download_dir
            .join(format!("{}{}.pdf", self.country, self.number));
        if script.unreadable_proof {
            tokio::fs::create_dir(path).await?;
        } else if let Some(bytes) = &script.proof {
            tokio::fs::write(path, bytes).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TargetError> {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
