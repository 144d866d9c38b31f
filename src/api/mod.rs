pub mod gemini;
pub mod tts;

use crate::error::PipelineError;
use crate::logw;
use anyhow::Result;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

const QUOTA_MARKERS: &[&str] = &[
    "429 resource_exhausted",
    "you exceeded your current quota",
    "generaterequestsperdayperprojectpermodel",
    "quota",
];

pub fn is_quota_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    QUOTA_MARKERS.iter().any(|m| lower.contains(m))
}

/// Gemini API keys shared by every call of a run. A quota error moves the
/// whole pool to the next key so later calls keep the same voice account.
#[derive(Debug)]
pub struct ApiKeyPool {
    keys: Vec<String>,
    current: AtomicUsize,
}

impl ApiKeyPool {
    pub fn new(keys: Vec<String>, start: usize) -> Result<Self> {
        if keys.is_empty() {
            anyhow::bail!("no Gemini API key configured (set GEMINI_API_KEY or gemini.api_keys)");
        }
        let start = start % keys.len();
        Ok(Self {
            keys,
            current: AtomicUsize::new(start),
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::SeqCst) % self.keys.len()
    }

    pub fn current_key(&self) -> &str {
        &self.keys[self.current_index()]
    }

    fn advance_from(&self, index: usize) {
        let next = (index + 1) % self.keys.len();
        let _ = self
            .current
            .compare_exchange(index, next, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Runs `call` with the current key, rotating on quota errors until
    /// every key has been tried once. Other errors are returned as is.
    pub async fn with_rotation<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for _ in 0..self.keys.len() {
            let index = self.current_index();
            let key = self.keys[index].clone();
            match call(key).await {
                Ok(value) => return Ok(value),
                Err(err) if is_quota_error(&format!("{:#}", err)) => {
                    logw(format!(
                        "Gemini key {}/{} ({}) quota exhausted",
                        index + 1,
                        self.keys.len(),
                        mask_key(&self.keys[index])
                    ));
                    self.advance_from(index);
                }
                Err(err) => return Err(err),
            }
        }

        Err(PipelineError::QuotaExhausted {
            keys: self.keys.len(),
        }
        .into())
    }
}

pub fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    format!("{}...", prefix)
}
