// Link/Session Registry interface
//
// The registry is the external persistence collaborator: it validates
// link access, stores status transitions and quality records, and serves
// the trap-question bank. The pipeline only ever talks to it through
// this trait.
//
// Writes follow fire-and-forget semantics with local-first truth: every
// call races a timeout, and on failure the caller proceeds with what it
// already knows. A slow or unreachable registry can never stall the
// respondent's survey flow.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::warn;

use crate::behavior::BehaviorSnapshot;
use crate::completion::CompletionStatus;
use crate::fingerprint::Fingerprint;
use crate::flow::Gate;
use crate::geoip::GeoSignal;
use crate::quality::QualityRecord;
use crate::trap_question::TrapQuestion;

/// Default per-call timeout for registry operations
pub const REGISTRY_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the registry API
    pub base_url: String,
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api".to_string(),
            timeout_secs: 5,
        }
    }
}

/// Answer to a session-start access check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionValidation {
    pub allowed: bool,
    /// Where to send a rejected respondent, if anywhere
    pub redirect: Option<String>,
}

/// Security-derived bits accompanying the quality record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySignals {
    pub duplicate_fingerprint: Option<bool>,
    pub honeypot_triggered: Option<bool>,
}

/// Raw signal payload submitted alongside the quality record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSignals {
    pub behavior: Option<BehaviorSnapshot>,
    pub fingerprint: Option<Fingerprint>,
    pub security: SecuritySignals,
    pub geo: Option<GeoSignal>,
}

/// Persistence backend for links, sessions, and quality records.
///
/// Every write is independent and expected to be idempotent-safe on the
/// server side; the pipeline assumes no transactional guarantees beyond
/// that.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Called once at session start.
    async fn validate_session(&self, project_id: &str, uid: &str) -> Result<SessionValidation>;

    /// Fire-and-forget notification of a failed gate.
    async fn record_challenge_failure(
        &self,
        project_id: &str,
        uid: &str,
        gate: Gate,
        metadata: serde_json::Value,
    ) -> Result<()>;

    /// Called by the completion monitor on every status transition.
    async fn update_session_status(
        &self,
        project_id: &str,
        uid: &str,
        status: CompletionStatus,
        metadata: serde_json::Value,
    ) -> Result<()>;

    /// Called once at session termination.
    async fn submit_quality_record(
        &self,
        project_id: &str,
        uid: &str,
        record: &QualityRecord,
        raw: &RawSignals,
    ) -> Result<()>;

    /// Read at trap-question gate entry.
    async fn fetch_trap_questions(&self, project_id: &str) -> Result<Vec<TrapQuestion>>;
}

/// Dispatch a registry write without blocking the caller.
///
/// The future is raced against the registry timeout; failure or timeout
/// is logged and swallowed - local state remains the source of truth for
/// the session's lifetime.
pub fn fire_and_forget<F>(what: &'static str, fut: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::time::timeout(REGISTRY_TIMEOUT, fut).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("registry {} failed: {:#}", what, e),
            Err(_) => warn!("registry {} timed out", what),
        }
    });
}

/// HTTP adapter for the registry API.
pub struct HttpRegistry {
    client: reqwest::Client,
    config: RegistryConfig,
}

impl HttpRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build registry HTTP client")?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn validate_session(&self, project_id: &str, uid: &str) -> Result<SessionValidation> {
        let response = self
            .client
            .post(self.url("sessions/validate"))
            .json(&serde_json::json!({ "project_id": project_id, "uid": uid }))
            .send()
            .await
            .context("validate_session request failed")?
            .error_for_status()
            .context("validate_session rejected")?;
        response
            .json::<SessionValidation>()
            .await
            .context("validate_session response malformed")
    }

    async fn record_challenge_failure(
        &self,
        project_id: &str,
        uid: &str,
        gate: Gate,
        metadata: serde_json::Value,
    ) -> Result<()> {
        self.client
            .post(self.url(&format!("sessions/{}/{}/challenge-failure", project_id, uid)))
            .json(&serde_json::json!({ "gate": gate, "metadata": metadata }))
            .send()
            .await
            .context("record_challenge_failure request failed")?
            .error_for_status()
            .context("record_challenge_failure rejected")?;
        Ok(())
    }

    async fn update_session_status(
        &self,
        project_id: &str,
        uid: &str,
        status: CompletionStatus,
        metadata: serde_json::Value,
    ) -> Result<()> {
        self.client
            .post(self.url(&format!("sessions/{}/{}/status", project_id, uid)))
            .json(&serde_json::json!({ "status": status, "metadata": metadata }))
            .send()
            .await
            .context("update_session_status request failed")?
            .error_for_status()
            .context("update_session_status rejected")?;
        Ok(())
    }

    async fn submit_quality_record(
        &self,
        project_id: &str,
        uid: &str,
        record: &QualityRecord,
        raw: &RawSignals,
    ) -> Result<()> {
        self.client
            .post(self.url(&format!("sessions/{}/{}/quality", project_id, uid)))
            .json(&serde_json::json!({ "record": record, "raw_signals": raw }))
            .send()
            .await
            .context("submit_quality_record request failed")?
            .error_for_status()
            .context("submit_quality_record rejected")?;
        Ok(())
    }

    async fn fetch_trap_questions(&self, project_id: &str) -> Result<Vec<TrapQuestion>> {
        let response = self
            .client
            .get(self.url(&format!("projects/{}/trap-questions", project_id)))
            .send()
            .await
            .context("fetch_trap_questions request failed")?
            .error_for_status()
            .context("fetch_trap_questions rejected")?;
        response
            .json::<Vec<TrapQuestion>>()
            .await
            .context("fetch_trap_questions response malformed")
    }
}

/// In-memory registry double.
///
/// Records every call for assertions and is the backend used by the
/// integration tests.
#[derive(Default)]
pub struct MemoryRegistry {
    pub allow_sessions: Mutex<bool>,
    pub redirect: Mutex<Option<String>>,
    pub trap_bank: Mutex<Vec<TrapQuestion>>,
    pub status_updates: Mutex<Vec<(String, CompletionStatus)>>,
    pub challenge_failures: Mutex<Vec<(String, Gate)>>,
    pub quality_records: Mutex<Vec<(String, QualityRecord)>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            allow_sessions: Mutex::new(true),
            ..Self::default()
        }
    }

    pub fn with_trap_bank(bank: Vec<TrapQuestion>) -> Self {
        let registry = Self::new();
        *registry
            .trap_bank
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = bank;
        registry
    }

    pub fn deny_sessions(&self, redirect: Option<String>) {
        *self
            .allow_sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
        *self.redirect.lock().unwrap_or_else(PoisonError::into_inner) = redirect;
    }

    pub fn status_update_count(&self) -> usize {
        self.status_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn validate_session(&self, _project_id: &str, _uid: &str) -> Result<SessionValidation> {
        let allowed = *self
            .allow_sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let redirect = self
            .redirect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(SessionValidation { allowed, redirect })
    }

    async fn record_challenge_failure(
        &self,
        _project_id: &str,
        uid: &str,
        gate: Gate,
        _metadata: serde_json::Value,
    ) -> Result<()> {
        self.challenge_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((uid.to_string(), gate));
        Ok(())
    }

    async fn update_session_status(
        &self,
        _project_id: &str,
        uid: &str,
        status: CompletionStatus,
        _metadata: serde_json::Value,
    ) -> Result<()> {
        self.status_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((uid.to_string(), status));
        Ok(())
    }

    async fn submit_quality_record(
        &self,
        _project_id: &str,
        uid: &str,
        record: &QualityRecord,
        _raw: &RawSignals,
    ) -> Result<()> {
        self.quality_records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((uid.to_string(), record.clone()));
        Ok(())
    }

    async fn fetch_trap_questions(&self, _project_id: &str) -> Result<Vec<TrapQuestion>> {
        Ok(self
            .trap_bank
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
