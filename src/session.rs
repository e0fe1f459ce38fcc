// Respondent session identity.
//
// A Session represents one respondent's attempt at a survey link. It is
// created when the link is opened, owned by the survey flow for its
// lifetime, and referenced (never owned) by the collector components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Length of the per-session token nonce
const TOKEN_LEN: usize = 32;

/// One respondent's attempt at a survey link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Project this link belongs to
    pub project_id: String,
    /// Opaque link identifier
    pub uid: String,
    /// Respondent identifier supplied by the panel vendor
    pub resp_id: String,
    /// Vendor identifier, if the link came through a vendor
    pub vendor_id: Option<String>,
    /// Wall-clock session start
    pub started_at: DateTime<Utc>,
    /// Session nonce, regenerated for every attempt
    pub token: String,
    /// Monotonic start instant for elapsed-time measurement
    #[serde(skip, default = "Instant::now")]
    started_instant: Instant,
}

impl Session {
    /// Create a session for a freshly opened survey link.
    pub fn new(
        project_id: impl Into<String>,
        uid: impl Into<String>,
        resp_id: impl Into<String>,
        vendor_id: Option<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            uid: uid.into(),
            resp_id: resp_id.into(),
            vendor_id,
            started_at: Utc::now(),
            token: generate_token(),
            started_instant: Instant::now(),
        }
    }

    /// Monotonic elapsed time since the session began.
    pub fn elapsed_ms(&self) -> u64 {
        self.started_instant.elapsed().as_millis() as u64
    }

    /// Elapsed whole seconds since the session began.
    pub fn elapsed_secs(&self) -> u64 {
        self.started_instant.elapsed().as_secs()
    }
}

/// Generate a session token nonce.
fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}
