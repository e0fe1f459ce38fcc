// Completion Monitor
//
// Infers the terminal outcome of an embedded, cross-origin survey without
// privileged access to its content. While the survey iframe sits on the
// partner's domain, reading its location throws; that denial is the
// normal in-progress state, not an error. Once the survey redirects back
// to one of our completion domains the location becomes readable and is
// classified against per-outcome pattern tables.
//
// Polling is adaptive: fast during the early phase of a session, decaying
// to a slower interval, with a hard ceiling that resolves TIMEOUT. A
// cooperative message from the survey partner short-circuits polling and
// takes precedence. The first terminal detection wins; everything after
// is suppressed, so upstream status submission happens exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

/// Maximum referrer length forwarded in session metadata
const REFERRER_MAX_LEN: usize = 200;

/// Path fragments that classify a location as a completed survey
const COMPLETED_PATTERNS: &[&str] = &[
    "thank-you-completed",
    "thank-you",
    "thankyou",
    "survey-complete",
    "surveycomplete",
    "/complete",
    "/finished",
];

/// Path fragments that classify a location as quota-full
const QUOTA_PATTERNS: &[&str] = &["quota-full", "quotafull", "quota-reached", "/quota"];

/// Path fragments that classify a location as disqualified
const DISQUALIFIED_PATTERNS: &[&str] = &[
    "disqualified",
    "screened-out",
    "screenout",
    "screen-out",
    "not-qualified",
    "/terminate",
];

/// Terminal state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// Session opened, survey in progress. The only non-terminal value.
    Started,
    Completed,
    Disqualified,
    QuotaFull,
    Timeout,
}

impl CompletionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CompletionStatus::Started)
    }
}

/// How a terminal status was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Path pattern matched the observed location
    UrlPattern,
    /// status=/reason= query parameter matched
    QueryParam,
    /// Location reached a known completion domain with no specific match
    KnownDomain,
    /// Cooperative message from the survey partner
    CooperativeMessage,
    /// Polling ceiling elapsed without a terminal observation
    PollCeiling,
}

/// Terminal (or initial) state of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    pub status: CompletionStatus,
    pub completion_url: Option<String>,
    pub detection_method: DetectionMethod,
    pub timestamp: DateTime<Utc>,
}

impl CompletionResult {
    pub fn new(
        status: CompletionStatus,
        completion_url: Option<String>,
        detection_method: DetectionMethod,
    ) -> Self {
        Self {
            status,
            completion_url,
            detection_method,
            timestamp: Utc::now(),
        }
    }

    fn timeout() -> Self {
        Self::new(CompletionStatus::Timeout, None, DetectionMethod::PollCeiling)
    }
}

/// Why the frame location could not be read this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAccessError {
    /// Same-origin policy denial: the survey is still on the partner's
    /// domain. Expected while the survey is in progress.
    CrossOrigin,
    /// The frame no longer exists
    Detached,
}

/// Read access to the embedded survey frame's location.
pub trait FrameProbe: Send + Sync {
    fn try_location(&self) -> Result<String, FrameAccessError>;
}

/// Auxiliary environment metadata delivered alongside a terminal status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub browser: Option<String>,
    pub screen: Option<String>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    /// Truncated referrer
    pub referrer: Option<String>,
}

impl SessionMetadata {
    fn truncate(mut self) -> Self {
        if let Some(referrer) = self.referrer.take() {
            self.referrer = Some(referrer.chars().take(REFERRER_MAX_LEN).collect());
        }
        self
    }
}

/// Completion monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Poll interval during the early phase of a session
    pub fast_poll_ms: u64,
    /// Poll interval after the early phase
    pub slow_poll_ms: u64,
    /// Seconds of fast polling before decaying to the slow interval
    pub decay_after_secs: u64,
    /// Hard polling ceiling; elapsed without detection resolves TIMEOUT
    pub ceiling_secs: u64,
    /// Our own return domains; reaching one without a specific pattern
    /// match defaults to Completed
    pub completion_domains: Vec<String>,
    /// Pause for user-visible feedback before the terminal redirect
    pub feedback_delay_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            fast_poll_ms: 300,
            slow_poll_ms: 2000,
            decay_after_secs: 180,
            ceiling_secs: 1200, // 20 minutes
            completion_domains: Vec::new(),
            feedback_delay_ms: 2000,
        }
    }
}

/// Classify a status=/reason= query value.
fn classify_param(value: &str) -> Option<CompletionStatus> {
    let value = value.to_lowercase();
    if value.starts_with("quota") {
        return Some(CompletionStatus::QuotaFull);
    }
    if ["dq", "disqualified", "screenout", "screened-out", "term", "terminate"]
        .iter()
        .any(|p| value.starts_with(p))
    {
        return Some(CompletionStatus::Disqualified);
    }
    if value == "c" || value.starts_with("complete") || value.starts_with("finished") {
        return Some(CompletionStatus::Completed);
    }
    None
}

fn match_path(path: &str) -> Option<CompletionStatus> {
    // Quota and disqualification are more specific than completion
    // patterns, so they are checked first.
    if QUOTA_PATTERNS.iter().any(|p| path.contains(p)) {
        return Some(CompletionStatus::QuotaFull);
    }
    if DISQUALIFIED_PATTERNS.iter().any(|p| path.contains(p)) {
        return Some(CompletionStatus::Disqualified);
    }
    if COMPLETED_PATTERNS.iter().any(|p| path.contains(p)) {
        return Some(CompletionStatus::Completed);
    }
    None
}

/// Classify an observed frame location against the outcome tables.
///
/// Matching is case-insensitive against both the URL path and any
/// `status=`/`reason=` query parameters. A location on one of our own
/// completion domains with no specific match defaults to Completed.
pub fn classify_url(
    location: &str,
    completion_domains: &[String],
) -> Option<(CompletionStatus, DetectionMethod)> {
    let lowered = location.to_lowercase();

    if let Ok(parsed) = Url::parse(&lowered) {
        for (key, value) in parsed.query_pairs() {
            if key == "status" || key == "reason" {
                if let Some(status) = classify_param(&value) {
                    return Some((status, DetectionMethod::QueryParam));
                }
            }
        }
        if let Some(status) = match_path(parsed.path()) {
            return Some((status, DetectionMethod::UrlPattern));
        }
        if let Some(host) = parsed.host_str() {
            if completion_domains
                .iter()
                .any(|d| host.eq_ignore_ascii_case(d))
            {
                return Some((CompletionStatus::Completed, DetectionMethod::KnownDomain));
            }
        }
        return None;
    }

    // Not a parseable URL (about:blank, bare paths): raw substring fallback
    match_path(&lowered).map(|status| (status, DetectionMethod::UrlPattern))
}

type ResultCallback = Arc<dyn Fn(CompletionResult) + Send + Sync>;
type MetadataProvider = Arc<dyn Fn() -> SessionMetadata + Send + Sync>;
type MetadataConsumer = Arc<dyn Fn(CompletionResult, SessionMetadata) + Send + Sync>;

/// Watches the embedded survey frame and reports the terminal outcome
/// exactly once.
pub struct CompletionMonitor {
    config: MonitorConfig,
    latched: Mutex<Option<CompletionResult>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    on_result: Mutex<Option<ResultCallback>>,
    metadata: Mutex<Option<(MetadataProvider, MetadataConsumer)>>,
}

impl CompletionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            latched: Mutex::new(None),
            poll_task: Mutex::new(None),
            on_result: Mutex::new(None),
            metadata: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Wire the metadata pipeline. Collection runs on a spawned task
    /// after status delivery and can never block or alter the status.
    pub fn set_metadata_pipeline<P, C>(&self, provider: P, consumer: C)
    where
        P: Fn() -> SessionMetadata + Send + Sync + 'static,
        C: Fn(CompletionResult, SessionMetadata) + Send + Sync + 'static,
    {
        let mut slot = self.metadata.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some((Arc::new(provider), Arc::new(consumer)));
    }

    /// The latched result, if any.
    pub fn result(&self) -> Option<CompletionResult> {
        self.latched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_latched(&self) -> bool {
        self.result().is_some()
    }

    /// Begin adaptive polling of the frame.
    pub fn start<F>(self: &Arc<Self>, frame: Arc<dyn FrameProbe>, on_result: F)
    where
        F: Fn(CompletionResult) + Send + Sync + 'static,
    {
        {
            let mut slot = self
                .on_result
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *slot = Some(Arc::new(on_result));
        }

        let monitor = Arc::clone(self);
        let task = tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let fast = Duration::from_millis(monitor.config.fast_poll_ms.max(50));
            let slow = Duration::from_millis(monitor.config.slow_poll_ms.max(50));
            let decay = Duration::from_secs(monitor.config.decay_after_secs);
            let ceiling = Duration::from_secs(monitor.config.ceiling_secs);
            let mut last_known: Option<String> = None;

            loop {
                let interval = if started.elapsed() < decay { fast } else { slow };
                tokio::time::sleep(interval).await;

                if monitor.is_latched() {
                    // A cooperative message latched while we slept
                    break;
                }
                if started.elapsed() >= ceiling {
                    monitor.latch_and_deliver(CompletionResult::timeout());
                    break;
                }

                match frame.try_location() {
                    Err(FrameAccessError::CrossOrigin) => {
                        // Expected while the survey is in progress
                    }
                    Err(FrameAccessError::Detached) => {
                        debug!("survey frame detached; continuing until ceiling");
                    }
                    Ok(location) => {
                        if last_known.as_deref() == Some(location.as_str()) {
                            continue;
                        }
                        last_known = Some(location.clone());
                        if let Some((status, method)) =
                            classify_url(&location, &monitor.config.completion_domains)
                        {
                            monitor.latch_and_deliver(CompletionResult::new(
                                status,
                                Some(location),
                                method,
                            ));
                            break;
                        }
                    }
                }
            }
        });

        let mut slot = self
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    /// Cooperative completion signal from the survey partner.
    ///
    /// A recognized payload short-circuits polling immediately and takes
    /// precedence over any later URL observation.
    pub fn notify_message(&self, payload: &serde_json::Value) {
        let Some(status_str) = payload.get("status").and_then(|v| v.as_str()) else {
            debug!("ignoring cooperative message without status field");
            return;
        };
        let status = match status_str.to_lowercase().as_str() {
            "complete" | "completed" => CompletionStatus::Completed,
            "quota" | "quota_full" | "quotafull" => CompletionStatus::QuotaFull,
            "disqualified" | "screenout" | "dq" => CompletionStatus::Disqualified,
            other => {
                debug!("ignoring cooperative message with status '{}'", other);
                return;
            }
        };
        let completion_url = payload
            .get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        self.latch_and_deliver(CompletionResult::new(
            status,
            completion_url,
            DetectionMethod::CooperativeMessage,
        ));
        self.abort_poll();
    }

    /// Stop polling without latching (teardown or navigation away).
    pub fn stop(&self) {
        self.abort_poll();
    }

    fn abort_poll(&self) {
        let mut slot = self
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.take() {
            task.abort();
        }
    }

    /// Latch a terminal result and deliver it upstream exactly once.
    fn latch_and_deliver(&self, result: CompletionResult) {
        if !result.status.is_terminal() {
            warn!("non-terminal status handed to latch; ignoring");
            return;
        }
        {
            let mut latched = self.latched.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = latched.as_ref() {
                debug!(
                    "suppressing repeat detection {:?}; already latched {:?}",
                    result.status, existing.status
                );
                return;
            }
            *latched = Some(result.clone());
        }

        let callback = self
            .on_result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(result.clone());
        }

        // Metadata piggybacks on a spawned task; its failure or delay
        // cannot change the already-delivered status.
        let pipeline = self
            .metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some((provider, consumer)) = pipeline {
            tokio::spawn(async move {
                let metadata = provider().truncate();
                consumer(result, metadata);
            });
        }
    }
}

impl Drop for CompletionMonitor {
    fn drop(&mut self) {
        let mut slot = self
            .poll_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}
