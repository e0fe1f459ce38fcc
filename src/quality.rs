// Quality & Flag Engine
//
// Folds every upstream signal - behavior snapshot, fingerprint and
// duplicate bit, geo/VPN signal, challenge outcomes, completion result,
// survey answers - into a data-quality score and a set of categorical
// fraud flags. Pure function of its inputs: the engine holds no state
// beyond configuration and always produces a QualityRecord, never an
// error. A missing upstream signal leaves its flag conditions
// unevaluated.
//
// Scoring starts at 100 and applies fixed penalties:
// - VPN/proxy detected:            -30
// - blacklisted referrer domain:   -50
// - behaviorally suspicious:       -40
// - combined bot indicators:       -80
// The score saturates at 0 and never exceeds 100.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::behavior::BehaviorSnapshot;
use crate::completion::{CompletionResult, CompletionStatus, DetectionMethod};
use crate::fingerprint::Fingerprint;
use crate::flow::{ChallengeOutcome, Gate};
use crate::geoip::{is_blacklisted, GeoSignal};

const VPN_PENALTY: u8 = 30;
const BLACKLIST_PENALTY: u8 = 50;
const SUSPICIOUS_BEHAVIOR_PENALTY: u8 = 40;
const BOT_PENALTY: u8 = 80;

/// Minutes of timezone disagreement tolerated before it counts as a
/// geo mismatch (adjacent zones, DST skew)
const TIMEZONE_MISMATCH_MINUTES: i32 = 120;

/// Activity rate below this over a session longer than 30 s reads as an
/// unattended or scripted session
const DEAD_SESSION_RATE: f64 = 0.05;
const DEAD_SESSION_MIN_MS: u64 = 30_000;

/// Flag severity tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Categorical fraud/quality flags. A session may carry zero or many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagReason {
    /// Referrer matched a configured blacklist
    BlacklistedDomain,
    /// VPN/proxy/hosting exit detected
    VpnDetected,
    /// Device fingerprint seen before under another link in-project
    DuplicateFingerprint,
    /// CAPTCHA never passed, or passed only beyond the retry budget
    CaptchaFailure,
    /// Trap question answered incorrectly
    TrapQuestionFailed,
    /// Survey completed implausibly fast
    SpeedViolation,
    /// Two or more combined bot indicators
    BotCheckFlag,
    /// Survey answers with implausibly low variance
    FlatLineResponse,
    /// Final score below the configured floor
    LowQualityScore,
}

impl FlagReason {
    pub fn severity(&self) -> Severity {
        match self {
            FlagReason::BlacklistedDomain => Severity::High,
            FlagReason::VpnDetected => Severity::Medium,
            FlagReason::DuplicateFingerprint => Severity::High,
            FlagReason::CaptchaFailure => Severity::Medium,
            FlagReason::TrapQuestionFailed => Severity::Medium,
            FlagReason::SpeedViolation => Severity::Medium,
            FlagReason::BotCheckFlag => Severity::Critical,
            FlagReason::FlatLineResponse => Severity::Medium,
            FlagReason::LowQualityScore => Severity::High,
        }
    }
}

/// Overall risk tier derived from the final score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityRisk {
    Low,
    Medium,
    High,
}

/// Final aggregated output for one session. Created once at termination,
/// immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRecord {
    /// 0-100, higher is better
    pub data_quality_score: u8,
    pub security_risk: SecurityRisk,
    pub flags: BTreeSet<FlagReason>,
}

/// Quality engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    pub enable_vpn_detection: bool,
    pub enable_speed_checks: bool,
    pub enable_honeypot: bool,
    pub blacklisted_domains: Vec<String>,
    /// Completions faster than this are speeders
    pub min_completion_secs: u64,
    /// Expected upper bound on completion time
    pub max_completion_secs: u64,
    /// Scores below this floor carry LOW_QUALITY_SCORE
    pub low_score_floor: u8,
    /// CAPTCHA attempts beyond this flag the session even after a pass
    pub captcha_retry_budget: u32,
    /// Answer variance below this reads as a flat-line response
    pub flat_line_variance: f64,
    /// Minimum answers before flat-line is evaluated
    pub flat_line_min_answers: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            enable_vpn_detection: true,
            enable_speed_checks: true,
            enable_honeypot: true,
            blacklisted_domains: Vec::new(),
            min_completion_secs: 60,
            max_completion_secs: 3600,
            low_score_floor: 50,
            captcha_retry_budget: 3,
            flat_line_variance: 0.25,
            flat_line_min_answers: 5,
        }
    }
}

/// Everything the engine knows about one session at termination.
///
/// Every field except the outcome log is optional; an absent signal
/// leaves its flag conditions unevaluated.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalBundle<'a> {
    pub behavior: Option<&'a BehaviorSnapshot>,
    pub fingerprint: Option<&'a Fingerprint>,
    pub duplicate_fingerprint: Option<bool>,
    pub geo: Option<&'a GeoSignal>,
    pub outcomes: &'a [ChallengeOutcome],
    pub completion: Option<&'a CompletionResult>,
    /// Numeric survey answer values, when the survey platform shares them
    pub survey_answers: Option<&'a [f64]>,
    pub honeypot_triggered: Option<bool>,
    /// Elapsed survey time; falls back to the behavior snapshot's total
    pub survey_elapsed_secs: Option<u64>,
}

/// Derives the QualityRecord from all upstream signals.
pub struct QualityEngine {
    config: QualityConfig,
}

impl QualityEngine {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Compute the final record. Never fails; partial input only narrows
    /// which conditions fire.
    pub fn evaluate(&self, signals: &SignalBundle) -> QualityRecord {
        // An invocation without a completion result is a caller bug, but
        // the record must still be produced.
        let synthesized;
        let completion = match signals.completion {
            Some(result) => result,
            None => {
                debug!("quality engine invoked without a completion result");
                synthesized = CompletionResult::new(
                    CompletionStatus::Started,
                    None,
                    DetectionMethod::UrlPattern,
                );
                &synthesized
            }
        };

        let mut flags: BTreeSet<FlagReason> = BTreeSet::new();
        let mut score: u8 = 100;

        if self.config.enable_vpn_detection {
            if let Some(geo) = signals.geo {
                if geo.vpn_or_proxy {
                    flags.insert(FlagReason::VpnDetected);
                    score = score.saturating_sub(VPN_PENALTY);
                }
            }
        }

        if let Some(domain) = signals.geo.and_then(|g| g.referrer_domain.as_deref()) {
            if is_blacklisted(domain, &self.config.blacklisted_domains) {
                flags.insert(FlagReason::BlacklistedDomain);
                score = score.saturating_sub(BLACKLIST_PENALTY);
            }
        }

        if let Some(behavior) = signals.behavior {
            if behavior_suspicious(behavior) {
                debug!(
                    patterns = behavior.suspicious_patterns.len(),
                    rate = behavior.activity_rate,
                    "behaviorally suspicious session"
                );
                score = score.saturating_sub(SUSPICIOUS_BEHAVIOR_PENALTY);
            }
        }

        if self.bot_indicator_count(signals) >= 2 {
            flags.insert(FlagReason::BotCheckFlag);
            score = score.saturating_sub(BOT_PENALTY);
        }

        for outcome in signals.outcomes {
            match outcome.gate {
                Gate::Captcha => {
                    if !outcome.passed
                        || outcome.attempt_count > self.config.captcha_retry_budget
                    {
                        flags.insert(FlagReason::CaptchaFailure);
                    }
                }
                Gate::TrapQuestion => {
                    if !outcome.passed {
                        flags.insert(FlagReason::TrapQuestionFailed);
                    }
                }
            }
        }

        if signals.duplicate_fingerprint == Some(true) {
            flags.insert(FlagReason::DuplicateFingerprint);
        }

        if self.config.enable_speed_checks && completion.status == CompletionStatus::Completed {
            let elapsed = signals
                .survey_elapsed_secs
                .or_else(|| signals.behavior.map(|b| b.total_time_ms / 1000));
            if let Some(elapsed) = elapsed {
                if self.is_speeder(elapsed) {
                    flags.insert(FlagReason::SpeedViolation);
                }
            }
        }

        if let Some(answers) = signals.survey_answers {
            if answers.len() >= self.config.flat_line_min_answers
                && population_variance(answers) < self.config.flat_line_variance
            {
                flags.insert(FlagReason::FlatLineResponse);
            }
        }

        let security_risk = if score < 50 {
            SecurityRisk::High
        } else if score < 80 {
            SecurityRisk::Medium
        } else {
            SecurityRisk::Low
        };

        if score < self.config.low_score_floor {
            flags.insert(FlagReason::LowQualityScore);
        }

        QualityRecord {
            data_quality_score: score,
            security_risk,
            flags,
        }
    }

    /// Count independent bot indicators: geo/timezone mismatch, honeypot
    /// trip, and behavioral automation tags.
    fn bot_indicator_count(&self, signals: &SignalBundle) -> usize {
        let mut indicators = 0;

        if timezone_mismatch(signals.geo, signals.fingerprint) {
            indicators += 1;
        }
        if self.config.enable_honeypot && signals.honeypot_triggered == Some(true) {
            indicators += 1;
        }
        if signals
            .behavior
            .map(|b| !b.suspicious_patterns.is_empty())
            .unwrap_or(false)
        {
            indicators += 1;
        }

        indicators
    }

    fn is_speeder(&self, elapsed_secs: u64) -> bool {
        if self.config.min_completion_secs > 0 {
            elapsed_secs < self.config.min_completion_secs
        } else {
            // No explicit minimum: under 20% of the expected upper bound
            // is implausible
            elapsed_secs * 5 < self.config.max_completion_secs
        }
    }
}

/// Whether the session reads as behaviorally suspicious: multiple distinct
/// automation tags, or a dead session with nearly no activity.
fn behavior_suspicious(behavior: &BehaviorSnapshot) -> bool {
    behavior.suspicious_patterns.len() >= 2
        || (behavior.activity_rate < DEAD_SESSION_RATE
            && behavior.total_time_ms > DEAD_SESSION_MIN_MS)
}

/// Whether the resolved geo location and the device's reported timezone
/// disagree beyond tolerance. Unevaluable when either side is absent.
fn timezone_mismatch(geo: Option<&GeoSignal>, fingerprint: Option<&Fingerprint>) -> bool {
    let (Some(geo_offset), Some(device_offset)) = (
        geo.and_then(|g| g.utc_offset_minutes),
        fingerprint.and_then(|f| f.timezone_offset),
    ) else {
        return false;
    };
    (geo_offset - device_offset).abs() > TIMEZONE_MISMATCH_MINUTES
}

/// Population variance of the answer values.
pub fn population_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}
