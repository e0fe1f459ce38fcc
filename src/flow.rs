// Challenge State Machine
//
// Sequences one respondent through the verification gauntlet:
//
//   CAPTCHA -> TRAP_QUESTION -> SURVEY -> {COMPLETED | DISQUALIFIED |
//                                          QUOTA_FULL | ERROR}
//
// The trap gate is skipped when trap questions are disabled or the
// project has none configured. Once the survey is reached the flow is
// passive and waits for the completion monitor's terminal result.
//
// Gate outcomes are an append-only, strictly ordered log: the captcha
// outcome always precedes the trap outcome. A failed trap question never
// blocks progression; the failure is recorded and reported upstream on a
// spawned task that cannot stall the transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::captcha::{CaptchaAnswer, CaptchaChallenge, CaptchaGate};
use crate::completion::{CompletionResult, CompletionStatus};
use crate::config::PipelineConfig;
use crate::error::FlowError;
use crate::quality::{QualityEngine, QualityRecord, SignalBundle};
use crate::registry::{fire_and_forget, RawSignals, Registry, REGISTRY_TIMEOUT};
use crate::session::Session;
use crate::trap_question::{TrapGate, TrapQuestion};

/// Verification gate identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Captcha,
    TrapQuestion,
}

/// Result of one gate in the sequence. Each gate produces exactly one
/// outcome per session; the captcha may retry internally first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeOutcome {
    pub gate: Gate,
    pub passed: bool,
    pub attempt_count: u32,
    /// Respondent's submitted answer, rendered for the record
    pub answer: String,
    pub timestamp: DateTime<Utc>,
}

/// State of the survey flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Captcha,
    TrapQuestion,
    Survey,
    Completed,
    Disqualified,
    QuotaFull,
    Error,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowState::Completed
                | FlowState::Disqualified
                | FlowState::QuotaFull
                | FlowState::Error
        )
    }
}

/// Outcome-specific page the respondent is sent to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectPage {
    Completed,
    QuotaFull,
    Disqualified,
    /// Generic survey-error screen with a retry affordance
    Error,
}

/// What happened to a captcha submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaProgress {
    /// Wrong answer; the respondent may try again
    Retry {
        attempt_count: u32,
        /// A fresh challenge replaced the failed one
        refreshed: bool,
    },
    /// Gate passed; the flow advanced to this state
    Advanced(FlowState),
}

/// The survey flow for one respondent session.
pub struct SurveyFlow {
    session: Session,
    config: PipelineConfig,
    registry: Arc<dyn Registry>,
    state: FlowState,
    captcha: CaptchaGate,
    trap: Option<TrapGate>,
    outcomes: Vec<ChallengeOutcome>,
}

impl std::fmt::Debug for SurveyFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurveyFlow")
            .field("session", &self.session)
            .field("state", &self.state)
            .field("outcomes", &self.outcomes)
            .finish_non_exhaustive()
    }
}

impl SurveyFlow {
    /// Validate link access and open the flow at the captcha gate.
    pub async fn begin(
        session: Session,
        config: PipelineConfig,
        registry: Arc<dyn Registry>,
    ) -> Result<Self, FlowError> {
        let validation = registry
            .validate_session(&session.project_id, &session.uid)
            .await
            .map_err(FlowError::Registry)?;
        if !validation.allowed {
            return Err(FlowError::AccessDenied {
                redirect: validation.redirect,
            });
        }

        // Announce the session; local state is authoritative regardless
        let reg = Arc::clone(&registry);
        let project_id = session.project_id.clone();
        let uid = session.uid.clone();
        let token = session.token.clone();
        fire_and_forget("session start update", async move {
            reg.update_session_status(
                &project_id,
                &uid,
                CompletionStatus::Started,
                serde_json::json!({ "token": token }),
            )
            .await
        });

        let captcha = CaptchaGate::new(config.captcha.clone());
        Ok(Self {
            session,
            config,
            registry,
            state: FlowState::Captcha,
            captcha,
            trap: None,
            outcomes: Vec::new(),
        })
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Ordered, append-only gate outcome log.
    pub fn outcomes(&self) -> &[ChallengeOutcome] {
        &self.outcomes
    }

    /// The captcha challenge currently presented.
    pub fn captcha_challenge(&self) -> &CaptchaChallenge {
        self.captcha.challenge()
    }

    /// The trap question presented, once that gate is reached.
    pub fn trap_question(&self) -> Option<&TrapQuestion> {
        self.trap.as_ref().map(|gate| gate.question())
    }

    /// Verify a captcha submission and advance on success.
    pub async fn submit_captcha(
        &mut self,
        answer: &CaptchaAnswer,
    ) -> Result<CaptchaProgress, FlowError> {
        if self.state != FlowState::Captcha {
            warn!("captcha submission in state {:?} ignored", self.state);
            return Ok(CaptchaProgress::Advanced(self.state));
        }

        let decision = self.captcha.submit(answer);
        if !decision.passed {
            return Ok(CaptchaProgress::Retry {
                attempt_count: decision.attempt_count,
                refreshed: decision.refreshed,
            });
        }

        self.outcomes.push(ChallengeOutcome {
            gate: Gate::Captcha,
            passed: true,
            attempt_count: decision.attempt_count,
            answer: describe_answer(answer),
            timestamp: Utc::now(),
        });

        self.advance_from_captcha().await?;
        Ok(CaptchaProgress::Advanced(self.state))
    }

    /// Decide the next gate after a captcha pass.
    async fn advance_from_captcha(&mut self) -> Result<(), FlowError> {
        if !self.config.trap.enable_trap_questions {
            self.state = FlowState::Survey;
            return Ok(());
        }

        match self
            .registry
            .fetch_trap_questions(&self.session.project_id)
            .await
        {
            Ok(bank) => {
                match TrapGate::select(&bank) {
                    Some(gate) => {
                        self.trap = Some(gate);
                        self.state = FlowState::TrapQuestion;
                    }
                    None => {
                        // No questions configured for the project
                        self.state = FlowState::Survey;
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.state = FlowState::Error;
                Err(FlowError::TrapBankUnavailable(format!("{:#}", e)))
            }
        }
    }

    /// Check the trap answer and advance to the survey.
    ///
    /// An incorrect answer does not block progression; it records a
    /// failed outcome and notifies the registry without awaiting it.
    pub fn submit_trap(&mut self, answer: &str) -> bool {
        if self.state != FlowState::TrapQuestion {
            warn!("trap submission in state {:?} ignored", self.state);
            return false;
        }
        let Some(gate) = self.trap.as_ref() else {
            self.state = FlowState::Survey;
            return false;
        };

        let passed = gate.check(answer);
        self.outcomes.push(ChallengeOutcome {
            gate: Gate::TrapQuestion,
            passed,
            attempt_count: 1,
            answer: answer.to_string(),
            timestamp: Utc::now(),
        });

        if !passed {
            let registry = Arc::clone(&self.registry);
            let project_id = self.session.project_id.clone();
            let uid = self.session.uid.clone();
            let question_id = gate.question().id.clone();
            let submitted = answer.to_string();
            fire_and_forget("trap failure notification", async move {
                registry
                    .record_challenge_failure(
                        &project_id,
                        &uid,
                        Gate::TrapQuestion,
                        serde_json::json!({
                            "question_id": question_id,
                            "answer": submitted,
                        }),
                    )
                    .await
            });
        }

        self.state = FlowState::Survey;
        passed
    }

    /// Apply a terminal completion result: persist the status, pause for
    /// user-visible feedback, and resolve the outcome page.
    ///
    /// Returns `None` for a non-terminal result. Once terminal, repeat
    /// calls are suppressed and return the already-resolved page.
    pub async fn complete(&mut self, result: &CompletionResult) -> Option<RedirectPage> {
        if !result.status.is_terminal() {
            debug!("non-terminal result handed to complete(); ignoring");
            return None;
        }
        if self.state.is_terminal() {
            debug!(
                "completion {:?} after terminal state {:?} suppressed",
                result.status, self.state
            );
            return Some(self.redirect_page());
        }

        self.state = match result.status {
            CompletionStatus::Completed => FlowState::Completed,
            CompletionStatus::Disqualified => FlowState::Disqualified,
            CompletionStatus::QuotaFull => FlowState::QuotaFull,
            // A session that outlived the polling ceiling gets the
            // generic error screen
            CompletionStatus::Timeout => FlowState::Error,
            CompletionStatus::Started => unreachable!("checked terminal above"),
        };

        let registry = Arc::clone(&self.registry);
        let project_id = self.session.project_id.clone();
        let uid = self.session.uid.clone();
        let status = result.status;
        let metadata = serde_json::json!({
            "completion_url": result.completion_url,
            "detection_method": result.detection_method,
        });
        fire_and_forget("terminal status update", async move {
            registry
                .update_session_status(&project_id, &uid, status, metadata)
                .await
        });

        tokio::time::sleep(Duration::from_millis(self.config.monitor.feedback_delay_ms)).await;
        Some(self.redirect_page())
    }

    /// Run the quality engine over everything this session produced and
    /// submit the record. Registry failure is absorbed; the returned
    /// record is the local truth.
    pub async fn finalize(
        &self,
        raw: &RawSignals,
        survey_answers: Option<&[f64]>,
        completion: Option<&CompletionResult>,
    ) -> QualityRecord {
        let engine = QualityEngine::new(self.config.quality.clone());
        let bundle = SignalBundle {
            behavior: raw.behavior.as_ref(),
            fingerprint: raw.fingerprint.as_ref(),
            duplicate_fingerprint: raw.security.duplicate_fingerprint,
            geo: raw.geo.as_ref(),
            outcomes: &self.outcomes,
            completion,
            survey_answers,
            honeypot_triggered: raw.security.honeypot_triggered,
            survey_elapsed_secs: Some(self.session.elapsed_secs()),
        };
        let record = engine.evaluate(&bundle);

        let submit = self.registry.submit_quality_record(
            &self.session.project_id,
            &self.session.uid,
            &record,
            raw,
        );
        match tokio::time::timeout(REGISTRY_TIMEOUT, submit).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("quality record submission failed: {:#}", e),
            Err(_) => warn!("quality record submission timed out"),
        }

        record
    }

    /// Mark the session failed (unrecoverable embedding-layer error).
    pub fn fail(&mut self) {
        self.state = FlowState::Error;
    }

    /// Retry from the error screen: back to a fresh captcha gate.
    pub fn retry(&mut self) {
        if self.state != FlowState::Error {
            warn!("retry in state {:?} ignored", self.state);
            return;
        }
        self.captcha = CaptchaGate::new(self.config.captcha.clone());
        self.trap = None;
        self.outcomes.clear();
        self.state = FlowState::Captcha;
    }

    fn redirect_page(&self) -> RedirectPage {
        match self.state {
            FlowState::Completed => RedirectPage::Completed,
            FlowState::QuotaFull => RedirectPage::QuotaFull,
            FlowState::Disqualified => RedirectPage::Disqualified,
            _ => RedirectPage::Error,
        }
    }
}

/// Render a captcha answer for the outcome log.
fn describe_answer(answer: &CaptchaAnswer) -> String {
    match answer {
        CaptchaAnswer::Arithmetic { value } => value.to_string(),
        CaptchaAnswer::DragOrder { order } => order.join(","),
        CaptchaAnswer::Hold { held_ms } => format!("held {}ms", held_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::DetectionMethod;
    use crate::registry::{MemoryRegistry, SessionValidation};
    use crate::trap_question::{TrapQuestion, TrapQuestionKind};
    use anyhow::Result;
    use async_trait::async_trait;

    fn session() -> Session {
        Session::new("proj-1", "uid-1", "resp-1", None)
    }

    fn trap_bank() -> Vec<TrapQuestion> {
        vec![TrapQuestion {
            id: "tq-1".to_string(),
            prompt: "Type 'blue' to continue".to_string(),
            kind: TrapQuestionKind::FreeText {
                correct: "blue".to_string(),
            },
        }]
    }

    fn solve_captcha(flow: &SurveyFlow) -> CaptchaAnswer {
        match flow.captcha_challenge() {
            CaptchaChallenge::Arithmetic { num1, num2 } => CaptchaAnswer::Arithmetic {
                value: num1 + num2,
            },
            _ => panic!("default config presents arithmetic"),
        }
    }

    #[tokio::test]
    async fn test_begin_denied_without_redirect() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.deny_sessions(None);
        let err = SurveyFlow::begin(session(), PipelineConfig::default(), registry)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::AccessDenied { redirect: None }));
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn test_captcha_pass_advances_to_trap() {
        let registry = Arc::new(MemoryRegistry::with_trap_bank(trap_bank()));
        let mut flow = SurveyFlow::begin(session(), PipelineConfig::default(), registry)
            .await
            .unwrap();
        assert_eq!(flow.state(), FlowState::Captcha);

        let answer = solve_captcha(&flow);
        let progress = flow.submit_captcha(&answer).await.unwrap();
        assert_eq!(progress, CaptchaProgress::Advanced(FlowState::TrapQuestion));
        assert!(flow.trap_question().is_some());
        assert_eq!(flow.outcomes().len(), 1);
        assert_eq!(flow.outcomes()[0].gate, Gate::Captcha);
        assert!(flow.outcomes()[0].passed);
        assert_eq!(flow.outcomes()[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn test_empty_bank_skips_trap_gate() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut flow = SurveyFlow::begin(session(), PipelineConfig::default(), registry)
            .await
            .unwrap();
        let answer = solve_captcha(&flow);
        let progress = flow.submit_captcha(&answer).await.unwrap();
        assert_eq!(progress, CaptchaProgress::Advanced(FlowState::Survey));
    }

    #[tokio::test]
    async fn test_trap_disabled_skips_gate() {
        let registry = Arc::new(MemoryRegistry::with_trap_bank(trap_bank()));
        let mut config = PipelineConfig::default();
        config.trap.enable_trap_questions = false;
        let mut flow = SurveyFlow::begin(session(), config, registry).await.unwrap();
        let answer = solve_captcha(&flow);
        let progress = flow.submit_captcha(&answer).await.unwrap();
        assert_eq!(progress, CaptchaProgress::Advanced(FlowState::Survey));
    }

    #[tokio::test]
    async fn test_wrong_captcha_stays_at_gate() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut flow = SurveyFlow::begin(session(), PipelineConfig::default(), registry)
            .await
            .unwrap();
        let progress = flow
            .submit_captcha(&CaptchaAnswer::Arithmetic { value: -1 })
            .await
            .unwrap();
        assert_eq!(
            progress,
            CaptchaProgress::Retry {
                attempt_count: 1,
                refreshed: false
            }
        );
        assert_eq!(flow.state(), FlowState::Captcha);
        assert!(flow.outcomes().is_empty());
    }

    #[tokio::test]
    async fn test_failed_trap_still_advances_and_notifies() {
        let registry = Arc::new(MemoryRegistry::with_trap_bank(trap_bank()));
        let mut flow = SurveyFlow::begin(
            session(),
            PipelineConfig::default(),
            Arc::clone(&registry) as Arc<dyn Registry>,
        )
        .await
        .unwrap();

        let answer = solve_captcha(&flow);
        flow.submit_captcha(&answer).await.unwrap();

        let passed = flow.submit_trap("green");
        assert!(!passed);
        assert_eq!(flow.state(), FlowState::Survey, "wrong answer never blocks");

        // Exactly one failed trap outcome, after the captcha outcome
        assert_eq!(flow.outcomes().len(), 2);
        assert_eq!(flow.outcomes()[1].gate, Gate::TrapQuestion);
        assert!(!flow.outcomes()[1].passed);

        // The fire-and-forget notification lands shortly after
        tokio::time::sleep(Duration::from_millis(50)).await;
        let failures = registry.challenge_failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].1, Gate::TrapQuestion);
    }

    #[tokio::test]
    async fn test_correct_trap_records_pass() {
        let registry = Arc::new(MemoryRegistry::with_trap_bank(trap_bank()));
        let mut flow = SurveyFlow::begin(
            session(),
            PipelineConfig::default(),
            Arc::clone(&registry) as Arc<dyn Registry>,
        )
        .await
        .unwrap();

        let answer = solve_captcha(&flow);
        flow.submit_captcha(&answer).await.unwrap();
        assert!(flow.submit_trap("  BLUE "));
        assert_eq!(flow.state(), FlowState::Survey);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.challenge_failures.lock().unwrap().is_empty());
    }

    struct FailingTrapRegistry;

    #[async_trait]
    impl Registry for FailingTrapRegistry {
        async fn validate_session(&self, _: &str, _: &str) -> Result<SessionValidation> {
            Ok(SessionValidation {
                allowed: true,
                redirect: None,
            })
        }
        async fn record_challenge_failure(
            &self,
            _: &str,
            _: &str,
            _: Gate,
            _: serde_json::Value,
        ) -> Result<()> {
            Ok(())
        }
        async fn update_session_status(
            &self,
            _: &str,
            _: &str,
            _: CompletionStatus,
            _: serde_json::Value,
        ) -> Result<()> {
            Ok(())
        }
        async fn submit_quality_record(
            &self,
            _: &str,
            _: &str,
            _: &QualityRecord,
            _: &RawSignals,
        ) -> Result<()> {
            Ok(())
        }
        async fn fetch_trap_questions(&self, _: &str) -> Result<Vec<TrapQuestion>> {
            anyhow::bail!("bank storage unreachable")
        }
    }

    #[tokio::test]
    async fn test_unreachable_trap_bank_is_session_fatal() {
        let registry = Arc::new(FailingTrapRegistry);
        let mut flow = SurveyFlow::begin(session(), PipelineConfig::default(), registry)
            .await
            .unwrap();
        let answer = solve_captcha(&flow);
        let err = flow.submit_captcha(&answer).await.unwrap_err();
        assert!(matches!(err, FlowError::TrapBankUnavailable(_)));
        assert_eq!(flow.state(), FlowState::Error);

        // Retry returns to a fresh captcha gate
        flow.retry();
        assert_eq!(flow.state(), FlowState::Captcha);
        assert!(flow.outcomes().is_empty());
    }

    #[tokio::test]
    async fn test_complete_maps_statuses_and_latches() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut config = PipelineConfig::default();
        config.monitor.feedback_delay_ms = 0;
        let mut flow = SurveyFlow::begin(
            session(),
            config,
            Arc::clone(&registry) as Arc<dyn Registry>,
        )
        .await
        .unwrap();

        let result = CompletionResult::new(
            CompletionStatus::QuotaFull,
            Some("https://x.com/quota-full".to_string()),
            DetectionMethod::UrlPattern,
        );
        let page = flow.complete(&result).await;
        assert_eq!(page, Some(RedirectPage::QuotaFull));
        assert_eq!(flow.state(), FlowState::QuotaFull);

        // A later, different terminal detection is suppressed
        let second = CompletionResult::new(
            CompletionStatus::Completed,
            None,
            DetectionMethod::UrlPattern,
        );
        let page = flow.complete(&second).await;
        assert_eq!(page, Some(RedirectPage::QuotaFull));
        assert_eq!(flow.state(), FlowState::QuotaFull);

        // Session-start update plus exactly one terminal update
        tokio::time::sleep(Duration::from_millis(50)).await;
        let updates = registry.status_updates.lock().unwrap();
        let terminal: Vec<_> = updates
            .iter()
            .filter(|(_, s)| s.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].1, CompletionStatus::QuotaFull);
    }

    #[tokio::test]
    async fn test_non_terminal_result_ignored() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut flow = SurveyFlow::begin(session(), PipelineConfig::default(), registry)
            .await
            .unwrap();
        let result = CompletionResult::new(CompletionStatus::Started, None, DetectionMethod::UrlPattern);
        assert_eq!(flow.complete(&result).await, None);
        assert_eq!(flow.state(), FlowState::Captcha);
    }

    #[tokio::test]
    async fn test_timeout_resolves_to_error_page() {
        let registry = Arc::new(MemoryRegistry::new());
        let mut config = PipelineConfig::default();
        config.monitor.feedback_delay_ms = 0;
        let mut flow = SurveyFlow::begin(session(), config, registry).await.unwrap();
        let result =
            CompletionResult::new(CompletionStatus::Timeout, None, DetectionMethod::PollCeiling);
        assert_eq!(flow.complete(&result).await, Some(RedirectPage::Error));
        assert_eq!(flow.state(), FlowState::Error);
    }
}
