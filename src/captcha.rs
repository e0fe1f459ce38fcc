// CAPTCHA gate
//
// First gate of the challenge sequence. Presents one of three challenge
// modalities chosen by configured difficulty:
// - arithmetic: answer num1 + num2
// - drag-to-order: arrange items into the target order
// - hold-to-confirm: press and hold for a fixed duration
//
// Verification is exact-match against the precomputed answer. After a
// bounded number of consecutive failures a fresh challenge is generated
// rather than reusing the same one, so an automated client cannot
// brute-force a single instance.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Interval at which the hold-to-confirm tracker reports progress
const HOLD_POLL_MS: u64 = 100;

/// Configured captcha difficulty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    /// Arithmetic only
    Easy,
    /// Random choice of arithmetic or drag-to-order
    Medium,
    /// Hold-to-confirm
    Hard,
}

/// CAPTCHA gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    pub difficulty: Difficulty,
    /// Consecutive failures before a fresh challenge is generated
    pub max_consecutive_failures: u32,
    /// Continuous hold required for hold-to-confirm, in milliseconds
    pub hold_duration_ms: u64,
    /// Attempts beyond this count flag the session even after a pass
    pub retry_budget: u32,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            difficulty: Difficulty::Easy,
            max_consecutive_failures: 3,
            hold_duration_ms: 3000,
            retry_budget: 3,
        }
    }
}

/// Challenge presented to the respondent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CaptchaChallenge {
    Arithmetic { num1: i64, num2: i64 },
    /// Items are presented shuffled; the respondent arranges them in
    /// ascending order.
    DragOrder { items: Vec<String> },
    HoldToConfirm { required_ms: u64 },
}

/// Respondent's submission for the current challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CaptchaAnswer {
    Arithmetic { value: i64 },
    /// Items in the order the respondent arranged them
    DragOrder { order: Vec<String> },
    Hold { held_ms: u64 },
}

/// Precomputed expected answer, never exposed to the client
#[derive(Debug, Clone, PartialEq)]
enum Expected {
    Sum(i64),
    /// Concatenation of the items in correct order
    Order(String),
    HoldMs(u64),
}

/// Result of one verification attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaDecision {
    pub passed: bool,
    /// Attempts made so far, including this one
    pub attempt_count: u32,
    /// Whether a fresh challenge replaced the failed one
    pub refreshed: bool,
}

/// CAPTCHA gate state for one session.
pub struct CaptchaGate {
    config: CaptchaConfig,
    challenge: CaptchaChallenge,
    expected: Expected,
    consecutive_failures: u32,
    total_attempts: u32,
    passed: bool,
}

impl CaptchaGate {
    pub fn new(config: CaptchaConfig) -> Self {
        let (challenge, expected) = generate_challenge(&config);
        Self {
            config,
            challenge,
            expected,
            consecutive_failures: 0,
            total_attempts: 0,
            passed: false,
        }
    }

    /// The challenge currently presented to the respondent.
    pub fn challenge(&self) -> &CaptchaChallenge {
        &self.challenge
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    /// Attempts made so far.
    pub fn attempt_count(&self) -> u32 {
        self.total_attempts
    }

    /// Whether the attempt count exceeded the configured retry budget.
    pub fn over_budget(&self) -> bool {
        self.total_attempts > self.config.retry_budget
    }

    /// Verify a submission against the current challenge.
    pub fn submit(&mut self, answer: &CaptchaAnswer) -> CaptchaDecision {
        self.total_attempts += 1;

        let correct = match (&self.expected, answer) {
            (Expected::Sum(sum), CaptchaAnswer::Arithmetic { value }) => value == sum,
            (Expected::Order(target), CaptchaAnswer::DragOrder { order }) => {
                order.concat() == *target
            }
            (Expected::HoldMs(required), CaptchaAnswer::Hold { held_ms }) => held_ms >= required,
            // Submission for a different modality than presented
            _ => false,
        };

        if correct {
            self.passed = true;
            self.consecutive_failures = 0;
            return CaptchaDecision {
                passed: true,
                attempt_count: self.total_attempts,
                refreshed: false,
            };
        }

        self.consecutive_failures += 1;
        let refreshed = self.consecutive_failures >= self.config.max_consecutive_failures;
        if refreshed {
            let (challenge, expected) = generate_challenge(&self.config);
            self.challenge = challenge;
            self.expected = expected;
            self.consecutive_failures = 0;
        }

        CaptchaDecision {
            passed: false,
            attempt_count: self.total_attempts,
            refreshed,
        }
    }
}

/// Generate a challenge appropriate for the configured difficulty.
fn generate_challenge(config: &CaptchaConfig) -> (CaptchaChallenge, Expected) {
    let mut rng = rand::thread_rng();
    match config.difficulty {
        Difficulty::Easy => arithmetic(&mut rng),
        Difficulty::Medium => {
            if rng.gen_bool(0.5) {
                arithmetic(&mut rng)
            } else {
                drag_order(&mut rng)
            }
        }
        Difficulty::Hard => (
            CaptchaChallenge::HoldToConfirm {
                required_ms: config.hold_duration_ms,
            },
            Expected::HoldMs(config.hold_duration_ms),
        ),
    }
}

fn arithmetic(rng: &mut impl Rng) -> (CaptchaChallenge, Expected) {
    let num1 = rng.gen_range(1..=20);
    let num2 = rng.gen_range(1..=20);
    (
        CaptchaChallenge::Arithmetic { num1, num2 },
        Expected::Sum(num1 + num2),
    )
}

fn drag_order(rng: &mut impl Rng) -> (CaptchaChallenge, Expected) {
    // Four distinct two-digit numbers; correct order is ascending
    let mut values: Vec<i64> = Vec::with_capacity(4);
    while values.len() < 4 {
        let v = rng.gen_range(10..=99);
        if !values.contains(&v) {
            values.push(v);
        }
    }
    let mut sorted = values.clone();
    sorted.sort_unstable();
    let target: String = sorted.iter().map(|v| v.to_string()).collect();

    let mut items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    items.shuffle(rng);

    (CaptchaChallenge::DragOrder { items }, Expected::Order(target))
}

/// Tracks a hold-to-confirm press.
///
/// While pressed, a polling task reports elapsed hold time to the progress
/// callback every 100 ms; the task is aborted on release. The elapsed time
/// returned by `release` is what gets submitted as the answer.
#[derive(Default)]
pub struct HoldTracker {
    pressed_at: Option<Instant>,
    progress_task: Option<JoinHandle<()>>,
}

impl HoldTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a hold. Any previous unreleased hold is discarded.
    pub fn press<F>(&mut self, on_progress: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        if let Some(task) = self.progress_task.take() {
            task.abort();
        }
        let started = Instant::now();
        self.pressed_at = Some(started);
        self.progress_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(HOLD_POLL_MS));
            interval.tick().await;
            loop {
                interval.tick().await;
                on_progress(started.elapsed().as_millis() as u64);
            }
        }));
    }

    /// End the hold, cancel the progress timer, and return held time in ms.
    pub fn release(&mut self) -> u64 {
        if let Some(task) = self.progress_task.take() {
            task.abort();
        }
        self.pressed_at
            .take()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Drop for HoldTracker {
    fn drop(&mut self) {
        if let Some(task) = self.progress_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn easy_gate() -> CaptchaGate {
        CaptchaGate::new(CaptchaConfig::default())
    }

    #[test]
    fn test_easy_difficulty_is_arithmetic() {
        for _ in 0..20 {
            let gate = easy_gate();
            assert!(matches!(
                gate.challenge(),
                CaptchaChallenge::Arithmetic { .. }
            ));
        }
    }

    #[test]
    fn test_hard_difficulty_is_hold() {
        let gate = CaptchaGate::new(CaptchaConfig {
            difficulty: Difficulty::Hard,
            ..CaptchaConfig::default()
        });
        assert!(matches!(
            gate.challenge(),
            CaptchaChallenge::HoldToConfirm { required_ms: 3000 }
        ));
    }

    #[test]
    fn test_medium_difficulty_never_hold() {
        for _ in 0..30 {
            let gate = CaptchaGate::new(CaptchaConfig {
                difficulty: Difficulty::Medium,
                ..CaptchaConfig::default()
            });
            assert!(!matches!(
                gate.challenge(),
                CaptchaChallenge::HoldToConfirm { .. }
            ));
        }
    }

    #[test]
    fn test_correct_arithmetic_passes_first_attempt() {
        let mut gate = easy_gate();
        let answer = match gate.challenge() {
            CaptchaChallenge::Arithmetic { num1, num2 } => num1 + num2,
            _ => unreachable!(),
        };
        let decision = gate.submit(&CaptchaAnswer::Arithmetic { value: answer });
        assert!(decision.passed);
        assert_eq!(decision.attempt_count, 1);
        assert!(gate.passed());
        assert!(!gate.over_budget());
    }

    #[test]
    fn test_wrong_arithmetic_fails() {
        let mut gate = easy_gate();
        let wrong = match gate.challenge() {
            CaptchaChallenge::Arithmetic { num1, num2 } => num1 + num2 + 1,
            _ => unreachable!(),
        };
        let decision = gate.submit(&CaptchaAnswer::Arithmetic { value: wrong });
        assert!(!decision.passed);
        assert!(!gate.passed());
    }

    #[test]
    fn test_challenge_refreshed_after_consecutive_failures() {
        let mut gate = easy_gate();
        // Answer guaranteed wrong for any arithmetic challenge in range
        for i in 0..2 {
            let d = gate.submit(&CaptchaAnswer::Arithmetic { value: -1 });
            assert!(!d.refreshed, "attempt {} should not refresh yet", i + 1);
        }
        let d = gate.submit(&CaptchaAnswer::Arithmetic { value: -1 });
        assert!(d.refreshed, "third consecutive failure refreshes");
        assert_eq!(d.attempt_count, 3);

        // A fresh challenge was generated; the expected answer now tracks it
        let fresh = match gate.challenge() {
            CaptchaChallenge::Arithmetic { num1, num2 } => (*num1, *num2),
            _ => unreachable!(),
        };
        let decision = gate.submit(&CaptchaAnswer::Arithmetic {
            value: fresh.0 + fresh.1,
        });
        assert!(decision.passed);
        assert!(gate.over_budget(), "4 attempts exceed the default budget of 3");
    }

    #[test]
    fn test_wrong_modality_fails() {
        let mut gate = easy_gate();
        let decision = gate.submit(&CaptchaAnswer::Hold { held_ms: 10_000 });
        assert!(!decision.passed);
    }

    #[test]
    fn test_drag_order_concatenation_match() {
        let mut rng = rand::thread_rng();
        let (challenge, expected) = drag_order(&mut rng);
        let items = match &challenge {
            CaptchaChallenge::DragOrder { items } => items.clone(),
            _ => unreachable!(),
        };
        let mut ascending = items.clone();
        ascending.sort_by_key(|s| s.parse::<i64>().unwrap());

        let mut gate = CaptchaGate {
            config: CaptchaConfig::default(),
            challenge,
            expected,
            consecutive_failures: 0,
            total_attempts: 0,
            passed: false,
        };
        let decision = gate.submit(&CaptchaAnswer::DragOrder { order: ascending });
        assert!(decision.passed);
    }

    #[test]
    fn test_drag_order_wrong_order_fails() {
        let mut rng = rand::thread_rng();
        let (challenge, expected) = drag_order(&mut rng);
        let items = match &challenge {
            CaptchaChallenge::DragOrder { items } => items.clone(),
            _ => unreachable!(),
        };
        let mut descending = items.clone();
        descending.sort_by_key(|s| std::cmp::Reverse(s.parse::<i64>().unwrap()));

        let mut gate = CaptchaGate {
            config: CaptchaConfig::default(),
            challenge,
            expected,
            consecutive_failures: 0,
            total_attempts: 0,
            passed: false,
        };
        let decision = gate.submit(&CaptchaAnswer::DragOrder { order: descending });
        assert!(!decision.passed);
    }

    #[test]
    fn test_hold_below_duration_fails() {
        let mut gate = CaptchaGate::new(CaptchaConfig {
            difficulty: Difficulty::Hard,
            ..CaptchaConfig::default()
        });
        assert!(!gate.submit(&CaptchaAnswer::Hold { held_ms: 2999 }).passed);
        assert!(gate.submit(&CaptchaAnswer::Hold { held_ms: 3000 }).passed);
    }

    #[tokio::test]
    async fn test_hold_tracker_reports_progress_and_cancels() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let reports = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&reports);

        let mut tracker = HoldTracker::new();
        tracker.press(move |_elapsed| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        let held = tracker.release();
        assert!(held >= 300, "held at least the sleep duration: {}", held);
        assert!(reports.load(Ordering::SeqCst) >= 2, "progress reported");

        // After release no further progress arrives
        let after = reports.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(reports.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_hold_tracker_release_without_press() {
        let mut tracker = HoldTracker::new();
        assert_eq!(tracker.release(), 0);
    }
}
