// Trap-question (attention check) gate
//
// Second gate of the challenge sequence. One question is drawn at random
// from the project's bank. A wrong answer never blocks progression: the
// respondent proceeds to the survey regardless, and the failure is
// recorded and reported upstream as a quality signal.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Trap gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrapConfig {
    pub enable_trap_questions: bool,
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self {
            enable_trap_questions: true,
        }
    }
}

/// Attention-check question with a known correct answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrapQuestion {
    pub id: String,
    /// Text shown to the respondent
    pub prompt: String,
    #[serde(flatten)]
    pub kind: TrapQuestionKind,
}

/// Question modality and its answer key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TrapQuestionKind {
    /// Free-text entry; compared case-insensitively, whitespace-trimmed
    FreeText { correct: String },
    /// One of the listed options; compared by exact value
    MultipleChoice {
        options: Vec<String>,
        correct: String,
    },
    /// Fixed country list selector; compared case-insensitively
    CountrySelect { correct: String },
}

/// Trap gate state for one session.
pub struct TrapGate {
    question: TrapQuestion,
}

impl TrapGate {
    /// Draw one random question from the bank. Returns `None` for an
    /// empty bank (the gate is skipped).
    pub fn select(bank: &[TrapQuestion]) -> Option<Self> {
        let question = bank.choose(&mut rand::thread_rng())?.clone();
        Some(Self { question })
    }

    /// The question presented to the respondent.
    pub fn question(&self) -> &TrapQuestion {
        &self.question
    }

    /// Check the respondent's answer against the key.
    pub fn check(&self, answer: &str) -> bool {
        match &self.question.kind {
            TrapQuestionKind::FreeText { correct }
            | TrapQuestionKind::CountrySelect { correct } => {
                answer.trim().eq_ignore_ascii_case(correct.trim())
            }
            TrapQuestionKind::MultipleChoice { correct, .. } => answer == correct,
        }
    }
}
