// Session-fatal error taxonomy.
//
// Only failures that abort a respondent session live here. Everything
// recoverable (wrong captcha answer, registry write failure, cross-origin
// denial while polling) is absorbed at the call site and never surfaces
// as a FlowError.

use thiserror::Error;

/// Errors that transition the survey flow into its `Error` state.
#[derive(Debug, Error)]
pub enum FlowError {
    /// The registry rejected this project/uid pair at session start.
    #[error("session access rejected")]
    AccessDenied {
        /// Where to send the respondent instead, if the registry told us.
        redirect: Option<String>,
    },

    /// Trap questions are enabled for the project but the bank could not
    /// be fetched, so the gate sequence cannot be determined.
    #[error("trap question bank unavailable: {0}")]
    TrapBankUnavailable(String),

    /// The registry could not be reached for access validation.
    #[error("registry error: {0}")]
    Registry(#[from] anyhow::Error),
}

impl FlowError {
    /// Whether the respondent should be offered a retry affordance.
    ///
    /// All flow errors are retryable from the respondent's point of view;
    /// an access rejection with a redirect is the one case where we send
    /// them elsewhere instead.
    pub fn retryable(&self) -> bool {
        !matches!(
            self,
            FlowError::AccessDenied {
                redirect: Some(_)
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied_with_redirect_not_retryable() {
        let err = FlowError::AccessDenied {
            redirect: Some("https://example.com/closed".to_string()),
        };
        assert!(!err.retryable());
    }

    #[test]
    fn test_access_denied_without_redirect_retryable() {
        let err = FlowError::AccessDenied { redirect: None };
        assert!(err.retryable());
    }

    #[test]
    fn test_trap_bank_unavailable_retryable() {
        let err = FlowError::TrapBankUnavailable("timeout".to_string());
        assert!(err.retryable());
    }
}
