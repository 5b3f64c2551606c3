//! Exit-code and stderr interpretation

use regex::Regex;
use std::sync::OnceLock;

/// Conventional exit codes for signal-terminated processes
/// (128 + SIGINT, 128 + SIGTERM)
const SIGINT_EXIT: i32 = 130;
const SIGTERM_EXIT: i32 = 143;

/// How a finished turn is classified for the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// User-initiated abort - no error surfaced, completion still emitted
    Aborted,
    /// No credentials configured at all
    AuthMissing,
    /// Credentials present but rejected or expired
    NotAuthenticated,
    /// Any other non-zero, non-abort exit
    Failure,
}

impl ExitClass {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ExitClass::AuthMissing | ExitClass::NotAuthenticated | ExitClass::Failure
        )
    }

    /// Tailored remediation message shown alongside the failure
    pub fn remediation(self) -> Option<&'static str> {
        match self {
            ExitClass::AuthMissing => Some(
                "No agent credentials found. Set the API key environment variable \
                 or run the agent's login flow, then try again.",
            ),
            ExitClass::NotAuthenticated => Some(
                "The agent rejected the stored credentials. Re-run the agent's \
                 login flow to refresh them.",
            ),
            ExitClass::Failure => Some("The agent process failed. See the error output for details."),
            ExitClass::Success | ExitClass::Aborted => None,
        }
    }
}

fn auth_missing_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)api.?key (is )?(not set|missing|not found)|no credentials|ANTHROPIC_API_KEY")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

fn not_authenticated_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)not (logged in|authenticated)|invalid api.?key|please run .*login|authentication[_ ]error|token (has )?expired")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

/// Interpret a finished process.
///
/// `code` is `None` when the process was killed by a signal. An abort that
/// was requested through the cancellation token wins over everything else:
/// once aborted, the turn may not be classified as anything but aborted.
pub fn classify_exit(code: Option<i32>, abort_requested: bool, stderr: &str) -> ExitClass {
    if abort_requested {
        return ExitClass::Aborted;
    }
    match code {
        Some(0) => ExitClass::Success,
        None | Some(SIGINT_EXIT | SIGTERM_EXIT) => ExitClass::Aborted,
        Some(_) => {
            if auth_missing_pattern().is_match(stderr) {
                ExitClass::AuthMissing
            } else if not_authenticated_pattern().is_match(stderr) {
                ExitClass::NotAuthenticated
            } else {
                ExitClass::Failure
            }
        }
    }
}
