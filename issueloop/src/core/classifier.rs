//! Failure classification for agent exits and processing errors.
//!
//! Agent failures are classified by an ordered rule table over the exit code
//! and a bounded, case-insensitive output tail. The first matching rule wins.

/// What a rule matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    /// Any of these exit codes.
    ExitCode(&'static [i32]),
    /// Any of these lowercase substrings in the output tail.
    Markers(&'static [&'static str]),
}

/// One row of the classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRule {
    pub matcher: Matcher,
    /// Reason tag. `None` keeps the generic `codex_exit_<code>` reason.
    pub tag: Option<&'static str>,
    pub retryable: bool,
}

/// Classified agent failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub reason: String,
    pub retryable: bool,
}

pub const REASON_CANCELED: &str = "codex_canceled";
/// Agent reported an interrupt that the runner did not request.
pub const REASON_INTERRUPTED: &str = "codex_interrupted";
pub const REASON_AUTH: &str = "codex_auth_error";
pub const REASON_INVALID_ARGS: &str = "codex_invalid_args";
pub const REASON_MODEL: &str = "codex_model_error";
pub const REASON_PERMISSION: &str = "codex_permission_denied";

/// Exit codes produced when the agent is interrupted (SIGINT / SIGTERM via shell).
const CANCELED_EXIT_CODES: &[i32] = &[130, 143];

const AUTH_MARKERS: &[&str] = &[
    "not logged in",
    "please log in",
    "login required",
    "unauthorized",
    "invalid api key",
    "incorrect api key",
    "authentication failed",
    "authentication required",
    "status 401",
];

const INVALID_ARG_MARKERS: &[&str] = &[
    "unexpected argument",
    "unrecognized option",
    "unknown option",
    "invalid value for",
    "error: usage:",
];

const MODEL_MARKERS: &[&str] = &[
    "model not found",
    "model_not_found",
    "unknown model",
    "unsupported model",
    "does not exist or you do not have access",
    "does not have access to model",
];

const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "operation not permitted",
    "read-only file system",
    "sandbox blocked",
    "approval required",
];

const NETWORK_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "network is unreachable",
    "temporary failure in name resolution",
    "dns error",
    "timed out",
    "stream disconnected",
    "rate limit",
    "too many requests",
    "status 429",
    "status 500",
    "status 502",
    "status 503",
    "service unavailable",
];

/// Shell convention for "found but not executable".
const NOT_EXECUTABLE_EXIT_CODES: &[i32] = &[126];

/// Default precedence: cancel, auth, args, model, permission, network,
/// permission fallback. Anything else is a retryable generic exit.
pub const DEFAULT_RULES: &[FailureRule] = &[
    FailureRule {
        matcher: Matcher::ExitCode(CANCELED_EXIT_CODES),
        tag: Some(REASON_CANCELED),
        retryable: false,
    },
    FailureRule {
        matcher: Matcher::Markers(AUTH_MARKERS),
        tag: Some(REASON_AUTH),
        retryable: false,
    },
    FailureRule {
        matcher: Matcher::Markers(INVALID_ARG_MARKERS),
        tag: Some(REASON_INVALID_ARGS),
        retryable: false,
    },
    FailureRule {
        matcher: Matcher::Markers(MODEL_MARKERS),
        tag: Some(REASON_MODEL),
        retryable: false,
    },
    FailureRule {
        matcher: Matcher::Markers(PERMISSION_MARKERS),
        tag: Some(REASON_PERMISSION),
        retryable: false,
    },
    FailureRule {
        matcher: Matcher::Markers(NETWORK_MARKERS),
        tag: None,
        retryable: true,
    },
    FailureRule {
        matcher: Matcher::ExitCode(NOT_EXECUTABLE_EXIT_CODES),
        tag: Some(REASON_PERMISSION),
        retryable: false,
    },
];

/// Classify a non-zero agent exit against `rules`.
pub fn classify_exit(rules: &[FailureRule], exit_code: i32, tail: &str) -> Classification {
    let lowered = tail.to_lowercase();
    let generic = format!("codex_exit_{exit_code}");
    for rule in rules {
        let matched = match rule.matcher {
            Matcher::ExitCode(codes) => codes.contains(&exit_code),
            Matcher::Markers(markers) => markers.iter().any(|m| lowered.contains(m)),
        };
        if matched {
            return Classification {
                reason: rule.tag.map(str::to_string).unwrap_or(generic),
                retryable: rule.retryable,
            };
        }
    }
    Classification {
        reason: generic,
        retryable: true,
    }
}

pub fn timeout_reason(timeout_secs: u64) -> String {
    format!("codex_timeout_{timeout_secs}s")
}

pub fn exhausted_reason(attempts: u32) -> String {
    format!("codex_failed_after_{attempts}_attempts")
}

/// True when a processing error message looks like an environment permission problem.
pub fn is_permission_like(message: &str) -> bool {
    let lowered = message.to_lowercase();
    PERMISSION_MARKERS.iter().any(|m| lowered.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(code: i32, tail: &str) -> Classification {
        classify_exit(DEFAULT_RULES, code, tail)
    }

    #[test]
    fn connection_refused_is_retryable_generic() {
        let c = classify(1, "error: Connection refused (os error 111)");
        assert_eq!(c.reason, "codex_exit_1");
        assert!(c.retryable);
    }

    #[test]
    fn not_logged_in_is_terminal_auth_error() {
        let c = classify(1, "Error: Not logged in. Run `codex login`.");
        assert_eq!(c.reason, REASON_AUTH);
        assert!(!c.retryable);
    }

    #[test]
    fn canceled_exit_code_wins_over_markers() {
        let c = classify(130, "not logged in");
        assert_eq!(c.reason, REASON_CANCELED);
        assert!(!c.retryable);
    }

    #[test]
    fn auth_precedes_permission_markers() {
        let c = classify(1, "permission denied: unauthorized");
        assert_eq!(c.reason, REASON_AUTH);
    }

    #[test]
    fn permission_precedes_network_markers() {
        let c = classify(1, "operation not permitted after connection reset");
        assert_eq!(c.reason, REASON_PERMISSION);
        assert!(!c.retryable);
    }

    #[test]
    fn invalid_args_and_model_errors_are_terminal() {
        assert_eq!(
            classify(2, "error: unexpected argument '--foo' found").reason,
            REASON_INVALID_ARGS
        );
        assert_eq!(classify(1, "Unknown model: gpt-x").reason, REASON_MODEL);
    }

    #[test]
    fn exit_126_falls_back_to_permission_denied() {
        let c = classify(126, "");
        assert_eq!(c.reason, REASON_PERMISSION);
        assert!(!c.retryable);
    }

    #[test]
    fn unknown_failure_is_retryable_generic() {
        let c = classify(3, "something odd happened");
        assert_eq!(c.reason, "codex_exit_3");
        assert!(c.retryable);
    }

    #[test]
    fn custom_rules_extend_without_control_flow_changes() {
        let rules = [FailureRule {
            matcher: Matcher::Markers(&["quota exceeded"]),
            tag: Some("codex_quota"),
            retryable: false,
        }];
        let c = classify_exit(&rules, 1, "Quota Exceeded for org");
        assert_eq!(c.reason, "codex_quota");
        assert!(!c.retryable);
    }

    #[test]
    fn permission_like_messages() {
        assert!(is_permission_like("rename: Permission denied (os error 13)"));
        assert!(is_permission_like("Read-only file system"));
        assert!(!is_permission_like("no such file"));
    }
}
