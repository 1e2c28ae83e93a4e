//! 错误恢复引擎
//!
//! 根据 DispatchError 与工具幂等类别返回 RecoveryAction；决策是错误标签与幂等类别的纯函数，
//! 编排引擎据此决定纠正提示重试、退避重派、重启回合还是让会话失败。

use std::time::Duration;

use crate::core::{DispatchError, RecoveryAction};
use crate::tools::IdempotencyClass;

/// 退避与重试上限配置
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 单次调用的最大尝试次数（含首次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待时长：base * 2^(attempt-1)，不超过 max_delay
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// class 为触发错误的工具的幂等类别；与工具无关的错误传 Idempotent 即可
    pub fn handle(&self, err: &DispatchError, class: IdempotencyClass) -> RecoveryAction {
        match err {
            DispatchError::UnknownTool(name) => RecoveryAction::RetryWithPrompt(format!(
                "The tool '{name}' does not exist. Only use the tools listed in the system prompt."
            )),
            DispatchError::SchemaValidation { tool, detail } => {
                RecoveryAction::RetryWithPrompt(format!(
                    "The arguments for '{tool}' were invalid: {detail}. \
                     Reply with exactly one JSON object matching the decision schema."
                ))
            }
            DispatchError::IllegalTransition {
                tool,
                stage,
                detail,
            } => RecoveryAction::RetryWithPrompt(format!(
                "'{tool}' cannot be used while the session is at stage '{stage}': {detail}. \
                 Choose one of the tools allowed for this stage."
            )),
            DispatchError::StaleTransition { .. } => RecoveryAction::RestartTurn,
            DispatchError::TransitionReplayed { .. } | DispatchError::DuplicateInvocation { .. } => {
                RecoveryAction::Ignore
            }
            e if e.is_transient() => match class {
                IdempotencyClass::Idempotent => RecoveryAction::RetryWithBackoff,
                // 不可逆副作用：绝不静默重试
                IdempotencyClass::EffectOnce => {
                    RecoveryAction::FailSession(e.failure_reason().to_string())
                }
            },
            DispatchError::Cancelled | DispatchError::TerminalState(_) => RecoveryAction::Abort,
            other => RecoveryAction::FailSession(other.failure_reason().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Stage;

    #[test]
    fn test_schema_error_becomes_corrective_prompt() {
        let engine = RecoveryEngine::new();
        let err = DispatchError::SchemaValidation {
            tool: "book_ambulance".to_string(),
            detail: "missing field ambulance_id".to_string(),
        };
        match engine.handle(&err, IdempotencyClass::EffectOnce) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("ambulance_id")),
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_illegal_transition_mentions_stage() {
        let engine = RecoveryEngine::new();
        let err = DispatchError::IllegalTransition {
            tool: "book_ambulance".to_string(),
            stage: Stage::Init,
            detail: "location unknown".to_string(),
        };
        match engine.handle(&err, IdempotencyClass::EffectOnce) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("init")),
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_retries_only_idempotent_tools() {
        let engine = RecoveryEngine::new();
        let err = DispatchError::ToolTimeout("find_ambulances".to_string());
        assert_eq!(
            engine.handle(&err, IdempotencyClass::Idempotent),
            RecoveryAction::RetryWithBackoff
        );
        assert_eq!(
            engine.handle(&err, IdempotencyClass::EffectOnce),
            RecoveryAction::FailSession("tool_timeout".to_string())
        );
    }

    #[test]
    fn test_fatal_backend_error_fails_session() {
        let engine = RecoveryEngine::new();
        let err = DispatchError::ToolBackendError {
            tool: "find_ambulances".to_string(),
            detail: "bad coordinates".to_string(),
            transient: false,
        };
        assert_eq!(
            engine.handle(&err, IdempotencyClass::Idempotent),
            RecoveryAction::FailSession("tool_backend_error".to_string())
        );
    }

    #[test]
    fn test_stale_transition_restarts_turn() {
        let engine = RecoveryEngine::new();
        let err = DispatchError::StaleTransition {
            expected: Stage::LocationKnown,
            actual: Stage::CandidatesFound,
        };
        assert_eq!(
            engine.handle(&err, IdempotencyClass::Idempotent),
            RecoveryAction::RestartTurn
        );
    }

    #[test]
    fn test_expiry_reason_is_expired() {
        let engine = RecoveryEngine::new();
        let err = DispatchError::SessionExpired("s-1".to_string());
        assert_eq!(
            engine.handle(&err, IdempotencyClass::Idempotent),
            RecoveryAction::FailSession("expired".to_string())
        );
    }

    #[test]
    fn test_cancelled_aborts() {
        let engine = RecoveryEngine::new();
        assert_eq!(
            engine.handle(&DispatchError::Cancelled, IdempotencyClass::Idempotent),
            RecoveryAction::Abort
        );
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }
}
