//! 调度错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 DispatchError 与工具幂等类别决定 RetryWithPrompt / RetryWithBackoff / RestartTurn / FailSession 等。
//! 所有规划器与工具失败在进入状态机之前都会被归类为 DispatchError，不会有异常穿透编排引擎边界。

use thiserror::Error;

use crate::core::state::Stage;
use crate::core::tracker::InvocationId;
use crate::session::SessionId;

/// 编排过程中可能出现的错误（规划器输出非法、状态冲突、工具超时、会话生命周期等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// 规划器给出的工具参数不符合声明的 schema
    #[error("Schema validation failed for {tool}: {detail}")]
    SchemaValidation { tool: String, detail: String },

    /// 当前业务阶段不允许该工具 / 该状态迁移
    #[error("Illegal transition: {tool} is not allowed at stage {stage} ({detail})")]
    IllegalTransition {
        tool: String,
        stage: Stage,
        detail: String,
    },

    /// 乐观并发检查失败：提议迁移的源阶段与会话当前阶段不一致
    #[error("Stale transition: expected stage {expected}, found {actual}")]
    StaleTransition { expected: Stage, actual: Stage },

    #[error("Transition for turn {turn} was already applied")]
    TransitionReplayed { turn: u32 },

    #[error("Business state is terminal ({0})")]
    TerminalState(Stage),

    #[error("Duplicate invocation for turn {turn} (existing {existing})")]
    DuplicateInvocation { turn: u32, existing: InvocationId },

    /// 调用记录已处于终态，不可再写
    #[error("Invocation {0} is already closed")]
    InvocationClosed(InvocationId),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Tool backend error ({tool}): {detail}")]
    ToolBackendError {
        tool: String,
        detail: String,
        /// true 表示可重试（后端暂不可用），false 表示业务/校验错误
        transient: bool,
    },

    #[error("Turn budget exhausted after {0} turns")]
    TurnBudgetExhausted(u32),

    #[error("Session expired: {0}")]
    SessionExpired(SessionId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Cancelled")]
    Cancelled,

    #[error("Planner unavailable: {0}")]
    PlannerUnavailable(String),
}

impl DispatchError {
    /// 稳定的 snake_case 错误标签（HTTP 错误体、日志字段使用）
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnknownTool(_) => "unknown_tool",
            DispatchError::SchemaValidation { .. } => "schema_validation_error",
            DispatchError::IllegalTransition { .. } => "illegal_transition",
            DispatchError::StaleTransition { .. } => "stale_transition",
            DispatchError::TransitionReplayed { .. } => "transition_replayed",
            DispatchError::TerminalState(_) => "terminal_state",
            DispatchError::DuplicateInvocation { .. } => "duplicate_invocation",
            DispatchError::InvocationClosed(_) => "invocation_closed",
            DispatchError::ToolTimeout(_) => "tool_timeout",
            DispatchError::ToolBackendError { .. } => "tool_backend_error",
            DispatchError::TurnBudgetExhausted(_) => "turn_budget_exhausted",
            DispatchError::SessionExpired(_) => "session_expired",
            DispatchError::SessionNotFound(_) => "session_not_found",
            DispatchError::Cancelled => "cancelled",
            DispatchError::PlannerUnavailable(_) => "planner_unavailable",
        }
    }

    /// 写入 `Failed(reason)` 的原因字符串
    pub fn failure_reason(&self) -> &'static str {
        match self {
            DispatchError::SessionExpired(_) => "expired",
            other => other.kind(),
        }
    }

    /// 超时 / 后端暂不可用 / 规划器不可用 属于瞬时失败
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::ToolTimeout(_)
                | DispatchError::ToolBackendError {
                    transient: true,
                    ..
                }
                | DispatchError::PlannerUnavailable(_)
        )
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 将纠正提示注入下一轮，让规划器重新决策（消耗一个回合）
    RetryWithPrompt(String),
    /// 同一调用按指数退避重新派发（仅幂等工具）
    RetryWithBackoff,
    /// 状态在本回合之下被改变，丢弃本回合并重新询问规划器
    RestartTurn,
    /// 会话进入 Failed(reason)
    FailSession(String),
    /// 已应用过的重放，视为无操作
    Ignore,
    /// 终止当前回合，不改动业务状态（取消等）
    Abort,
}
