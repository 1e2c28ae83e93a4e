//! 工具执行器
//!
//! 持有 ToolRegistry，invoke(tool, ctx, input, deadline) 在截止时间内调用工具，
//! 结果归类为 ToolOutcome（Succeeded / TransientFailure / FatalFailure）；取消令牌可中断进行中的调用。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout_at;

use crate::core::DispatchError;
use crate::tools::{ToolContext, ToolRegistry, ToolSpec};

/// 工具调用失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolFailure {
    #[error("timed out")]
    Timeout,
    /// 后端暂不可用（可重试）
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// 业务或校验错误（不可重试）
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("cancelled")]
    Cancelled,
}

impl ToolFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, ToolFailure::Timeout | ToolFailure::Unavailable(_))
    }

    pub fn into_error(self, tool: &str) -> DispatchError {
        match self {
            ToolFailure::Timeout => DispatchError::ToolTimeout(tool.to_string()),
            ToolFailure::Unavailable(detail) => DispatchError::ToolBackendError {
                tool: tool.to_string(),
                detail,
                transient: true,
            },
            ToolFailure::Rejected(detail) => DispatchError::ToolBackendError {
                tool: tool.to_string(),
                detail,
                transient: false,
            },
            ToolFailure::Cancelled => DispatchError::Cancelled,
        }
    }
}

/// 单次工具调用结果
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Succeeded(Value),
    TransientFailure(ToolFailure),
    FatalFailure(ToolFailure),
}

impl ToolOutcome {
    pub fn from_result(result: Result<Value, ToolFailure>) -> Self {
        match result {
            Ok(v) => ToolOutcome::Succeeded(v),
            Err(f) if f.is_transient() => ToolOutcome::TransientFailure(f),
            Err(f) => ToolOutcome::FatalFailure(f),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ToolOutcome::Succeeded(_) => "ok",
            ToolOutcome::TransientFailure(ToolFailure::Timeout) => "timeout",
            ToolOutcome::TransientFailure(_) => "transient",
            ToolOutcome::FatalFailure(ToolFailure::Cancelled) => "cancelled",
            ToolOutcome::FatalFailure(_) => "fatal",
        }
    }
}

/// 工具执行器：对每次调用施加截止时间与取消，并将结果归类
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn spec(&self, tool: &str) -> Result<ToolSpec, DispatchError> {
        self.registry.spec(tool)
    }

    /// 调用工具；实际截止时间取 deadline 与工具自身超时的较早者
    pub async fn invoke(
        &self,
        tool_name: &str,
        ctx: &ToolContext,
        input: Value,
        deadline: Instant,
    ) -> ToolOutcome {
        let tool = match self.registry.resolve(tool_name) {
            Ok(t) => t,
            Err(e) => return ToolOutcome::FatalFailure(ToolFailure::Rejected(e.to_string())),
        };
        let start = Instant::now();
        let deadline = deadline.min(start + tool.spec().timeout);
        let args_preview = args_preview(&input);

        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => ToolOutcome::FatalFailure(ToolFailure::Cancelled),
            result = timeout_at(deadline.into(), tool.execute(ctx, input)) => match result {
                Ok(r) => ToolOutcome::from_result(r),
                Err(_) => ToolOutcome::TransientFailure(ToolFailure::Timeout),
            },
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "session": ctx.session_id,
            "tool": tool_name,
            "outcome": outcome.label(),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit, "tool");
        outcome
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use crate::tools::{IdempotencyClass, Tool};

    struct SlowTool {
        spec: ToolSpec,
        delay: Duration,
        result: Result<Value, ToolFailure>,
    }

    impl SlowTool {
        fn new(delay: Duration, result: Result<Value, ToolFailure>) -> Self {
            Self {
                spec: ToolSpec {
                    name: "slow".to_string(),
                    description: "sleeps".to_string(),
                    fields: vec![],
                    idempotency: IdempotencyClass::Idempotent,
                    timeout: Duration::from_millis(50),
                },
                delay,
                result,
            }
        }
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }

        async fn execute(&self, _ctx: &ToolContext, _input: Value) -> Result<Value, ToolFailure> {
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    fn executor(tool: SlowTool) -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(tool);
        ToolExecutor::new(Arc::new(registry))
    }

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: "s-1".to_string(),
            device_location: None,
            cancel: CancellationToken::new(),
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_success_passes_output_through() {
        let exec = executor(SlowTool::new(Duration::ZERO, Ok(json!({"ok": true}))));
        let outcome = exec.invoke("slow", &ctx(), json!({}), far_deadline()).await;
        assert_eq!(outcome, ToolOutcome::Succeeded(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_tool_timeout_is_transient() {
        let exec = executor(SlowTool::new(Duration::from_secs(2), Ok(Value::Null)));
        let outcome = exec.invoke("slow", &ctx(), json!({}), far_deadline()).await;
        assert_eq!(outcome, ToolOutcome::TransientFailure(ToolFailure::Timeout));
    }

    #[tokio::test]
    async fn test_rejection_is_fatal() {
        let exec = executor(SlowTool::new(
            Duration::ZERO,
            Err(ToolFailure::Rejected("unit not available".to_string())),
        ));
        let outcome = exec.invoke("slow", &ctx(), json!({}), far_deadline()).await;
        assert!(matches!(outcome, ToolOutcome::FatalFailure(ToolFailure::Rejected(_))));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_call() {
        let exec = executor(SlowTool::new(Duration::from_secs(2), Ok(Value::Null)));
        let ctx = ctx();
        ctx.cancel.cancel();
        let outcome = exec.invoke("slow", &ctx, json!({}), far_deadline()).await;
        assert_eq!(outcome, ToolOutcome::FatalFailure(ToolFailure::Cancelled));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_fatal() {
        let exec = executor(SlowTool::new(Duration::ZERO, Ok(Value::Null)));
        let outcome = exec.invoke("nope", &ctx(), json!({}), far_deadline()).await;
        assert!(matches!(outcome, ToolOutcome::FatalFailure(_)));
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            ToolFailure::Timeout.into_error("find_ambulances"),
            DispatchError::ToolTimeout("find_ambulances".to_string())
        );
        assert!(ToolFailure::Unavailable("503".to_string())
            .into_error("x")
            .is_transient());
        assert!(!ToolFailure::Rejected("bad".to_string())
            .into_error("x")
            .is_transient());
    }
}
