//! 执行追踪：每次工具调用的生命周期
//!
//! 每个会话一份只追加的调用日志，按 (session, turn) 唯一；状态 Pending -> Running -> (Retrying -> Running)* -> Succeeded / Failed，
//! 进入终态后不可再改。重试不新增记录，只递增同一调用的 attempts。

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::DispatchError;
use crate::session::SessionId;
use crate::tools::IdempotencyClass;

/// 调用 ID（会话内日志下标）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(usize);

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inv-{}", self.0)
    }
}

/// 请求身份：会话 + 回合号 + 工具名
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestIdentity {
    pub session_id: SessionId,
    pub turn: u32,
    pub tool: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded { output: Value },
    Failed { error: String },
    /// 等待第 attempt 次尝试
    Retrying { attempt: u32 },
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationStatus::Succeeded { .. } | InvocationStatus::Failed { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            InvocationStatus::Pending => "pending",
            InvocationStatus::Running => "running",
            InvocationStatus::Succeeded { .. } => "succeeded",
            InvocationStatus::Failed { .. } => "failed",
            InvocationStatus::Retrying { .. } => "retrying",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: InvocationId,
    pub identity: RequestIdentity,
    pub input: Value,
    pub idempotency: IdempotencyClass,
    pub status: InvocationStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 单会话执行追踪器
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionTracker {
    session_id: SessionId,
    /// 单次调用的最大尝试次数
    max_attempts: u32,
    log: Vec<ToolInvocation>,
    by_turn: HashMap<u32, InvocationId>,
}

impl ExecutionTracker {
    pub fn new(session_id: impl Into<SessionId>, max_attempts: u32) -> Self {
        Self {
            session_id: session_id.into(),
            max_attempts: max_attempts.max(1),
            log: Vec::new(),
            by_turn: HashMap::new(),
        }
    }

    /// 登记一次调用；同一回合已存在调用时返回 DuplicateInvocation（携带已有 ID，供幂等重入）
    pub fn begin(
        &mut self,
        turn: u32,
        tool: &str,
        input: Value,
        idempotency: IdempotencyClass,
    ) -> Result<InvocationId, DispatchError> {
        if let Some(existing) = self.by_turn.get(&turn) {
            return Err(DispatchError::DuplicateInvocation {
                turn,
                existing: *existing,
            });
        }
        let id = InvocationId(self.log.len());
        let now = Utc::now();
        self.log.push(ToolInvocation {
            id,
            identity: RequestIdentity {
                session_id: self.session_id.clone(),
                turn,
                tool: tool.to_string(),
            },
            input,
            idempotency,
            status: InvocationStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
        });
        self.by_turn.insert(turn, id);
        Ok(id)
    }

    /// 开始一次尝试，返回当前尝试序号（从 1 开始）
    pub fn start_attempt(&mut self, id: InvocationId) -> Result<u32, DispatchError> {
        let inv = self.open_mut(id)?;
        inv.attempts += 1;
        inv.status = InvocationStatus::Running;
        inv.updated_at = Utc::now();
        Ok(inv.attempts)
    }

    /// 标记等待重试，返回下一次尝试序号
    pub fn mark_retrying(&mut self, id: InvocationId) -> Result<u32, DispatchError> {
        let inv = self.open_mut(id)?;
        let next = inv.attempts + 1;
        inv.status = InvocationStatus::Retrying { attempt: next };
        inv.updated_at = Utc::now();
        Ok(next)
    }

    pub fn complete(&mut self, id: InvocationId, output: Value) -> Result<(), DispatchError> {
        let inv = self.open_mut(id)?;
        inv.status = InvocationStatus::Succeeded { output };
        inv.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, id: InvocationId, error: impl Into<String>) -> Result<(), DispatchError> {
        let inv = self.open_mut(id)?;
        inv.status = InvocationStatus::Failed {
            error: error.into(),
        };
        inv.updated_at = Utc::now();
        Ok(())
    }

    /// 仅当工具幂等、尝试次数低于上限、且失败为瞬时失败时可重试
    pub fn should_retry(&self, id: InvocationId, error: &DispatchError) -> bool {
        let Some(inv) = self.get(id) else {
            return false;
        };
        !inv.status.is_terminal()
            && inv.idempotency == IdempotencyClass::Idempotent
            && inv.attempts < self.max_attempts
            && error.is_transient()
    }

    /// 将所有未终结的调用记为失败（取消 / 回合被中途丢弃），返回被关闭的数量
    pub fn close_open(&mut self, reason: &str) -> usize {
        let now = Utc::now();
        let mut closed = 0;
        for inv in self.log.iter_mut().filter(|i| !i.status.is_terminal()) {
            inv.status = InvocationStatus::Failed {
                error: reason.to_string(),
            };
            inv.updated_at = now;
            closed += 1;
        }
        closed
    }

    pub fn get(&self, id: InvocationId) -> Option<&ToolInvocation> {
        self.log.get(id.0)
    }

    pub fn for_turn(&self, turn: u32) -> Option<&ToolInvocation> {
        self.by_turn.get(&turn).and_then(|id| self.get(*id))
    }

    pub fn log(&self) -> &[ToolInvocation] {
        &self.log
    }

    /// 最近 n 条调用（规划器上下文用）
    pub fn recent(&self, n: usize) -> &[ToolInvocation] {
        &self.log[self.log.len().saturating_sub(n)..]
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    fn open_mut(&mut self, id: InvocationId) -> Result<&mut ToolInvocation, DispatchError> {
        match self.log.get_mut(id.0) {
            Some(inv) if !inv.status.is_terminal() => Ok(inv),
            _ => Err(DispatchError::InvocationClosed(id)),
        }
    }
}
