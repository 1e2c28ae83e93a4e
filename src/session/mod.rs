//! 会话：一次端到端的急救处理流程
//!
//! 每个会话独占一份业务状态与一份执行日志，由 SessionManager 持有，
//! 只有持有会话锁的编排回合可以修改。

pub mod manager;
pub mod persistence;

pub use manager::{SessionHandle, SessionManager};
pub use persistence::SnapshotFile;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Ambulance, BookingRecord, BusinessStateStore, Coordinates, ExecutionTracker, Stage};
use crate::llm::Message;

/// 会话 ID
pub type SessionId = String;

pub fn new_session_id() -> SessionId {
    format!("session_{}", uuid::Uuid::new_v4())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub business: BusinessStateStore,
    pub execution: ExecutionTracker,
    /// 已消耗的回合数（即最近一个回合号，单调递增）
    pub turns: u32,
    pub transcript: Vec<Message>,
    /// 最近一次请求携带的设备位置
    #[serde(default)]
    pub device_location: Option<Coordinates>,
}

impl Session {
    pub fn new(id: SessionId, max_tool_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            execution: ExecutionTracker::new(id.clone(), max_tool_attempts),
            id,
            created_at: now,
            last_activity: now,
            business: BusinessStateStore::new(),
            turns: 0,
            transcript: Vec::new(),
            device_location: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn stage(&self) -> Stage {
        self.business.stage()
    }

    /// 空闲时长是否超过 ttl
    pub fn is_idle(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.last_activity > ttl
    }

    /// 规划器看到的会话快照：业务事实 + 最近 recent 条调用
    pub fn snapshot(&self, recent: usize, turn_budget: u32) -> SessionSnapshot {
        let state = self.business.current();
        let stage = state.stage();
        SessionSnapshot {
            session_id: self.id.clone(),
            stage,
            allowed_tools: stage.allowed_tools().iter().map(|t| t.to_string()).collect(),
            location: state.location(),
            candidates: state.candidates().to_vec(),
            booking: state.booking().cloned(),
            failure_reason: state.failure_reason().map(String::from),
            turns_used: self.turns,
            turn_budget,
            recent_invocations: self
                .execution
                .recent(recent)
                .iter()
                .map(|inv| InvocationSummary {
                    turn: inv.identity.turn,
                    tool: inv.identity.tool.clone(),
                    status: inv.status.label().to_string(),
                    attempts: inv.attempts,
                    error: match &inv.status {
                        crate::core::InvocationStatus::Failed { error } => Some(error.clone()),
                        _ => None,
                    },
                })
                .collect(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.business.current();
        SessionSummary {
            id: self.id.clone(),
            stage: state.stage(),
            turns: self.turns,
            invocations: self.execution.len(),
            booking_id: state.booking().map(|b| b.booking_id.clone()),
            failure_reason: state.failure_reason().map(String::from),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

/// 规划器上下文中的会话快照
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub stage: Stage,
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub location: Option<Coordinates>,
    #[serde(default)]
    pub candidates: Vec<Ambulance>,
    #[serde(default)]
    pub booking: Option<BookingRecord>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub turns_used: u32,
    pub turn_budget: u32,
    #[serde(default)]
    pub recent_invocations: Vec<InvocationSummary>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationSummary {
    pub turn: u32,
    pub tool: String,
    pub status: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 会话列表条目
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub stage: Stage,
    pub turns: u32,
    pub invocations: usize,
    pub booking_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ProposedTransition, Transition};
    use crate::tools::IdempotencyClass;
    use serde_json::json;

    #[test]
    fn test_snapshot_reflects_state_and_log() {
        let mut s = Session::new("s-1".to_string(), 3);
        s.turns = 1;
        let id = s
            .execution
            .begin(1, "get_location", json!({}), IdempotencyClass::Idempotent)
            .unwrap();
        s.execution.start_attempt(id).unwrap();
        s.execution.complete(id, json!({"lat": 1.0, "lon": 2.0})).unwrap();
        s.business
            .apply(ProposedTransition {
                turn: 1,
                expected: Stage::Init,
                transition: Transition::LocationAcquired {
                    location: Coordinates::new(1.0, 2.0),
                },
            })
            .unwrap();

        let snap = s.snapshot(5, 10);
        assert_eq!(snap.stage, Stage::LocationKnown);
        assert_eq!(snap.allowed_tools, vec!["get_location", "find_ambulances"]);
        assert_eq!(snap.location, Some(Coordinates::new(1.0, 2.0)));
        assert_eq!(snap.recent_invocations.len(), 1);
        assert_eq!(snap.recent_invocations[0].status, "succeeded");

        let back: SessionSnapshot =
            serde_json::from_str(&serde_json::to_string(&snap).unwrap()).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn test_idle_check() {
        let s = Session::new(new_session_id(), 3);
        let later = s.last_activity + chrono::Duration::minutes(31);
        assert!(s.is_idle(later, chrono::Duration::minutes(30)));
        assert!(!s.is_idle(s.last_activity, chrono::Duration::minutes(30)));
    }
}
