//! 无需 API 的 LLM 客户端
//!
//! - MockLlmClient：按会话快照中的阶段给出下一步合法决策（本地演示）
//! - ScriptedLlmClient：按顺序回放预设输出（测试）

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::core::Stage;
use crate::llm::{LlmClient, LlmError, Message, Role};
use crate::planner::SNAPSHOT_PREFIX;
use crate::session::SessionSnapshot;
use crate::tools::{BOOK_AMBULANCE, FIND_AMBULANCES, GET_LOCATION};

/// 阶段驱动的确定性规划器：Init 定位、LocationKnown 查找、CandidatesFound 预约最近可用车辆、终态给出答复
#[derive(Debug, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    fn decide(snapshot: &SessionSnapshot) -> serde_json::Value {
        match snapshot.stage {
            Stage::Init => tool_call(GET_LOCATION, json!({})),
            Stage::LocationKnown => tool_call(FIND_AMBULANCES, json!({})),
            Stage::CandidatesFound => match snapshot.candidates.iter().find(|c| c.available) {
                Some(unit) => tool_call(BOOK_AMBULANCE, json!({ "ambulance_id": unit.id })),
                None => json!({
                    "action": "final_answer",
                    "text": "No ambulance is available near you right now. Please call your local emergency number."
                }),
            },
            Stage::Booked => json!({
                "action": "final_answer",
                "text": "Your ambulance is booked and on its way."
            }),
            Stage::Failed => json!({
                "action": "final_answer",
                "text": "I could not complete the booking. Please call your local emergency number."
            }),
        }
    }
}

fn tool_call(tool: &str, args: serde_json::Value) -> serde_json::Value {
    json!({ "action": "tool_call", "tool": tool, "args": args })
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let snapshot = messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::System)
            .find_map(|m| m.content.strip_prefix(SNAPSHOT_PREFIX))
            .and_then(|raw| serde_json::from_str::<SessionSnapshot>(raw.trim()).ok());

        let decision = match snapshot {
            Some(s) => Self::decide(&s),
            None => json!({
                "action": "clarify",
                "question": "Where are you, and what is the emergency?"
            }),
        };
        Ok(decision.to_string())
    }
}

/// 回放预设输出；用尽后若设置了 repeat 则一直返回该输出，否则返回 Api 错误
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    repeat: Option<String>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(outputs.into_iter().map(|s| Ok(s.into())).collect()),
            repeat: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 始终返回同一输出
    pub fn repeating(output: impl Into<String>) -> Self {
        Self {
            repeat: Some(output.into()),
            ..Self::default()
        }
    }

    /// 脚本用尽后重复 output
    pub fn then_repeat(mut self, output: impl Into<String>) -> Self {
        self.repeat = Some(output.into());
        self
    }

    /// 在队尾追加一次传输失败
    pub fn push_error(self, err: LlmError) -> Self {
        if let Ok(mut q) = self.script.lock() {
            q.push_back(Err(err));
        }
        self
    }

    /// 已被调用的次数
    pub fn calls(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// 每次调用收到的完整消息列表
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
        let next = self.script.lock().ok().and_then(|mut q| q.pop_front());
        match (next, &self.repeat) {
            (Some(out), _) => out,
            (None, Some(out)) => Ok(out.clone()),
            (None, None) => Err(LlmError::Api("script exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replays_in_order_then_repeats() {
        let llm = ScriptedLlmClient::new(["a", "b"]).then_repeat("z");
        let msgs = [Message::user("hi")];
        assert_eq!(llm.complete(&msgs).await.unwrap(), "a");
        assert_eq!(llm.complete(&msgs).await.unwrap(), "b");
        assert_eq!(llm.complete(&msgs).await.unwrap(), "z");
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_scripted_errors_when_exhausted() {
        let llm = ScriptedLlmClient::new(Vec::<String>::new()).push_error(LlmError::Timeout);
        assert_eq!(llm.complete(&[]).await, Err(LlmError::Timeout));
        assert!(llm.complete(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_without_snapshot_asks_for_details() {
        let out = MockLlmClient.complete(&[Message::user("help")]).await.unwrap();
        assert!(out.contains("clarify"));
    }
}
