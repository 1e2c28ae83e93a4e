//! 规划器适配层
//!
//! 把会话快照、纠正提示与最近对话拼成 LLM 上下文，调用 LLM 后在边界处完成校验：
//! 工具必须已注册、参数必须满足声明的 schema，否则返回 Clarify 兜底（携带拒绝原因）。
//! 适配层从不修改会话状态。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::core::DispatchError;
use crate::llm::{LlmClient, Message};
use crate::planner::parse::{decision_schema_json, parse_llm_output, RawDecision};
use crate::session::SessionSnapshot;
use crate::tools::ToolRegistry;

/// 快照系统消息前缀
pub const SNAPSHOT_PREFIX: &str = "SESSION_SNAPSHOT:";

/// 规划器输出无法使用时向用户提出的问题
pub const FALLBACK_QUESTION: &str =
    "Sorry, I didn't catch that. Can you tell me what is happening and where you are?";

/// 通过边界校验的工具调用
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCall {
    pub tool: String,
    /// 规划器参数（总是对象）
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerAction {
    ToolCall(ValidatedCall),
    FinalAnswer(String),
    /// rejection 为 Some 时表示这是校验失败后的兜底，而非规划器主动追问
    Clarify {
        question: String,
        rejection: Option<DispatchError>,
    },
}

impl PlannerAction {
    pub fn label(&self) -> &'static str {
        match self {
            PlannerAction::ToolCall(_) => "tool_call",
            PlannerAction::FinalAnswer(_) => "final_answer",
            PlannerAction::Clarify {
                rejection: Some(_), ..
            } => "rejected",
            PlannerAction::Clarify { .. } => "clarify",
        }
    }
}

pub struct PlannerAdapter {
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    system_prompt: String,
    timeout: Duration,
}

impl PlannerAdapter {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        let system_prompt = build_system_prompt(&registry);
        Self {
            llm,
            registry,
            system_prompt,
            timeout,
        }
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 请求下一步动作；只有 LLM 传输失败（超时 / API 错误）才返回 Err(PlannerUnavailable)
    pub async fn next_action(
        &self,
        snapshot: &SessionSnapshot,
        transcript: &[Message],
        hints: &[String],
    ) -> Result<PlannerAction, DispatchError> {
        let messages = self.build_messages(snapshot, transcript, hints);

        let raw = match tokio::time::timeout(self.timeout, self.llm.complete(&messages)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Err(DispatchError::PlannerUnavailable(e.to_string())),
            Err(_) => {
                return Err(DispatchError::PlannerUnavailable(format!(
                    "no response within {}s",
                    self.timeout.as_secs_f32()
                )))
            }
        };
        tracing::debug!(session = %snapshot.session_id, output = %raw, "planner output");

        Ok(match parse_llm_output(&raw) {
            Ok(decision) => self.validate(decision),
            Err(e) => fallback(e),
        })
    }

    fn validate(&self, decision: RawDecision) -> PlannerAction {
        match decision {
            RawDecision::FinalAnswer { text } => PlannerAction::FinalAnswer(text),
            RawDecision::Clarify { question } => PlannerAction::Clarify {
                question,
                rejection: None,
            },
            RawDecision::ToolCall { tool, args } => {
                let spec = match self.registry.spec(&tool) {
                    Ok(spec) => spec,
                    Err(e) => return fallback(e),
                };
                if let Err(e) = spec.validate_planner_args(&args) {
                    return fallback(e);
                }
                let args = match args {
                    Value::Null => Value::Object(Map::new()),
                    other => other,
                };
                PlannerAction::ToolCall(ValidatedCall { tool, args })
            }
        }
    }

    fn build_messages(
        &self,
        snapshot: &SessionSnapshot,
        transcript: &[Message],
        hints: &[String],
    ) -> Vec<Message> {
        let snapshot_json = serde_json::to_string_pretty(snapshot).unwrap_or_default();
        let mut messages = vec![
            Message::system(self.system_prompt.clone()),
            Message::system(format!("{SNAPSHOT_PREFIX}\n{snapshot_json}")),
        ];
        for hint in hints {
            messages.push(Message::system(format!("CORRECTION: {hint}")));
        }
        messages.extend(transcript.iter().cloned());
        messages
    }
}

fn fallback(rejection: DispatchError) -> PlannerAction {
    PlannerAction::Clarify {
        question: FALLBACK_QUESTION.to_string(),
        rejection: Some(rejection),
    }
}

/// 动态拼接 system prompt：角色说明、工具清单（含参数 schema）、决策格式 schema 与规则
pub fn build_system_prompt(registry: &ToolRegistry) -> String {
    format!(
        "You are an emergency ambulance dispatch agent. Your job is to get an ambulance \
to the caller as fast as possible: locate the caller, find nearby ambulances, then book one.\n\n\
## Tools\n{tools}\n\n\
## Decision format\nReply with exactly ONE JSON object matching this schema and nothing else:\n{schema}\n\n\
## Rules\n\
1. Follow the stage order: get_location, then find_ambulances, then book_ambulance. \
The allowed tools for the current stage are listed in the session snapshot.\n\
2. Only pass the arguments listed for a tool. Location, session and booking keys are filled in for you.\n\
3. Only book an ambulance that appears in the snapshot's candidate list and is available.\n\
4. Once the stage is booked or failed, reply with a final_answer.\n\
5. Use clarify only when you need information from the caller.\n\
6. Keep replies short. People in emergencies need action, not essays.",
        tools = registry.to_schema_json(),
        schema = decision_schema_json(),
    )
}
