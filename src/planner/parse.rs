//! 规划器输出解析
//!
//! LLM 输出视为不可信输入：从文本中提取 JSON，解析为带标签的 RawDecision；
//! 不含 JSON 的纯文本一律视为格式错误，不会直接转给用户。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::DispatchError;

/// 规划器决策格式：`{"action": "tool_call" | "final_answer" | "clarify", ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RawDecision {
    /// 调用一个工具
    ToolCall {
        /// 工具名，必须是已注册工具之一
        tool: String,
        /// 工具参数对象
        #[serde(default)]
        args: Value,
    },
    /// 直接回复用户
    FinalAnswer { text: String },
    /// 向用户追问
    Clarify { question: String },
}

impl RawDecision {
    pub fn label(&self) -> &'static str {
        match self {
            RawDecision::ToolCall { .. } => "tool_call",
            RawDecision::FinalAnswer { .. } => "final_answer",
            RawDecision::Clarify { .. } => "clarify",
        }
    }
}

/// 省略 action 的简写：`{"tool": "...", "args": {...}}`
#[derive(Deserialize)]
struct BareToolCall {
    tool: String,
    #[serde(default)]
    args: Value,
}

/// 决策格式的 JSON Schema，拼入 system prompt
pub fn decision_schema_json() -> String {
    let schema = schema_for!(RawDecision);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

fn malformed(detail: String) -> DispatchError {
    DispatchError::SchemaValidation {
        tool: "planner_output".to_string(),
        detail,
    }
}

/// 解析 LLM 输出
pub fn parse_llm_output(output: &str) -> Result<RawDecision, DispatchError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(malformed("empty planner output".to_string()));
    }

    // 提取 JSON 块（```json ... ``` 或纯 JSON）
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            return Err(malformed(format!("unbalanced JSON: {trimmed}")));
        }
    } else {
        return Err(malformed(
            "planner output is not a decision object".to_string(),
        ));
    };

    let decision = match serde_json::from_str::<RawDecision>(json_str) {
        Ok(d) => d,
        Err(e) => match serde_json::from_str::<BareToolCall>(json_str) {
            Ok(bare) => RawDecision::ToolCall {
                tool: bare.tool,
                args: bare.args,
            },
            Err(_) => return Err(malformed(format!("{e}: {json_str}"))),
        },
    };

    match &decision {
        RawDecision::ToolCall { tool, .. } if tool.trim().is_empty() => {
            Err(malformed("tool name is empty".to_string()))
        }
        RawDecision::FinalAnswer { text } if text.trim().is_empty() => {
            Err(malformed("final answer is empty".to_string()))
        }
        RawDecision::Clarify { question } if question.trim().is_empty() => {
            Err(malformed("clarifying question is empty".to_string()))
        }
        _ => Ok(decision),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tagged_tool_call() {
        let d = parse_llm_output(
            r#"{"action": "tool_call", "tool": "book_ambulance", "args": {"ambulance_id": "amb-1"}}"#,
        )
        .unwrap();
        assert_eq!(
            d,
            RawDecision::ToolCall {
                tool: "book_ambulance".to_string(),
                args: json!({"ambulance_id": "amb-1"}),
            }
        );
    }

    #[test]
    fn test_fenced_block_and_bare_call() {
        let out = "Sure.\n```json\n{\"tool\": \"get_location\"}\n```";
        let d = parse_llm_output(out).unwrap();
        assert_eq!(
            d,
            RawDecision::ToolCall {
                tool: "get_location".to_string(),
                args: Value::Null,
            }
        );
    }

    #[test]
    fn test_plain_text_is_rejected() {
        let err = parse_llm_output("Help is on the way.").unwrap_err();
        assert!(err.to_string().contains("not a decision object"));
        let ok = parse_llm_output(r#"{"action": "final_answer", "text": "Help is on the way."}"#)
            .unwrap();
        assert_eq!(ok.label(), "final_answer");
    }

    #[test]
    fn test_garbage_json_is_rejected() {
        assert!(parse_llm_output(r#"{"action": "launch_rocket"}"#).is_err());
        assert!(parse_llm_output(r#"{"action": "clarify", "question": ""}"#).is_err());
        assert!(parse_llm_output("   ").is_err());
    }

    #[test]
    fn test_schema_mentions_actions() {
        let schema = decision_schema_json();
        assert!(schema.contains("tool_call"));
        assert!(schema.contains("clarify"));
    }
}
