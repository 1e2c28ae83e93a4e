//! 工具注册表
//!
//! 所有工具实现 Tool trait（spec / execute），由 ToolRegistry 按名注册与解析；
//! ToolSpec 声明输入字段与类型、幂等类别与超时，参数校验在规划器边界与派发前各做一次。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::{Coordinates, DispatchError};
use crate::session::SessionId;
use crate::tools::ToolFailure;

/// 幂等类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyClass {
    /// 可原样重试（定位、候选查找）
    Idempotent,
    /// 不可逆副作用，没有新的幂等键不得重试（预约）
    EffectOnce,
}

/// 字段类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Number,
    Integer,
    String,
    Boolean,
}

impl FieldKind {
    fn json_type(self) -> &'static str {
        match self {
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::String => "string",
            FieldKind::Boolean => "boolean",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::String => value.as_str().is_some_and(|s| !s.trim().is_empty()),
            FieldKind::Boolean => value.is_boolean(),
        }
    }
}

/// 字段由谁提供：规划器给出，或由引擎从会话状态注入（规划器给出的同名值会被覆盖）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldSource {
    Planner,
    Engine,
}

#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub source: FieldSource,
    pub description: &'static str,
}

impl FieldSpec {
    pub fn planner(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            source: FieldSource::Planner,
            description,
        }
    }

    pub fn engine(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            source: FieldSource::Engine,
            description,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// 工具声明
#[derive(Clone, Debug)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub fields: Vec<FieldSpec>,
    pub idempotency: IdempotencyClass,
    pub timeout: Duration,
}

impl ToolSpec {
    /// 校验规划器给出的参数：规划器字段必须齐全且类型正确，未知字段拒绝，引擎字段允许出现但不校验
    pub fn validate_planner_args(&self, args: &Value) -> Result<(), DispatchError> {
        let empty = Map::new();
        let obj = match args {
            Value::Null => &empty,
            Value::Object(map) => map,
            other => {
                return Err(self.schema_error(format!("arguments must be an object, got {other}")))
            }
        };
        for key in obj.keys() {
            if !self.fields.iter().any(|f| f.name == key.as_str()) {
                return Err(self.schema_error(format!("unknown field '{key}'")));
            }
        }
        self.check_fields(obj, |f| f.source == FieldSource::Planner)
    }

    /// 派发前校验完整输入（规划器字段 + 引擎注入字段）
    pub fn validate_input(&self, input: &Value) -> Result<(), DispatchError> {
        let obj = input
            .as_object()
            .ok_or_else(|| self.schema_error("input must be an object".to_string()))?;
        self.check_fields(obj, |_| true)
    }

    fn check_fields(
        &self,
        obj: &Map<String, Value>,
        include: impl Fn(&FieldSpec) -> bool,
    ) -> Result<(), DispatchError> {
        for field in self.fields.iter().filter(|f| include(f)) {
            match obj.get(field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(self.schema_error(format!("missing field '{}'", field.name)));
                }
                Some(v) if !v.is_null() && !field.kind.matches(v) => {
                    return Err(self.schema_error(format!(
                        "field '{}' must be a non-empty {}",
                        field.name,
                        field.kind.json_type()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// 面向规划器的参数 JSON Schema（只含规划器字段）
    pub fn planner_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in self.fields.iter().filter(|f| f.source == FieldSource::Planner) {
            properties.insert(
                field.name.to_string(),
                json!({ "type": field.kind.json_type(), "description": field.description }),
            );
            if field.required {
                required.push(field.name);
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false
        })
    }

    fn schema_error(&self, detail: String) -> DispatchError {
        DispatchError::SchemaValidation {
            tool: self.name.clone(),
            detail,
        }
    }
}

/// 工具执行上下文：会话身份、设备上报位置与取消令牌
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub device_location: Option<Coordinates>,
    pub cancel: CancellationToken,
}

/// 工具 trait：声明 + 异步执行（输入输出均为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    async fn execute(&self, ctx: &ToolContext, input: Value) -> Result<Value, ToolFailure>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>；注册后只读，可跨会话共享
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.spec().name.clone();
        self.tools.insert(name, Arc::new(tool));
    }

    /// 按名解析，未注册返回 UnknownTool
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, DispatchError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))
    }

    pub fn spec(&self, name: &str) -> Result<ToolSpec, DispatchError> {
        self.resolve(name).map(|t| t.spec().clone())
    }

    /// 动态生成工具描述 JSON（名称、描述、规划器参数 schema），拼入 system prompt
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tools
            .values()
            .map(|tool| {
                let spec = tool.spec();
                json!({
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": spec.planner_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}
