//! find_ambulances / book_ambulance
//!
//! 坐标、会话 ID 与幂等键均由引擎注入；规划器只选择 ambulance_id。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::Coordinates;
use crate::fleet::{AmbulanceBackend, BookingRequest};
use crate::tools::{
    FieldKind, FieldSpec, IdempotencyClass, Tool, ToolContext, ToolFailure, ToolSpec,
    BOOK_AMBULANCE, FIND_AMBULANCES,
};

fn str_field<'a>(input: &'a Value, name: &str) -> Result<&'a str, ToolFailure> {
    input
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolFailure::Rejected(format!("missing '{name}'")))
}

fn num_field(input: &Value, name: &str) -> Result<f64, ToolFailure> {
    input
        .get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| ToolFailure::Rejected(format!("missing '{name}'")))
}

pub struct FindAmbulancesTool {
    spec: ToolSpec,
    backend: Arc<dyn AmbulanceBackend>,
}

impl FindAmbulancesTool {
    pub fn new(backend: Arc<dyn AmbulanceBackend>, timeout: Duration) -> Self {
        Self {
            spec: ToolSpec {
                name: FIND_AMBULANCES.to_string(),
                description: "List available ambulances near the caller's known location, \
                              nearest first. Takes no arguments; the location is filled in \
                              automatically."
                    .to_string(),
                fields: vec![
                    FieldSpec::engine("lat", FieldKind::Number, "latitude"),
                    FieldSpec::engine("lon", FieldKind::Number, "longitude"),
                ],
                idempotency: IdempotencyClass::Idempotent,
                timeout,
            },
            backend,
        }
    }
}

#[async_trait]
impl Tool for FindAmbulancesTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, _ctx: &ToolContext, input: Value) -> Result<Value, ToolFailure> {
        let at = Coordinates::new(num_field(&input, "lat")?, num_field(&input, "lon")?);
        if !at.is_valid() {
            return Err(ToolFailure::Rejected("invalid coordinates".to_string()));
        }
        let units = self.backend.find_nearby(at).await?;
        serde_json::to_value(units).map_err(|e| ToolFailure::Rejected(e.to_string()))
    }
}

pub struct BookAmbulanceTool {
    spec: ToolSpec,
    backend: Arc<dyn AmbulanceBackend>,
}

impl BookAmbulanceTool {
    pub fn new(backend: Arc<dyn AmbulanceBackend>, timeout: Duration) -> Self {
        Self {
            spec: ToolSpec {
                name: BOOK_AMBULANCE.to_string(),
                description: "Book one ambulance from the current candidate list. Irreversible."
                    .to_string(),
                fields: vec![
                    FieldSpec::engine("session_id", FieldKind::String, "session identifier"),
                    FieldSpec::planner(
                        "ambulance_id",
                        FieldKind::String,
                        "id of an available candidate ambulance",
                    ),
                    FieldSpec::engine("idempotency_key", FieldKind::String, "booking key"),
                ],
                idempotency: IdempotencyClass::EffectOnce,
                timeout,
            },
            backend,
        }
    }
}

#[async_trait]
impl Tool for BookAmbulanceTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, _ctx: &ToolContext, input: Value) -> Result<Value, ToolFailure> {
        let request = BookingRequest {
            session_id: str_field(&input, "session_id")?.to_string(),
            ambulance_id: str_field(&input, "ambulance_id")?.to_string(),
            idempotency_key: str_field(&input, "idempotency_key")?.to_string(),
        };
        let confirmation = self.backend.book(&request).await?;
        Ok(json!({
            "booking_id": confirmation.booking_id,
            "confirmed": confirmation.confirmed,
        }))
    }
}

/// 预约幂等键：由 (session, ambulance) 推导，网络重试不会产生第二次预约
pub fn booking_key(session_id: &str, ambulance_id: &str) -> String {
    format!("book:{session_id}:{ambulance_id}")
}
