//! get_location：规划器给出可识别的区域名时按地名表解析；否则优先使用设备上报的位置，再询问定位后端

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::fleet::{AreaTable, LocationBackend};
use crate::tools::{
    FieldKind, FieldSpec, IdempotencyClass, Tool, ToolContext, ToolFailure, ToolSpec, GET_LOCATION,
};

pub struct GetLocationTool {
    spec: ToolSpec,
    backend: Arc<dyn LocationBackend>,
    areas: AreaTable,
}

impl GetLocationTool {
    pub fn new(backend: Arc<dyn LocationBackend>, areas: AreaTable, timeout: Duration) -> Self {
        let (description, fields) = if areas.is_empty() {
            ("Get the caller's current coordinates. Takes no arguments.", vec![])
        } else {
            (
                "Get the caller's current coordinates. Pass `area` only when the caller names \
                 the neighbourhood they are in.",
                vec![FieldSpec::planner(
                    "area",
                    FieldKind::String,
                    "Neighbourhood or landmark named by the caller, e.g. \"Koramangala\"",
                )
                .optional()],
            )
        };
        Self {
            spec: ToolSpec {
                name: GET_LOCATION.to_string(),
                description: description.to_string(),
                fields,
                idempotency: IdempotencyClass::Idempotent,
                timeout,
            },
            backend,
            areas,
        }
    }
}

#[async_trait]
impl Tool for GetLocationTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn execute(&self, ctx: &ToolContext, input: Value) -> Result<Value, ToolFailure> {
        let area = input.get("area").and_then(Value::as_str);
        if let Some(name) = area {
            if let Some(at) = self.areas.resolve(name) {
                tracing::debug!(session = %ctx.session_id, area = name, "location resolved from area name");
                return Ok(json!({ "lat": at.lat, "lon": at.lon }));
            }
            tracing::info!(session = %ctx.session_id, area = name, "unknown area, falling back");
        }
        let at = match ctx.device_location {
            Some(at) => at,
            None => self.backend.locate(&ctx.session_id).await?,
        };
        Ok(json!({ "lat": at.lat, "lon": at.lon }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    use crate::core::Coordinates;
    use crate::fleet::{default_areas, StaticLocation};

    fn tool() -> GetLocationTool {
        GetLocationTool::new(
            Arc::new(StaticLocation::new(Coordinates::new(12.9335, 77.6105))),
            AreaTable::new(default_areas()),
            Duration::from_secs(1),
        )
    }

    fn ctx(device: Option<Coordinates>) -> ToolContext {
        ToolContext {
            session_id: "s-1".to_string(),
            device_location: device,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_backend() {
        let out = tool().execute(&ctx(None), json!({})).await.unwrap();
        assert_eq!(out, json!({"lat": 12.9335, "lon": 77.6105}));
    }

    #[tokio::test]
    async fn test_prefers_device_location() {
        let out = tool()
            .execute(&ctx(Some(Coordinates::new(48.85, 2.35))), json!({}))
            .await
            .unwrap();
        assert_eq!(out, json!({"lat": 48.85, "lon": 2.35}));
    }

    #[tokio::test]
    async fn test_named_area_wins() {
        let out = tool()
            .execute(
                &ctx(Some(Coordinates::new(48.85, 2.35))),
                json!({"area": "near Jayanagar 4th block"}),
            )
            .await
            .unwrap();
        assert_eq!(out, json!({"lat": 12.925, "lon": 77.5897}));
    }

    #[tokio::test]
    async fn test_unknown_area_falls_back() {
        let out = tool()
            .execute(&ctx(None), json!({"area": "Atlantis"}))
            .await
            .unwrap();
        assert_eq!(out, json!({"lat": 12.9335, "lon": 77.6105}));
    }

    #[test]
    fn test_area_field_only_with_table() {
        assert_eq!(tool().spec().fields.len(), 1);
        assert!(!tool().spec().fields[0].required);
        let bare = GetLocationTool::new(
            Arc::new(StaticLocation::new(Coordinates::new(0.0, 0.0))),
            AreaTable::default(),
            Duration::from_secs(1),
        );
        assert!(bare.spec().fields.is_empty());
    }
}
