//! 车队后端：定位与救护车查找 / 预约的外部服务接口
//!
//! 工具只依赖 LocationBackend / AmbulanceBackend 两个 trait；InMemoryFleet 为内置参考实现（演示与测试）。

pub mod areas;
pub mod geo;
pub mod memory;

pub use areas::{default_areas, AreaEntry, AreaTable};
pub use geo::{eta_minutes, haversine_km};
pub use memory::{FleetUnit, InMemoryFleet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Ambulance, Coordinates};
use crate::tools::ToolFailure;

/// 后端错误：超时与不可用可重试，Rejected 为业务拒绝
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("backend timed out")]
    Timeout,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Rejected(String),
}

impl From<BackendError> for ToolFailure {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Timeout => ToolFailure::Timeout,
            BackendError::Unavailable(d) => ToolFailure::Unavailable(d),
            BackendError::Rejected(d) => ToolFailure::Rejected(d),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub session_id: String,
    pub ambulance_id: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingConfirmation {
    pub booking_id: String,
    pub confirmed: bool,
}

#[async_trait]
pub trait LocationBackend: Send + Sync {
    async fn locate(&self, session_id: &str) -> Result<Coordinates, BackendError>;
}

#[async_trait]
pub trait AmbulanceBackend: Send + Sync {
    /// 附近可用车辆，按距离升序
    async fn find_nearby(&self, at: Coordinates) -> Result<Vec<Ambulance>, BackendError>;

    /// 预约；同一 idempotency_key 重放返回首次确认，不会产生第二次预约
    async fn book(&self, request: &BookingRequest) -> Result<BookingConfirmation, BackendError>;
}

/// 固定坐标定位（无设备位置时的兜底）
#[derive(Debug, Clone)]
pub struct StaticLocation {
    at: Coordinates,
}

impl StaticLocation {
    pub fn new(at: Coordinates) -> Self {
        Self { at }
    }
}

#[async_trait]
impl LocationBackend for StaticLocation {
    async fn locate(&self, _session_id: &str) -> Result<Coordinates, BackendError> {
        Ok(self.at)
    }
}
