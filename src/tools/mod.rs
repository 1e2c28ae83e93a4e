//! 工具箱：注册表、执行器与三个急救工具（定位 / 查找救护车 / 预约）

pub mod ambulance;
pub mod executor;
pub mod location;
pub mod registry;

pub use ambulance::{booking_key, BookAmbulanceTool, FindAmbulancesTool};
pub use executor::{ToolExecutor, ToolFailure, ToolOutcome};
pub use location::GetLocationTool;
pub use registry::{
    FieldKind, FieldSource, FieldSpec, IdempotencyClass, Tool, ToolContext, ToolRegistry, ToolSpec,
};

use std::sync::Arc;

use crate::config::ToolsSection;
use crate::fleet::{AmbulanceBackend, AreaTable, LocationBackend};

pub const GET_LOCATION: &str = "get_location";
pub const FIND_AMBULANCES: &str = "find_ambulances";
pub const BOOK_AMBULANCE: &str = "book_ambulance";

/// 注册全部急救工具
pub fn build_registry(
    cfg: &ToolsSection,
    areas: AreaTable,
    location: Arc<dyn LocationBackend>,
    ambulances: Arc<dyn AmbulanceBackend>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(GetLocationTool::new(location, areas, cfg.location_timeout()));
    registry.register(FindAmbulancesTool::new(
        Arc::clone(&ambulances),
        cfg.lookup_timeout(),
    ));
    registry.register(BookAmbulanceTool::new(ambulances, cfg.booking_timeout()));
    registry
}
