//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SIREN__*` 覆盖（双下划线表示嵌套，如 `SIREN__ENGINE__TURN_BUDGET=12`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{Coordinates, RetryPolicy};
use crate::fleet::areas::{default_areas, AreaEntry, AreaTable};
use crate::fleet::memory::{default_units, FleetUnit};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineSection,
    pub tools: ToolsSection,
    pub session: SessionSection,
    pub fleet: FleetSection,
    pub location: LocationSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// siren-web 监听地址
    pub bind: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "siren".to_string(),
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    OpenAi,
    Mock,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（任意 OpenAI 兼容端点）/ mock；openai 未配置 API Key 时退回 mock
    pub provider: LlmProvider,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY
    pub api_key: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAi,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
        }
    }
}

/// [engine] 段：回合预算、重试与退避、纠正次数、规划器超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 每个会话的回合预算
    pub turn_budget: u32,
    /// 单次幂等调用的最大尝试次数（含首次）；规划器传输失败同样适用
    pub max_tool_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// 每条用户消息内，规划器输出被拒绝后的最多纠正次数
    pub max_corrections: u32,
    pub planner_timeout_secs: u64,
    /// 规划器看到的最近对话条数（同时用于最近调用条数）
    pub history_window: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            turn_budget: 10,
            max_tool_attempts: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 4000,
            max_corrections: 2,
            planner_timeout_secs: 30,
            history_window: 12,
        }
    }
}

impl EngineSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_tool_attempts.max(1),
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
        }
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_secs(self.planner_timeout_secs.max(1))
    }
}

/// [tools] 段：各工具超时（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub location_timeout_secs: u64,
    pub lookup_timeout_secs: u64,
    pub booking_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            location_timeout_secs: 5,
            lookup_timeout_secs: 10,
            booking_timeout_secs: 15,
        }
    }
}

impl ToolsSection {
    pub fn location_timeout(&self) -> Duration {
        Duration::from_secs(self.location_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    pub fn booking_timeout(&self) -> Duration {
        Duration::from_secs(self.booking_timeout_secs)
    }
}

/// 消息指向未知或已过期的会话时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnknownSessionPolicy {
    /// 返回 SessionNotFound
    #[default]
    Reject,
    /// 新建会话（新 ID）
    Create,
}

/// [session] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 空闲超过该时长的会话被回收
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub unknown_session: UnknownSessionPolicy,
    /// 设置后 siren-web 启动时加载、退出时保存全部会话
    pub snapshot_path: Option<PathBuf>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_secs: 1800,
            sweep_interval_secs: 60,
            unknown_session: UnknownSessionPolicy::Reject,
            snapshot_path: None,
        }
    }
}

/// [fleet] 段：内存车队
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FleetSection {
    pub speed_kmph: f64,
    pub max_distance_km: f64,
    pub units: Vec<FleetUnit>,
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            speed_kmph: 40.0,
            max_distance_km: 50.0,
            units: default_units(),
        }
    }
}

/// [location] 段：没有设备位置时使用的兜底坐标，以及 get_location 按地名解析用的区域表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocationSection {
    pub fallback_lat: f64,
    pub fallback_lon: f64,
    pub areas: Vec<AreaEntry>,
}

impl Default for LocationSection {
    fn default() -> Self {
        Self {
            fallback_lat: 12.9335,
            fallback_lon: 77.6105,
            areas: default_areas(),
        }
    }
}

impl LocationSection {
    pub fn fallback(&self) -> Coordinates {
        Coordinates::new(self.fallback_lat, self.fallback_lon)
    }

    pub fn area_table(&self) -> AreaTable {
        AreaTable::new(self.areas.clone())
    }
}

/// 从 config 目录加载配置，环境变量 SIREN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SIREN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SIREN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 加载配置；失败时记录警告并使用默认值
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "config load failed, using defaults");
            AppConfig::default()
        }
    }
}
