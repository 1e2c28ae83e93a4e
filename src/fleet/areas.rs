//! 地名表：把用户说出的区域名解析为近似坐标
//!
//! 先精确匹配（忽略大小写与首尾空白），再做包含匹配（区域名包含表项或表项包含区域名），
//! 包含匹配取最长的表项，"hsr layout" 优先于 "hsr"。

use serde::{Deserialize, Serialize};

use crate::core::Coordinates;

/// 参与包含匹配的最短输入长度，过短的片段只做精确匹配
const MIN_PARTIAL_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaEntry {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

impl AreaEntry {
    pub fn new(name: &str, lat: f64, lon: f64) -> Self {
        Self {
            name: name.to_string(),
            lat,
            lon,
        }
    }
}

/// 内置班加罗尔区域表（与默认车队同一城市）
pub fn default_areas() -> Vec<AreaEntry> {
    vec![
        AreaEntry::new("koramangala", 12.9352, 77.6245),
        AreaEntry::new("indiranagar", 12.9784, 77.6408),
        AreaEntry::new("whitefield", 12.9698, 77.7500),
        AreaEntry::new("jayanagar", 12.9250, 77.5897),
        AreaEntry::new("electronic city", 12.8456, 77.6603),
        AreaEntry::new("hsr layout", 12.9116, 77.6389),
        AreaEntry::new("hsr", 12.9116, 77.6389),
        AreaEntry::new("marathahalli", 12.9591, 77.6971),
        AreaEntry::new("btm layout", 12.9166, 77.6101),
        AreaEntry::new("btm", 12.9166, 77.6101),
        AreaEntry::new("mg road", 12.9758, 77.6045),
        AreaEntry::new("brigade road", 12.9716, 77.6077),
        AreaEntry::new("ulsoor", 12.9830, 77.6200),
        AreaEntry::new("cubbon park", 12.9763, 77.5929),
        AreaEntry::new("majestic", 12.9767, 77.5713),
        AreaEntry::new("bangalore central", 12.9716, 77.5946),
        AreaEntry::new("bangalore", 12.9716, 77.5946),
        AreaEntry::new("bengaluru", 12.9716, 77.5946),
    ]
}

/// 只读地名表；表项名在构造时统一为小写
#[derive(Debug, Clone, Default)]
pub struct AreaTable {
    entries: Vec<AreaEntry>,
}

impl AreaTable {
    pub fn new(entries: Vec<AreaEntry>) -> Self {
        let entries = entries
            .into_iter()
            .filter(|e| Coordinates::new(e.lat, e.lon).is_valid() && !e.name.trim().is_empty())
            .map(|e| AreaEntry {
                name: e.name.trim().to_lowercase(),
                ..e
            })
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve(&self, area: &str) -> Option<Coordinates> {
        let wanted = area.trim().to_lowercase();
        if wanted.is_empty() {
            return None;
        }
        if let Some(hit) = self.entries.iter().find(|e| e.name == wanted) {
            return Some(Coordinates::new(hit.lat, hit.lon));
        }
        if wanted.len() < MIN_PARTIAL_LEN {
            return None;
        }
        self.entries
            .iter()
            .filter(|e| wanted.contains(e.name.as_str()) || e.name.contains(wanted.as_str()))
            .max_by_key(|e| e.name.len())
            .map(|e| Coordinates::new(e.lat, e.lon))
    }
}
