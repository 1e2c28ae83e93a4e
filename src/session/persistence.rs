//! 会话快照持久化
//!
//! 将全部会话（完整业务状态 + 执行日志 + 对话）写入 / 从 JSON 文件加载，用于进程重启恢复。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::Session;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDoc {
    version: u32,
    saved_at: DateTime<Utc>,
    sessions: Vec<Session>,
}

/// 单文件 JSON 快照
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载快照；文件不存在时返回空 Vec
    pub fn load(&self) -> anyhow::Result<Vec<Session>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        let doc: SnapshotDoc = serde_json::from_str(&data)?;
        if doc.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "unsupported snapshot version {} in {}",
                doc.version,
                self.path.display()
            );
        }
        Ok(doc.sessions)
    }

    /// 写入快照（先写临时文件再重命名）；父目录不存在时自动创建
    pub fn save(&self, sessions: &[Session]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let doc = SnapshotDoc {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            sessions: sessions.to_vec(),
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
