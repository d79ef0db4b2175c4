//! 产物写入服务 - 业务能力层
//!
//! 只负责"把每一轮的 XML / JSON 写进产物目录"能力，不关心流程

use crate::error::{AppError, AppResult, ArtifactError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// 最终状态文件名
pub const FINAL_STATE_FILE: &str = "final_state.json";

/// 单轮产物类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// 发送的 lote.xml
    Sent,
    /// 提交响应
    SendResponse,
    /// 批次查询响应
    LotResponse,
    /// 补丁后的 XML
    Patched,
}

impl ArtifactKind {
    /// 带轮次序号的文件名，例如 `iter_003_sent.xml`
    pub fn file_name(self, iteration: u32) -> String {
        let suffix = match self {
            ArtifactKind::Sent => "sent.xml",
            ArtifactKind::SendResponse => "send_response.json",
            ArtifactKind::LotResponse => "lot_response.json",
            ArtifactKind::Patched => "patched.xml",
        };
        format!("iter_{:03}_{}", iteration, suffix)
    }
}

/// 产物目录
///
/// 职责：
/// - 写入每一轮的产物与最终状态
/// - 只保留最近 `keep_last` 轮（0 表示全部保留）
/// - 不关心产物之间的先后关系
pub struct ArtifactStore {
    dir: PathBuf,
    keep_last: usize,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, keep_last: usize) -> Self {
        Self {
            dir: dir.into(),
            keep_last,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 产物目录下的文件路径
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// 创建产物目录
    pub async fn ensure_dir(&self) -> AppResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AppError::artifact_write_failed(self.dir.display().to_string(), e))
    }

    /// 写入文本文件
    pub async fn write_text(&self, name: &str, content: &str) -> AppResult<PathBuf> {
        self.ensure_dir().await?;
        let path = self.path(name);
        fs::write(&path, content)
            .await
            .map_err(|e| AppError::artifact_write_failed(path.display().to_string(), e))?;
        debug!("写入产物: {}", path.display());
        Ok(path)
    }

    /// 写入格式化 JSON
    pub async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> AppResult<PathBuf> {
        let content = serde_json::to_string_pretty(value).map_err(|source| {
            ArtifactError::JsonParseFailed {
                path: self.path(name).display().to_string(),
                source,
            }
        })?;
        self.write_text(name, &content).await
    }

    /// 写入某一轮的产物
    pub async fn write_iteration(
        &self,
        iteration: u32,
        kind: ArtifactKind,
        content: &str,
    ) -> AppResult<PathBuf> {
        self.write_text(&kind.file_name(iteration), content).await
    }

    /// 写入某一轮的 JSON 产物
    pub async fn write_iteration_json<T: Serialize>(
        &self,
        iteration: u32,
        kind: ArtifactKind,
        value: &T,
    ) -> AppResult<PathBuf> {
        self.write_json(&kind.file_name(iteration), value).await
    }

    /// 写入 `final_state.json`
    pub async fn write_final_state<T: Serialize>(&self, state: &T) -> AppResult<PathBuf> {
        let path = self.write_json(FINAL_STATE_FILE, state).await?;
        info!("💾 最终状态已保存: {}", path.display());
        Ok(path)
    }

    /// 删除早于最近 `keep_last` 轮的产物，返回删除的文件数
    pub async fn prune(&self, current_iteration: u32) -> AppResult<usize> {
        if self.keep_last == 0 {
            return Ok(0);
        }
        let oldest_kept = current_iteration.saturating_sub(self.keep_last as u32 - 1);

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(AppError::artifact_read_failed(self.dir.display().to_string(), e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::artifact_read_failed(self.dir.display().to_string(), e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(iteration) = iteration_of(&name) else {
                continue;
            };
            if iteration < oldest_kept {
                let path = entry.path();
                fs::remove_file(&path)
                    .await
                    .map_err(|e| AppError::artifact_write_failed(path.display().to_string(), e))?;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("清理 {} 个旧产物（保留第 {} 轮及之后）", removed, oldest_kept);
        }
        Ok(removed)
    }
}

/// 读取 JSON 产物
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> AppResult<T> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| AppError::artifact_read_failed(path.display().to_string(), e))?;
    serde_json::from_str(&content).map_err(|source| {
        ArtifactError::JsonParseFailed {
            path: path.display().to_string(),
            source,
        }
        .into()
    })
}

/// 从 `iter_NNN_xxx` 文件名解析轮次
fn iteration_of(file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix("iter_")?;
    let (number, _) = rest.split_once('_')?;
    number.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::response::SendResponse;

    #[test]
    fn test_file_names() {
        assert_eq!(ArtifactKind::Sent.file_name(1), "iter_001_sent.xml");
        assert_eq!(
            ArtifactKind::LotResponse.file_name(12),
            "iter_012_lot_response.json"
        );
        assert_eq!(iteration_of("iter_012_lot_response.json"), Some(12));
        assert_eq!(iteration_of("final_state.json"), None);
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), 2);
        for i in 1..=4 {
            store
                .write_iteration(i, ArtifactKind::Sent, "<rLoteDE/>")
                .await
                .unwrap();
        }
        store.write_final_state(&"done").await.unwrap();

        let removed = store.prune(4).await.unwrap();
        assert_eq!(removed, 2);
        assert!(!store.path("iter_002_sent.xml").exists());
        assert!(store.path("iter_003_sent.xml").exists());
        assert!(store.path("iter_004_sent.xml").exists());
        assert!(store.path(FINAL_STATE_FILE).exists());
    }

    #[tokio::test]
    async fn test_json_round_trip_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("nested"), 3);
        let resp = SendResponse {
            code: "0300".to_string(),
            message: "Lote recibido con éxito".to_string(),
            protocol: Some("123".to_string()),
            processing_time: None,
            processed_at: None,
        };
        let path = store.write_json("send_response.json", &resp).await.unwrap();
        let back: SendResponse = read_json(&path).await.unwrap();
        assert_eq!(back, resp);

        let missing = read_json::<SendResponse>(&store.path("nope.json")).await;
        assert!(matches!(
            missing,
            Err(AppError::Artifact(ArtifactError::NotFound { .. }))
        ));

        store.write_text("bad.json", "{").await.unwrap();
        let bad = read_json::<SendResponse>(&store.path("bad.json")).await;
        assert!(matches!(
            bad,
            Err(AppError::Artifact(ArtifactError::JsonParseFailed { .. }))
        ));
    }
}
