//! Binlog 위치 영속화
//!
//! Canal은 이벤트를 처리할 때마다 현재 위치를 저장합니다. 저장 실패는 로그만 남기고
//! 루프를 계속하므로, 크래시 직후 재시작하면 일부 이벤트가 다시 전달될 수 있습니다
//! (at-least-once).

use crate::error::{CdcError, Result};
use crate::offset::Position;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// 위치 저장소 인터페이스
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// 현재 위치 저장 (덮어쓰기)
    async fn save(&self, position: &Position) -> Result<()>;

    /// 저장된 위치 로드. 한 번도 저장된 적 없으면 `None`
    async fn load(&self) -> Result<Option<Position>>;
}

/// 디스크에 기록되는 위치 레코드
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedPosition {
    file: String,
    offset: u64,
    saved_at: DateTime<Utc>,
}

/// JSON 파일 기반 위치 저장소
///
/// 임시 파일에 쓰고 fsync 후 rename 하므로 중간에 죽어도 파일이 깨지지 않습니다.
pub struct FilePositionStore {
    file_path: PathBuf,
}

impl FilePositionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FilePositionStore {
            file_path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

#[async_trait]
impl PositionStore for FilePositionStore {
    async fn save(&self, position: &Position) -> Result<()> {
        let record = SavedPosition {
            file: position.file.clone(),
            offset: position.offset,
            saved_at: Utc::now(),
        };

        let temp_path = self.file_path.with_extension("tmp");
        let json = serde_json::to_string_pretty(&record)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.file_path).await?;

        debug!("Saved position {} to {:?}", position, self.file_path);
        Ok(())
    }

    async fn load(&self) -> Result<Option<Position>> {
        let content = match fs::read_to_string(&self.file_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No position file found at {:?}", self.file_path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let record: SavedPosition = serde_json::from_str(&content).map_err(|e| {
            CdcError::Other(format!(
                "Invalid position file {:?}: {}",
                self.file_path, e
            ))
        })?;

        info!(
            "Loaded position {}:{} (saved at {})",
            record.file, record.offset, record.saved_at
        );
        Ok(Some(Position::new(record.file, record.offset)))
    }
}

/// 메모리 위치 저장소 (임베딩, 테스트용)
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    saved: Mutex<Option<Position>>,
    history: Mutex<Vec<Position>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(position: Position) -> Self {
        MemoryPositionStore {
            saved: Mutex::new(Some(position)),
            history: Mutex::new(Vec::new()),
        }
    }

    /// 지금까지 저장된 위치들 (순서대로)
    pub fn history(&self) -> Vec<Position> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn save(&self, position: &Position) -> Result<()> {
        *self.saved.lock() = Some(position.clone());
        self.history.lock().push(position.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Position>> {
        Ok(self.saved.lock().clone())
    }
}
