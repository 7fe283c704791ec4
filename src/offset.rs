//! Binlog 처리 위치 추적 (Position 및 커서)
//!
//! Binlog 파일명 + 위치로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use crate::error::{CdcError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// MySQL binlog 파일은 4 바이트 매직 넘버 다음부터 이벤트가 시작됨
pub const BINLOG_START_OFFSET: u64 = 4;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Position {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub file: String,
    /// 바이트 위치
    pub offset: u64,
}

impl Position {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Position {
            file: file.into(),
            offset,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.file
            .rsplit_once('.')
            .and_then(|(_, seq)| seq.parse().ok())
    }

    fn file_base(&self) -> &str {
        self.file
            .rsplit_once('.')
            .map(|(base, _)| base)
            .unwrap_or(&self.file)
    }

    fn cmp_file(&self, other: &Self) -> Ordering {
        // 같은 basename이면 세대 번호로 비교 (mysql-bin.999999 < mysql-bin.1000000)
        match (self.file_sequence(), other.file_sequence()) {
            (Some(a), Some(b)) if self.file_base() == other.file_base() => {
                a.cmp(&b).then_with(|| self.file.cmp(&other.file))
            }
            _ => self.file.cmp(&other.file),
        }
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_file(other)
            .then_with(|| self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

/// 현재 위치 커서
///
/// Canal 실행 컨텍스트만 `advance`를 호출하고, 외부 관찰자(상태 조회, 메트릭)는
/// 복제본을 통해 `snapshot`만 읽습니다.
#[derive(Debug, Clone)]
pub struct PositionCursor {
    current: Arc<RwLock<Position>>,
}

impl PositionCursor {
    pub fn new(position: Position) -> Self {
        PositionCursor {
            current: Arc::new(RwLock::new(position)),
        }
    }

    /// 새 위치로 전진. 현재보다 작은 위치는 `OutOfOrder`로 거부
    pub fn advance(&self, file: impl Into<String>, offset: u64) -> Result<Position> {
        let requested = Position::new(file, offset);
        let mut current = self.current.write();
        if requested < *current {
            return Err(CdcError::OutOfOrder {
                current: current.clone(),
                requested,
            });
        }
        *current = requested.clone();
        Ok(requested)
    }

    /// 읽기 전용 복사본
    pub fn snapshot(&self) -> Position {
        self.current.read().clone()
    }

    /// 명시적인 외부 재탐색 (시작 시 저장된 위치로 시드)
    pub(crate) fn seek(&self, position: Position) {
        *self.current.write() = position;
    }
}

/// Canal 처리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanalState {
    /// 생성 직후
    Idle,
    /// 스트리밍 처리 중
    Syncing,
    /// 중단됨 (종료 상태, 재시작하려면 새 Canal 필요)
    Stopped,
}

impl fmt::Display for CanalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CanalState::Idle => "idle",
            CanalState::Syncing => "syncing",
            CanalState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_file_sequence() {
        let pos = Position::new("mysql-bin.000123", 4096);
        assert_eq!(pos.file_sequence(), Some(123));
        assert_eq!(Position::new("relay", 4).file_sequence(), None);
    }

    #[test]
    fn test_position_ordering() {
        let a = Position::new("mysql-bin.000001", 900);
        let b = Position::new("mysql-bin.000002", 4);
        let c = Position::new("mysql-bin.000002", 120);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(b.cmp(&b.clone()), Ordering::Equal);

        // 자릿수가 늘어나도 세대 순서 유지
        let wide = Position::new("mysql-bin.1000000", 4);
        let narrow = Position::new("mysql-bin.999999", 4);
        assert!(narrow < wide);
    }

    #[test]
    fn test_cursor_rejects_regression() {
        let cursor = PositionCursor::new(Position::new("mysql-bin.000002", 500));

        let err = cursor.advance("mysql-bin.000002", 100).unwrap_err();
        assert!(matches!(err, CdcError::OutOfOrder { .. }));
        assert_eq!(cursor.snapshot(), Position::new("mysql-bin.000002", 500));

        let err = cursor.advance("mysql-bin.000001", 9000).unwrap_err();
        assert!(matches!(err, CdcError::OutOfOrder { .. }));
    }

    #[test]
    fn test_cursor_accepts_equal_and_forward() {
        let cursor = PositionCursor::new(Position::new("mysql-bin.000002", 500));
        cursor.advance("mysql-bin.000002", 500).unwrap();
        cursor.advance("mysql-bin.000003", 4).unwrap();

        // 관찰자용 복제본은 같은 상태를 본다
        let observer = cursor.clone();
        assert_eq!(observer.snapshot(), Position::new("mysql-bin.000003", 4));
    }
}
