//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의

use crate::schema::Table;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// 쿼리 이벤트 (DDL, BEGIN)
    QueryEvent,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent,
    FormatDescriptionEvent,
    /// 트랜잭션 커밋
    XidEvent,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent,
    WriteRowsEventV1,
    UpdateRowsEventV1,
    DeleteRowsEventV1,
    HeartbeatEvent,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEvent,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEvent,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEvent,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent,
    PreviousGtidsEvent,
    /// 이 크레이트가 이름 붙이지 않은 이벤트 (원시 타입 코드)
    Other(u8),
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatEvent,
            29 => EventType::RowsQueryEvent,
            30 => EventType::WriteRowsEvent,
            31 => EventType::UpdateRowsEvent,
            32 => EventType::DeleteRowsEvent,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            35 => EventType::PreviousGtidsEvent,
            other => EventType::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            EventType::QueryEvent => 2,
            EventType::RotateEvent => 4,
            EventType::FormatDescriptionEvent => 15,
            EventType::XidEvent => 16,
            EventType::TableMapEvent => 19,
            EventType::WriteRowsEventV1 => 23,
            EventType::UpdateRowsEventV1 => 24,
            EventType::DeleteRowsEventV1 => 25,
            EventType::HeartbeatEvent => 27,
            EventType::RowsQueryEvent => 29,
            EventType::WriteRowsEvent => 30,
            EventType::UpdateRowsEvent => 31,
            EventType::DeleteRowsEvent => 32,
            EventType::GtidEvent => 33,
            EventType::AnonymousGtidEvent => 34,
            EventType::PreviousGtidsEvent => 35,
            EventType::Other(code) => *code,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Other(code) => write!(f, "UNKNOWN_EVENT({})", code),
            other => write!(f, "{:?}({})", other, other.code()),
        }
    }
}

/// 행 변경 동작
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    /// 행 이벤트 서브타입 → 동작. v1/v2는 의미가 같으므로 같은 동작으로 매핑
    pub fn from_event_type(event_type: EventType) -> Option<Action> {
        match event_type {
            EventType::WriteRowsEventV1 | EventType::WriteRowsEvent => Some(Action::Insert),
            EventType::UpdateRowsEventV1 | EventType::UpdateRowsEvent => Some(Action::Update),
            EventType::DeleteRowsEventV1 | EventType::DeleteRowsEvent => Some(Action::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타입스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (바이트)
    pub event_length: u32,
    /// 다음 이벤트 위치 (= 이 이벤트의 끝 오프셋). 서버가 만든 가상 이벤트는 0
    pub next_pos: u64,
}

impl EventHeader {
    pub fn new(event_type: EventType, next_pos: u64) -> Self {
        EventHeader {
            timestamp: 0,
            event_type,
            server_id: 0,
            event_length: 0,
            next_pos,
        }
    }
}

/// 테이블 맵 정보
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapData {
    /// 테이블 ID (연결마다 바뀔 수 있음)
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    pub column_count: u64,
}

/// 행 이벤트 데이터 (WRITE/UPDATE/DELETE 공통)
///
/// UPDATE의 경우 `rows`는 `[before, after, before, after, ...]` 순서로 펼쳐져 있음
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsEventData {
    /// 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 개수
    pub column_count: u64,
    /// 행 데이터들
    pub rows: Vec<Row>,
}

/// 한 행의 셀 값들 (컬럼 순서)
pub type Row = Vec<CellValue>;

/// 셀 값 (다양한 MySQL 타입 지원)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(String),
    Date(String),
    Time(String),
    Json(serde_json::Value),
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    /// 기본 데이터베이스명 (USE 된 스키마)
    pub database: String,
    /// 쿼리 문자열
    pub query: String,
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// Canal이 구분하는 Binlog 이벤트들
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BinlogEventData {
    Rotate(RotateEventData),
    Rows(RowsEventData),
    TableMap(TableMapData),
    FormatDescription,
    Query(QueryEventData),
    /// 그 외 모든 이벤트 (타입은 헤더에 있음)
    Other,
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogEvent {
    /// 이벤트 헤더
    pub header: EventHeader,
    /// 이벤트 데이터
    pub data: BinlogEventData,
}

impl BinlogEvent {
    pub fn rotate(next_binlog_name: impl Into<String>, position: u64) -> Self {
        BinlogEvent {
            header: EventHeader::new(EventType::RotateEvent, 0),
            data: BinlogEventData::Rotate(RotateEventData {
                next_binlog_name: next_binlog_name.into(),
                position,
            }),
        }
    }

    pub fn rows(event_type: EventType, next_pos: u64, data: RowsEventData) -> Self {
        BinlogEvent {
            header: EventHeader::new(event_type, next_pos),
            data: BinlogEventData::Rows(data),
        }
    }

    pub fn query(next_pos: u64, database: impl Into<String>, query: impl Into<String>) -> Self {
        BinlogEvent {
            header: EventHeader::new(EventType::QueryEvent, next_pos),
            data: BinlogEventData::Query(QueryEventData {
                database: database.into(),
                query: query.into(),
            }),
        }
    }

    pub fn other(event_type: EventType, next_pos: u64) -> Self {
        BinlogEvent {
            header: EventHeader::new(event_type, next_pos),
            data: BinlogEventData::Other,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.header.event_type
    }
}

/// CDC 변경 이벤트 (application-level view)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// 연산 타입 (INSERT, UPDATE, DELETE)
    pub op: Action,
    /// 타임스탬프
    pub timestamp: DateTime<Utc>,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 기본 키 컬럼들
    pub primary_keys: Vec<String>,
    /// 변경 전 데이터 (UPDATE/DELETE의 경우)
    pub before: Option<HashMap<String, CellValue>>,
    /// 변경 후 데이터 (INSERT/UPDATE의 경우)
    pub after: Option<HashMap<String, CellValue>>,
}

impl ChangeEvent {
    /// 디스패치된 행 배치를 컬럼명 기준 변경 이벤트로 변환
    pub fn from_rows(action: Action, table: &Table, rows: &[Row]) -> Vec<ChangeEvent> {
        let image = |row: &Row| -> HashMap<String, CellValue> {
            table
                .columns
                .iter()
                .zip(row.iter())
                .map(|(col, value)| (col.name.clone(), value.clone()))
                .collect()
        };
        let primary_keys: Vec<String> = table
            .primary_keys()
            .into_iter()
            .map(str::to_string)
            .collect();
        let event = |before, after| ChangeEvent {
            op: action,
            timestamp: Utc::now(),
            database: table.schema.clone(),
            table: table.name.clone(),
            primary_keys: primary_keys.clone(),
            before,
            after,
        };

        match action {
            Action::Insert => rows.iter().map(|r| event(None, Some(image(r)))).collect(),
            Action::Delete => rows.iter().map(|r| event(Some(image(r)), None)).collect(),
            Action::Update => rows
                .chunks(2)
                .map(|pair| match pair {
                    [before, after] => event(Some(image(before)), Some(image(after))),
                    [after] => event(None, Some(image(after))),
                    _ => event(None, None),
                })
                .collect(),
        }
    }
}
