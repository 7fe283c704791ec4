//! MySQL Binlog CDC (Change Data Capture) Canal
//!
//! 이 라이브러리는 MySQL 바이너리 로그를 복제 클라이언트로 받아 행 변경을 핸들러에 전달합니다.
//! 주요 기능:
//! - 재시작 가능한 binlog 위치 추적 및 저장
//! - 테이블 메타데이터 캐시 (ID 재사용, DDL 대응)
//! - 테이블별 / 와일드카드 핸들러 디스패치
//! - 유휴 스트림 백오프와 협조적 종료

pub mod binlog_client;
pub mod canal;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod offset;
pub mod position_store;
pub mod schema;
pub mod stream;

pub use binlog_client::BinlogClient;
pub use canal::{Canal, StatusHandle};
pub use config::{AppConfig, CanalConfig};
pub use connection::{ConnectionConfig, MySqlConnection, MySqlIntrospector};
pub use dispatcher::{Dispatcher, Registrar, RowsEventHandler, TableMatcher};
pub use error::{CdcError, Result};
pub use events::{Action, BinlogEvent, ChangeEvent, EventType, Row};
pub use offset::{CanalState, Position};
pub use position_store::{FilePositionStore, MemoryPositionStore, PositionStore};
pub use schema::{SchemaCache, SchemaIntrospector, Table, TableName};
pub use stream::{EventStream, ReplicationClient};
