//! Canal 설정

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::events::EventType;
use crate::offset::Position;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Canal 동작 설정
#[derive(Debug, Clone)]
pub struct CanalConfig {
    /// 추적할 스키마(데이터베이스). 다른 스키마의 Rows 이벤트는 건너뜀
    pub schema: String,
    /// 이벤트 대기 시작값. 유휴 대기가 만료될 때마다 두 배
    pub idle_wait: Duration,
    /// 유휴 대기 상한
    pub max_idle_wait: Duration,
    /// 저장된 위치가 없을 때 시작할 위치. 없으면 서버 현재 위치
    pub start_position: Option<Position>,
    /// 디스패치 없이 위치만 전진시킬 이벤트 종류 (트랜잭션 경계 등)
    ///
    /// 비어 있으면 Rotate/Rows/TableMap/FormatDescription 외 모든 이벤트가 NotSupported
    pub passthrough_events: Vec<EventType>,
}

impl CanalConfig {
    pub fn new(schema: impl Into<String>) -> Self {
        CanalConfig {
            schema: schema.into(),
            idle_wait: Duration::from_secs(1),
            max_idle_wait: Duration::from_secs(30),
            start_position: None,
            passthrough_events: Vec::new(),
        }
    }

    /// 행 기반 복제에서 항상 섞여 오는 트랜잭션 경계 이벤트들
    pub fn with_transaction_events(mut self) -> Self {
        self.passthrough_events = vec![
            EventType::QueryEvent,
            EventType::XidEvent,
            EventType::GtidEvent,
            EventType::AnonymousGtidEvent,
            EventType::PreviousGtidsEvent,
            EventType::RowsQueryEvent,
            EventType::HeartbeatEvent,
        ];
        self
    }

    pub fn is_passthrough(&self, event_type: EventType) -> bool {
        self.passthrough_events.contains(&event_type)
    }
}

/// 실행 파일 전체 설정 (환경 변수에서 읽음)
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub canal: CanalConfig,
    pub position_file: PathBuf,
    /// MySQL 펌프와 Canal 사이 채널 용량
    pub channel_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database = env::var("DB_NAME").unwrap_or_else(|_| "testdb".to_string());

        let connection = ConnectionConfig {
            hostname: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: parse_var("DB_PORT", 3306)?,
            username: env::var("DB_USER").unwrap_or_else(|_| "root".to_string()),
            password: env::var("DB_PASSWORD").unwrap_or_default(),
            database: Some(database.clone()),
            server_id: parse_var("CANAL_SERVER_ID", 1001)?,
            timeout: Duration::from_secs(parse_var("DB_TIMEOUT_SECS", 30)?),
        };

        let mut canal = CanalConfig::new(database).with_transaction_events();
        canal.idle_wait = Duration::from_millis(parse_var("CANAL_IDLE_WAIT_MS", 1000)?);
        canal.max_idle_wait = Duration::from_millis(parse_var("CANAL_MAX_IDLE_WAIT_MS", 30_000)?);
        if let Ok(file) = env::var("CANAL_START_FILE") {
            canal.start_position = Some(Position::new(
                file,
                parse_var("CANAL_START_POS", crate::offset::BINLOG_START_OFFSET)?,
            ));
        }
        if canal.max_idle_wait < canal.idle_wait {
            return Err(CdcError::Fatal(
                "CANAL_MAX_IDLE_WAIT_MS must not be smaller than CANAL_IDLE_WAIT_MS".to_string(),
            ));
        }

        Ok(AppConfig {
            connection,
            canal,
            position_file: env::var("CANAL_POSITION_FILE")
                .unwrap_or_else(|_| "canal-position.json".to_string())
                .into(),
            channel_capacity: parse_var("CANAL_CHANNEL_CAPACITY", 256)?,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CdcError::Fatal(format!("Invalid value for {}: {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_canal_config_is_strict() {
        let config = CanalConfig::new("shop");
        assert_eq!(config.schema, "shop");
        assert!(config.passthrough_events.is_empty());
        assert!(!config.is_passthrough(EventType::XidEvent));
        assert!(config.idle_wait <= config.max_idle_wait);
    }

    #[test]
    fn test_transaction_events_passthrough() {
        let config = CanalConfig::new("shop").with_transaction_events();
        assert!(config.is_passthrough(EventType::XidEvent));
        assert!(config.is_passthrough(EventType::QueryEvent));
        assert!(!config.is_passthrough(EventType::Other(99)));
        assert!(!config.is_passthrough(EventType::WriteRowsEvent));
    }

    #[test]
    fn test_parse_var_default_when_unset() {
        let value: u16 = parse_var("CANAL_TEST_SURELY_UNSET_VAR", 3306).unwrap();
        assert_eq!(value, 3306);
    }
}
