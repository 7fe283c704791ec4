//! Canal 에러 타입
//!
//! 루프를 멈추는 에러는 모두 하나의 분류된 `CdcError`로 표면화됩니다.

use crate::offset::Position;
use thiserror::Error;
use std::io;

#[derive(Error, Debug)]
pub enum CdcError {
    /// 스트리밍을 시작조차 할 수 없음 (구독 실패, 설정 오류)
    #[error("치명적 에러: {0}")]
    Fatal(String),

    /// 대기 시간 안에 이벤트가 도착하지 않음 (유휴 스트림, 재시도 대상)
    #[error("이벤트 대기 시간 초과")]
    DeadlineExceeded,

    #[error("지원하지 않는 이벤트: {0}")]
    NotSupported(String),

    #[error("테이블 조회 실패 {schema}.{table}")]
    TableLookup {
        schema: String,
        table: String,
        #[source]
        source: Box<CdcError>,
    },

    #[error("핸들러 {handler} 처리 실패 ({table})")]
    Dispatch {
        handler: String,
        table: String,
        #[source]
        source: Box<CdcError>,
    },

    #[error("핸들러 {handler} flush 실패")]
    Flush {
        handler: String,
        #[source]
        source: Box<CdcError>,
    },

    #[error("Binlog 스트림 에러 (위치 {position})")]
    Stream {
        position: Position,
        #[source]
        source: Box<CdcError>,
    },

    #[error("위치 역행: 현재 {current}, 요청 {requested}")]
    OutOfOrder {
        current: Position,
        requested: Position,
    },

    #[error("찾을 수 없음: {0}")]
    NotFound(String),

    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl CdcError {
    /// 재시도하면 되는 유휴 대기 만료인지 여부
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, CdcError::DeadlineExceeded)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CdcError::Fatal(_))
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
