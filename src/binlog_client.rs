//! MySQL Binlog 클라이언트
//!
//! 와이어 포맷 파싱은 mysql_async의 binlog 스트림에 맡기고, 여기서는 결과를
//! Canal 이벤트로 옮겨 담아 bounded 채널로 흘려보냅니다. 스트림 읽기 자체는 별도
//! 태스크가 담당하므로 Canal 쪽 대기 시간이 만료되어도 패킷 중간에 끊기지 않습니다.
//!
//! 위치는 Rows 이벤트마다 저장되므로 여러 Rows 이벤트로 나뉜 문장 중간에서 재시작할 수
//! 있습니다. 이때 새 연결은 그 문장의 TableMap을 받지 못하므로, 매핑되지 않은 테이블 ID를
//! 만나면 같은 파일 처음부터 다시 읽어 TableMap을 채우고 이미 넘긴 구간은 버립니다.

use crate::connection::{ConnectionConfig, MySqlConnection};
use crate::error::{CdcError, Result};
use crate::events::{
    BinlogEvent, BinlogEventData, CellValue, EventHeader, EventType, QueryEventData,
    RotateEventData, Row, RowsEventData, TableMapData,
};
use crate::offset::{Position, BINLOG_START_OFFSET};
use crate::stream::{ChannelEventStream, EventSender, EventStream, ReplicationClient};
use async_trait::async_trait;
use futures::StreamExt;
use mysql_async::binlog::events::{Event, EventData};
use mysql_async::binlog::jsonb;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Value};
use tracing::{debug, error, info, warn};

/// Binlog 클라이언트
pub struct BinlogClient {
    config: ConnectionConfig,
    channel_capacity: usize,
}

impl BinlogClient {
    /// 새 Binlog 클라이언트 생성
    pub fn new(config: ConnectionConfig, channel_capacity: usize) -> Self {
        BinlogClient {
            config,
            channel_capacity,
        }
    }
}

#[async_trait]
impl ReplicationClient for BinlogClient {
    async fn start_sync(&mut self, position: &Position) -> Result<Box<dyn EventStream>> {
        info!("Starting binlog streaming from {}", position);

        let mut check = MySqlConnection::connect(&self.config).await?;
        let format = check.get_binlog_format().await?;
        check.close().await?;
        if !format.eq_ignore_ascii_case("ROW") {
            return Err(CdcError::Fatal(format!(
                "binlog_format must be ROW, server uses {}",
                format
            )));
        }

        let stream = open_stream(&self.config, position).await?;

        let (tx, events) = ChannelEventStream::channel(self.channel_capacity);
        let pump = tokio::spawn(pump_events(
            self.config.clone(),
            position.file.clone(),
            stream,
            tx,
        ));
        Ok(Box::new(events.with_pump(pump)))
    }

    async fn current_position(&mut self) -> Result<Position> {
        let mut conn = MySqlConnection::connect(&self.config).await?;
        let position = conn.get_binlog_status().await?;
        conn.close().await?;
        Ok(position)
    }
}

async fn open_stream(config: &ConnectionConfig, position: &Position) -> Result<BinlogStream> {
    let conn = Conn::new(config.build_opts())
        .await
        .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;

    let request = BinlogStreamRequest::new(config.server_id)
        .with_filename(position.file.as_bytes())
        .with_pos(position.offset);
    let stream = conn
        .get_binlog_stream(request)
        .await
        .map_err(|e| CdcError::ConnectionError(format!("COM_BINLOG_DUMP failed: {}", e)))?;

    info!(
        "Registered as replica server_id={} at {}",
        config.server_id, position
    );
    Ok(stream)
}

/// 테이블 맵을 다시 채우기 위한 재탐색 상태
#[derive(Debug, Default)]
struct Rewind {
    /// 이 오프셋 이하에서 끝나는 이벤트는 이미 전달됨
    replay_until: Option<u64>,
    last: Option<Position>,
}

impl Rewind {
    /// `at`에서 시작하는 이벤트 때문에 재탐색할지 결정. 같은 이벤트로는 한 번만
    fn begin(&mut self, at: Position) -> bool {
        if self.last.as_ref() == Some(&at) {
            return false;
        }
        self.replay_until = Some(at.offset);
        self.last = Some(at);
        true
    }

    /// 재탐색 후 다시 읽히는 이벤트(가상 이벤트 포함)인지
    fn skip(&mut self, next_pos: u64) -> bool {
        match self.replay_until {
            Some(until) if next_pos == 0 || next_pos <= until => true,
            Some(_) => {
                self.replay_until = None;
                false
            }
            None => false,
        }
    }
}

/// 행 이벤트인데 테이블 맵이 없으면 그 테이블 ID
fn unmapped_table_id(stream: &BinlogStream, event: &Event) -> Option<u64> {
    match event.read_data() {
        Ok(Some(EventData::RowsEvent(rows))) => {
            let table_id = rows.table_id();
            stream.get_tme(table_id).is_none().then_some(table_id)
        }
        _ => None,
    }
}

/// mysql_async 스트림 → 채널. 수신측이 닫히거나 스트림이 끝나면 종료
async fn pump_events(
    config: ConnectionConfig,
    mut file: String,
    mut stream: BinlogStream,
    tx: EventSender,
) {
    let mut event_count: u64 = 0;
    let mut rewind = Rewind::default();
    loop {
        let next = match stream.next().await {
            Some(Ok(event)) => {
                let header = event.header();
                let next_pos = u64::from(header.log_pos());
                if rewind.skip(next_pos) {
                    continue;
                }

                if let Some(table_id) = unmapped_table_id(&stream, &event) {
                    let start = next_pos.saturating_sub(u64::from(header.event_size()));
                    if rewind.begin(Position::new(file.clone(), start)) {
                        warn!(
                            "Table id {} at {}:{} has no table map, re-reading {} from the start",
                            table_id, file, start, file
                        );
                        match open_stream(&config, &Position::new(file.clone(), BINLOG_START_OFFSET))
                            .await
                        {
                            Ok(reopened) => {
                                stream = reopened;
                                continue;
                            }
                            Err(e) => Err(e),
                        }
                    } else {
                        decode_event(&stream, &event)
                    }
                } else {
                    decode_event(&stream, &event)
                }
            }
            Some(Err(e)) => {
                error!("Failed to read binlog event: {}", e);
                Err(CdcError::ConnectionError(format!("Binlog stream failed: {}", e)))
            }
            None => {
                info!("Binlog stream ended after {} events", event_count);
                Err(CdcError::ConnectionError("Binlog stream closed by server".to_string()))
            }
        };

        if let Ok(BinlogEvent {
            data: BinlogEventData::Rotate(rotate),
            ..
        }) = &next
        {
            file = rotate.next_binlog_name.clone();
        }

        let failed = next.is_err();
        if tx.send(next).await.is_err() {
            debug!("Event receiver dropped, stopping binlog pump");
            return;
        }
        if failed {
            return;
        }
        event_count += 1;
    }
}

/// mysql_async 이벤트를 Canal 이벤트로 변환
fn decode_event(stream: &BinlogStream, event: &Event) -> Result<BinlogEvent> {
    let raw_header = event.header();
    let header = EventHeader {
        timestamp: raw_header.timestamp(),
        event_type: EventType::from_u8(raw_header.event_type_raw()),
        server_id: raw_header.server_id(),
        event_length: raw_header.event_size(),
        next_pos: u64::from(raw_header.log_pos()),
    };

    let data = event
        .read_data()
        .map_err(|e| CdcError::BinlogParseError(format!("{} payload: {}", header.event_type, e)))?;

    let data = match data {
        Some(EventData::RotateEvent(rotate)) => BinlogEventData::Rotate(RotateEventData {
            next_binlog_name: rotate.name().into_owned(),
            position: rotate.position(),
        }),
        Some(EventData::FormatDescriptionEvent(_)) => BinlogEventData::FormatDescription,
        Some(EventData::TableMapEvent(tme)) => BinlogEventData::TableMap(TableMapData {
            table_id: tme.table_id(),
            database: tme.database_name().into_owned(),
            table: tme.table_name().into_owned(),
            column_count: tme.columns_count(),
        }),
        Some(EventData::QueryEvent(query)) => BinlogEventData::Query(QueryEventData {
            database: query.schema().into_owned(),
            query: query.query().into_owned(),
        }),
        Some(EventData::RowsEvent(rows_event)) => {
            let table_id = rows_event.table_id();
            let tme = stream.get_tme(table_id).ok_or_else(|| {
                CdcError::BinlogParseError(format!("Rows event for unmapped table id {}", table_id))
            })?;

            let mut rows: Vec<Row> = Vec::new();
            for row in rows_event.rows(tme) {
                let (before, after) = row.map_err(|e| {
                    CdcError::BinlogParseError(format!(
                        "Rows of {}.{}: {}",
                        tme.database_name(),
                        tme.table_name(),
                        e
                    ))
                })?;
                // UPDATE는 before, after 순서로 펼침
                for image in [before, after].into_iter().flatten() {
                    rows.push(
                        (0..image.len())
                            .map(|i| image.as_ref(i).map(convert_value).unwrap_or(CellValue::Null))
                            .collect(),
                    );
                }
            }

            BinlogEventData::Rows(RowsEventData {
                table_id,
                database: tme.database_name().into_owned(),
                table: tme.table_name().into_owned(),
                column_count: tme.columns_count(),
                rows,
            })
        }
        _ => BinlogEventData::Other,
    };

    Ok(BinlogEvent { header, data })
}

fn convert_value(value: &BinlogValue<'_>) -> CellValue {
    match value {
        BinlogValue::Value(value) => convert_mysql_value(value),
        BinlogValue::Jsonb(jsonb) => convert_jsonb(jsonb),
        // 부분 JSON 갱신은 전체 문서가 없으므로 원문 표현으로 넘김
        BinlogValue::JsonDiff(diffs) => CellValue::String(format!("{:?}", diffs)),
    }
}

fn convert_jsonb(value: &jsonb::Value<'_>) -> CellValue {
    match serde_json::Value::try_from(value.clone()) {
        Ok(json) => CellValue::Json(json),
        Err(e) => {
            debug!("JSON column not representable as JSON ({}), passing as text", e);
            CellValue::String(format!("{:?}", value))
        }
    }
}

fn convert_mysql_value(value: &Value) -> CellValue {
    match value {
        Value::NULL => CellValue::Null,
        Value::Int(i) => CellValue::Int64(*i),
        Value::UInt(u) => CellValue::UInt64(*u),
        Value::Float(f) => CellValue::Float(*f),
        Value::Double(d) => CellValue::Double(*d),
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => CellValue::String(s.to_string()),
            Err(_) => CellValue::Bytes(bytes.clone()),
        },
        Value::Date(year, month, day, 0, 0, 0, 0) => {
            CellValue::Date(format!("{:04}-{:02}-{:02}", year, month, day))
        }
        Value::Date(year, month, day, hour, minute, second, micros) => CellValue::DateTime(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            year, month, day, hour, minute, second, micros
        )),
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let total_hours = u64::from(*days) * 24 + u64::from(*hours);
            CellValue::Time(format!(
                "{}{:02}:{:02}:{:02}.{:06}",
                sign, total_hours, minutes, seconds, micros
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_scalar_values() {
        assert_eq!(convert_mysql_value(&Value::NULL), CellValue::Null);
        assert_eq!(convert_mysql_value(&Value::Int(-7)), CellValue::Int64(-7));
        assert_eq!(convert_mysql_value(&Value::UInt(7)), CellValue::UInt64(7));
        assert_eq!(
            convert_mysql_value(&Value::Bytes(b"hello".to_vec())),
            CellValue::String("hello".to_string())
        );
        assert_eq!(
            convert_mysql_value(&Value::Bytes(vec![0xff, 0xfe])),
            CellValue::Bytes(vec![0xff, 0xfe])
        );
    }

    #[test]
    fn test_convert_temporal_values() {
        assert_eq!(
            convert_mysql_value(&Value::Date(2024, 2, 29, 0, 0, 0, 0)),
            CellValue::Date("2024-02-29".to_string())
        );
        assert_eq!(
            convert_mysql_value(&Value::Date(2024, 2, 29, 13, 5, 9, 120)),
            CellValue::DateTime("2024-02-29 13:05:09.000120".to_string())
        );
        assert_eq!(
            convert_mysql_value(&Value::Time(true, 1, 2, 3, 4, 0)),
            CellValue::Time("-26:03:04.000000".to_string())
        );
    }

    #[test]
    fn test_convert_json_values() {
        assert_eq!(
            convert_value(&BinlogValue::Jsonb(jsonb::Value::I32(5))),
            CellValue::Json(serde_json::json!(5))
        );
        assert_eq!(
            convert_value(&BinlogValue::Value(Value::Int(5))),
            CellValue::Int64(5)
        );
        // 부분 갱신은 문자열 그대로
        assert_eq!(
            convert_value(&BinlogValue::JsonDiff(Vec::new())),
            CellValue::String("[]".to_string())
        );
    }

    #[test]
    fn test_rewind_skips_replayed_events() {
        let mut rewind = Rewind::default();
        assert!(!rewind.skip(500));

        assert!(rewind.begin(Position::new("mysql-bin.000003", 900)));
        // 가상 Rotate, FormatDescription, 이미 넘긴 이벤트들
        assert!(rewind.skip(0));
        assert!(rewind.skip(126));
        assert!(rewind.skip(900));
        // 매핑이 없던 이벤트부터 다시 전달
        assert!(!rewind.skip(1240));
        assert!(!rewind.skip(1500));
    }

    #[test]
    fn test_rewind_once_per_event() {
        let mut rewind = Rewind::default();
        let at = Position::new("mysql-bin.000003", 900);
        assert!(rewind.begin(at.clone()));
        assert!(!rewind.begin(at));
        assert!(rewind.begin(Position::new("mysql-bin.000003", 2048)));
    }

    #[tokio::test]
    #[ignore] // 실제 MySQL 연결 필요
    async fn test_start_sync_live() {
        let mut client = BinlogClient::new(ConnectionConfig::new("localhost", "root"), 16);
        let position = client.current_position().await.unwrap();
        let mut stream = client.start_sync(&position).await.unwrap();
        // 처음 몇 개는 서버가 만든 Rotate / FormatDescription
        let first = stream
            .get_event(std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(first.event_type(), EventType::RotateEvent);
    }
}
