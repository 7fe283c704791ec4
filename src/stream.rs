//! 복제 클라이언트 경계
//!
//! binlog 와이어 포맷 해석은 외부 복제 클라이언트가 맡고, Canal은 여기 정의된
//! 두 인터페이스만 봅니다.

use crate::error::{CdcError, Result};
use crate::events::BinlogEvent;
use crate::offset::Position;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 복제가 시작된 이벤트 스트림
#[async_trait]
pub trait EventStream: Send {
    /// 다음 이벤트를 `wait` 동안 기다림
    ///
    /// 시간 안에 이벤트가 없으면 `CdcError::DeadlineExceeded`, 그 외 실패는 다른 에러
    async fn get_event(&mut self, wait: Duration) -> Result<BinlogEvent>;
}

/// 복제 클라이언트
#[async_trait]
pub trait ReplicationClient: Send {
    /// 주어진 위치부터 복제 시작
    async fn start_sync(&mut self, position: &Position) -> Result<Box<dyn EventStream>>;

    /// 서버의 현재 binlog 좌표 (저장된 위치가 없을 때 시작점)
    async fn current_position(&mut self) -> Result<Position>;
}

/// 이벤트 송신측
pub type EventSender = mpsc::Sender<Result<BinlogEvent>>;

/// 채널 기반 이벤트 스트림
///
/// 채널 용량만큼만 버퍼링하므로 소비가 느리면 생산자도 멈춥니다.
/// 수신은 취소해도 이벤트를 잃지 않습니다.
pub struct ChannelEventStream {
    rx: mpsc::Receiver<Result<BinlogEvent>>,
    pump: Option<JoinHandle<()>>,
}

impl ChannelEventStream {
    pub fn new(rx: mpsc::Receiver<Result<BinlogEvent>>) -> Self {
        ChannelEventStream { rx, pump: None }
    }

    /// 송수신 쌍 생성
    pub fn channel(capacity: usize) -> (EventSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }

    /// 생산 태스크를 스트림 수명에 묶음 (스트림이 drop 되면 태스크도 중단)
    pub fn with_pump(mut self, pump: JoinHandle<()>) -> Self {
        self.pump = Some(pump);
        self
    }
}

#[async_trait]
impl EventStream for ChannelEventStream {
    async fn get_event(&mut self, wait: Duration) -> Result<BinlogEvent> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Err(_) => Err(CdcError::DeadlineExceeded),
            Ok(None) => Err(CdcError::ChannelClosed),
            Ok(Some(event)) => event,
        }
    }
}

impl Drop for ChannelEventStream {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_idle_channel_reports_deadline() {
        let (_tx, mut stream) = ChannelEventStream::channel(4);
        let err = stream
            .get_event(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (tx, mut stream) = ChannelEventStream::channel(4);
        tx.send(Ok(BinlogEvent::other(EventType::XidEvent, 100)))
            .await
            .unwrap();
        tx.send(Ok(BinlogEvent::other(EventType::XidEvent, 200)))
            .await
            .unwrap();

        let first = assert_ok!(stream.get_event(Duration::from_secs(1)).await);
        let second = assert_ok!(stream.get_event(Duration::from_secs(1)).await);
        assert_eq!(first.header.next_pos, 100);
        assert_eq!(second.header.next_pos, 200);
    }

    #[tokio::test]
    async fn test_closed_channel_is_not_a_deadline() {
        let (tx, mut stream) = ChannelEventStream::channel(1);
        drop(tx);
        let err = stream.get_event(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CdcError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_stream_errors_pass_through() {
        let (tx, mut stream) = ChannelEventStream::channel(1);
        tx.send(Err(CdcError::ConnectionError("reset".to_string())))
            .await
            .unwrap();
        let err = stream.get_event(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CdcError::ConnectionError(_)));
    }
}
