//! Canal - binlog 소비 루프
//!
//! 하나의 실행 컨텍스트에서 이벤트를 서버가 보낸 순서 그대로 처리합니다:
//! 1. 저장된 위치(없으면 설정값, 그것도 없으면 서버 현재 위치)에서 복제 시작
//! 2. 제한 시간 동안 다음 이벤트 대기 (만료는 에러가 아님)
//! 3. 이벤트 분류 → Rotate는 flush 후 파일 전환, Rows는 스키마 필터 후 디스패치
//! 4. 처리가 끝난 뒤에만 위치를 전진시키고 저장

use crate::config::CanalConfig;
use crate::dispatcher::{Dispatcher, Registrar};
use crate::error::{CdcError, Result};
use crate::events::{Action, BinlogEvent, BinlogEventData, EventType, RowsEventData};
use crate::offset::{CanalState, Position, PositionCursor};
use crate::position_store::PositionStore;
use crate::schema::{ddl_target, SchemaCache, SchemaIntrospector};
use crate::stream::ReplicationClient;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

/// 위치 대기 시 폴링 간격
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 외부 관찰자용 상태 핸들 (읽기 전용)
#[derive(Debug, Clone)]
pub struct StatusHandle {
    cursor: PositionCursor,
    state: Arc<RwLock<CanalState>>,
}

impl StatusHandle {
    pub fn position(&self) -> Position {
        self.cursor.snapshot()
    }

    pub fn state(&self) -> CanalState {
        *self.state.read()
    }

    /// 커서가 `target` 이상이 될 때까지 대기
    pub async fn wait_until(&self, target: &Position, timeout: Duration) -> Result<()> {
        let wait = async {
            loop {
                let current = self.cursor.snapshot();
                if current >= *target {
                    return Ok(());
                }
                if self.state() == CanalState::Stopped {
                    return Err(CdcError::Other(format!(
                        "canal stopped at {} before reaching {}",
                        current, target
                    )));
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| CdcError::DeadlineExceeded)?
    }
}

/// MySQL binlog CDC 엔진
pub struct Canal {
    config: CanalConfig,
    client: Box<dyn ReplicationClient>,
    store: Arc<dyn PositionStore>,
    cache: SchemaCache,
    dispatcher: Dispatcher,
    cursor: PositionCursor,
    state: Arc<RwLock<CanalState>>,
    span: Span,
}

impl Canal {
    pub fn new(
        config: CanalConfig,
        client: Box<dyn ReplicationClient>,
        introspector: Arc<dyn SchemaIntrospector>,
        store: Arc<dyn PositionStore>,
        dispatcher: Dispatcher,
    ) -> Self {
        let span = info_span!("canal", schema = %config.schema);
        Canal {
            config,
            client,
            store,
            cache: SchemaCache::new(introspector),
            dispatcher,
            cursor: PositionCursor::new(Position::new("", 0)),
            state: Arc::new(RwLock::new(CanalState::Idle)),
            span,
        }
    }

    /// 루프 로그가 기록될 span 지정
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn status(&self) -> StatusHandle {
        StatusHandle {
            cursor: self.cursor.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// 실행 중 핸들러 추가용 핸들
    pub fn registrar(&self) -> Registrar {
        self.dispatcher.registrar()
    }

    pub fn state(&self) -> CanalState {
        *self.state.read()
    }

    pub fn position(&self) -> Position {
        self.cursor.snapshot()
    }

    /// 소비 루프 실행
    ///
    /// `shutdown`에 `true`가 들어오면 대기 중이던 수신을 끊고 `Ok(())`로 종료합니다.
    /// 그 외에는 분류된 에러 하나로 끝날 때까지 돌아갑니다. 어느 쪽이든 종료 후 상태는
    /// `Stopped`이고, 다시 시작하려면 새 Canal이 필요합니다.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let span = self.span.clone();
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != CanalState::Idle {
                return Err(CdcError::Fatal(format!(
                    "canal is {}, a new instance is required",
                    *state
                )));
            }
            *state = CanalState::Syncing;
        }

        let result = self.sync(shutdown).await;
        *self.state.write() = CanalState::Stopped;

        match &result {
            Ok(()) => info!("Canal stopped at {}", self.cursor.snapshot()),
            Err(e) => error!("Canal stopped at {}: {}", self.cursor.snapshot(), e),
        }
        result
    }

    async fn sync(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let start = self.seed_position().await?;
        info!("Start syncing of binlog at {}", start);

        let mut stream = self.client.start_sync(&start).await.map_err(|e| match e {
            CdcError::Fatal(_) => e,
            other => CdcError::Fatal(format!(
                "Start sync replication at {} failed: {}",
                start, other
            )),
        })?;
        // 새 연결에서는 테이블 ID가 다시 매겨짐
        self.cache.invalidate_ids();

        let mut wait = self.config.idle_wait;
        loop {
            let applied = self.dispatcher.apply_pending();
            if applied > 0 {
                info!("Applied {} queued handler registration(s)", applied);
            }

            let next = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                next = stream.get_event(wait) => next,
            };

            match next {
                Ok(event) => {
                    wait = self.config.idle_wait;
                    self.handle_event(event).await?;
                }
                Err(CdcError::DeadlineExceeded) => {
                    trace!("No binlog event within {:?}", wait);
                    wait = (wait * 2).min(self.config.max_idle_wait);
                }
                Err(e) => {
                    return Err(CdcError::Stream {
                        position: self.cursor.snapshot(),
                        source: Box::new(e),
                    });
                }
            }
        }
    }

    async fn seed_position(&mut self) -> Result<Position> {
        let position = match self.store.load().await {
            Ok(Some(position)) => position,
            Ok(None) => match &self.config.start_position {
                Some(position) => position.clone(),
                None => self.client.current_position().await.map_err(|e| {
                    CdcError::Fatal(format!("Failed to read current binlog position: {}", e))
                })?,
            },
            Err(e) => {
                return Err(CdcError::Fatal(format!(
                    "Failed to load binlog position: {}",
                    e
                )))
            }
        };

        self.cursor.seek(position.clone());
        Ok(position)
    }

    async fn handle_event(&mut self, event: BinlogEvent) -> Result<()> {
        let event_type = event.event_type();
        let next_pos = event.header.next_pos;

        match event.data {
            BinlogEventData::Rotate(rotate) => {
                // 이전 파일의 작업을 먼저 마무리해야 새 파일 이벤트와 섞이지 않음
                self.dispatcher.flush().await?;
                let position = self
                    .cursor
                    .advance(rotate.next_binlog_name, rotate.position)?;
                info!("Rotate binlog to a new position {}", position);
                self.save_position(&position).await;
            }
            BinlogEventData::Rows(rows) => {
                self.handle_rows(event_type, rows).await?;
                self.commit(next_pos).await?;
            }
            BinlogEventData::TableMap(_) | BinlogEventData::FormatDescription => {
                trace!("Ignoring {}", event_type);
            }
            BinlogEventData::Query(query) if self.config.is_passthrough(event_type) => {
                if let Some(target) = ddl_target(&query.query, &query.database) {
                    if target.schema == self.config.schema {
                        info!("DDL on {}, dropping cached metadata", target);
                        self.cache.invalidate(&target);
                    }
                }
                self.commit(next_pos).await?;
            }
            _ if self.config.is_passthrough(event_type) => {
                self.commit(next_pos).await?;
            }
            _ => {
                return Err(CdcError::NotSupported(format!(
                    "EventType {} not yet supported at {}",
                    event_type,
                    self.cursor.snapshot()
                )));
            }
        }
        Ok(())
    }

    async fn handle_rows(
        &mut self,
        event_type: EventType,
        rows: RowsEventData,
    ) -> Result<()> {
        if rows.database != self.config.schema {
            debug!(
                "Skipping database {} (want {}), table id {}",
                rows.database, self.config.schema, rows.table_id
            );
            return Ok(());
        }

        let action = Action::from_event_type(event_type).ok_or_else(|| {
            CdcError::NotSupported(format!(
                "EventType {} not yet supported. Table {}.{}",
                event_type, rows.database, rows.table
            ))
        })?;

        let width = rows.rows.first().map(Vec::len).unwrap_or(0);
        let table = self
            .cache
            .resolve_for_rows(rows.table_id, &rows.database, &rows.table, width)
            .await?;

        self.dispatcher.dispatch(action, &table, &rows.rows).await?;
        Ok(())
    }

    /// 현재 파일 안에서 이벤트 끝 오프셋까지 전진 후 저장
    async fn commit(&mut self, next_pos: u64) -> Result<()> {
        if next_pos == 0 {
            // 서버가 스트림 시작 시 만든 가상 이벤트
            return Ok(());
        }
        let file = self.cursor.snapshot().file;
        let position = self.cursor.advance(file, next_pos)?;
        self.save_position(&position).await;
        Ok(())
    }

    /// 저장 실패는 치명적이지 않음: 로그만 남기고 계속 (재시작 시 재전달 가능)
    async fn save_position(&self, position: &Position) {
        if let Err(e) = self.store.save(position).await {
            warn!("Failed to save binlog position {}: {}", position, e);
        }
    }
}

/// 종료 신호 대기. 송신측이 사라지면 영원히 대기
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
