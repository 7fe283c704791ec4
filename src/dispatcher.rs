//! 행 변경 디스패처
//!
//! 분류된 행 배치를 해당 테이블에 등록된 모든 핸들러에 순서대로 전달합니다.
//! 핸들러 호출은 Canal 루프 안에서 차례로 await 되므로, 느린 핸들러는 곧바로
//! binlog 수신을 늦춥니다 (의도된 backpressure).

use crate::error::{CdcError, Result};
use crate::events::{Action, Row};
use crate::schema::{Table, TableName};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// 행 변경 핸들러
#[async_trait]
pub trait RowsEventHandler: Send + Sync {
    /// 로그와 에러 메시지에 쓰일 이름
    fn name(&self) -> &str;

    /// 행 배치 처리. 에러를 돌려주면 Canal 루프가 멈추고 위치는 전진하지 않음
    async fn on_rows(&self, action: Action, table: &Table, rows: &[Row]) -> Result<()>;

    /// 로그 회전 직전에 호출. 버퍼링한 작업을 커밋할 기회
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// 핸들러가 반응할 테이블
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableMatcher {
    /// 정확히 `schema.name`
    Exact(TableName),
    /// 모든 테이블
    Wildcard,
}

impl TableMatcher {
    pub fn table(schema: impl Into<String>, name: impl Into<String>) -> Self {
        TableMatcher::Exact(TableName::new(schema, name))
    }

    pub fn matches(&self, table: &TableName) -> bool {
        match self {
            TableMatcher::Exact(name) => name == table,
            TableMatcher::Wildcard => true,
        }
    }
}

impl fmt::Display for TableMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableMatcher::Exact(name) => write!(f, "{}", name),
            TableMatcher::Wildcard => f.write_str("*"),
        }
    }
}

/// 매처 하나와 그에 묶인 핸들러들 (등록 순서 유지)
#[derive(Clone)]
pub struct HandlerRegistration {
    pub matcher: TableMatcher,
    pub handlers: Vec<Arc<dyn RowsEventHandler>>,
}

/// 실행 중에 핸들러를 추가하기 위한 핸들
///
/// 추가 요청은 큐에 쌓였다가 디스패치 호출 사이에서만 반영됩니다.
#[derive(Clone)]
pub struct Registrar {
    tx: mpsc::UnboundedSender<(TableMatcher, Arc<dyn RowsEventHandler>)>,
}

impl Registrar {
    pub fn register(
        &self,
        matcher: TableMatcher,
        handler: Arc<dyn RowsEventHandler>,
    ) -> Result<()> {
        self.tx
            .send((matcher, handler))
            .map_err(|_| CdcError::ChannelClosed)
    }
}

/// 테이블별 핸들러 레지스트리 + 팬아웃
pub struct Dispatcher {
    registrations: Vec<HandlerRegistration>,
    pending_tx: mpsc::UnboundedSender<(TableMatcher, Arc<dyn RowsEventHandler>)>,
    pending_rx: Mutex<mpsc::UnboundedReceiver<(TableMatcher, Arc<dyn RowsEventHandler>)>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Dispatcher {
            registrations: Vec::new(),
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
        }
    }

    /// 시작 전에 핸들러 등록. 같은 매처면 기존 목록 뒤에 붙음
    pub fn register(&mut self, matcher: TableMatcher, handler: Arc<dyn RowsEventHandler>) {
        debug!("Registering handler {} for {}", handler.name(), matcher);
        match self.registrations.iter_mut().find(|r| r.matcher == matcher) {
            Some(registration) => registration.handlers.push(handler),
            None => self.registrations.push(HandlerRegistration {
                matcher,
                handlers: vec![handler],
            }),
        }
    }

    pub fn registrar(&self) -> Registrar {
        Registrar {
            tx: self.pending_tx.clone(),
        }
    }

    /// 큐에 쌓인 런타임 등록 반영. 반영된 개수 반환
    pub fn apply_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok((matcher, handler)) = self.pending_rx.get_mut().try_recv() {
            self.register(matcher, handler);
            applied += 1;
        }
        applied
    }

    /// 테이블에 해당하는 핸들러들: 정확히 일치하는 등록 먼저, 그다음 와일드카드
    pub fn handlers_for(&self, table: &TableName) -> Vec<Arc<dyn RowsEventHandler>> {
        let exact = self
            .registrations
            .iter()
            .filter(|r| r.matcher != TableMatcher::Wildcard && r.matcher.matches(table));
        let wildcard = self
            .registrations
            .iter()
            .filter(|r| r.matcher == TableMatcher::Wildcard);

        exact
            .chain(wildcard)
            .flat_map(|r| r.handlers.iter().cloned())
            .collect()
    }

    /// 행 배치 전달. 첫 번째 핸들러 에러에서 중단하고 에러를 그대로 올림
    ///
    /// 호출된 핸들러 수를 반환
    pub async fn dispatch(&self, action: Action, table: &Table, rows: &[Row]) -> Result<usize> {
        let name = table.table_name();
        let handlers = self.handlers_for(&name);
        if handlers.is_empty() {
            trace!("No handler registered for {}", name);
            return Ok(0);
        }

        for handler in &handlers {
            handler
                .on_rows(action, table, rows)
                .await
                .map_err(|e| CdcError::Dispatch {
                    handler: handler.name().to_string(),
                    table: name.to_string(),
                    source: Box::new(e),
                })?;
        }

        debug!(
            "Dispatched {} {} row(s) of {} to {} handler(s)",
            rows.len(),
            action,
            name,
            handlers.len()
        );
        Ok(handlers.len())
    }

    /// 등록된 모든 핸들러의 flush 훅 호출 (여러 번 등록된 핸들러도 한 번만)
    pub async fn flush(&self) -> Result<()> {
        let mut flushed: Vec<&Arc<dyn RowsEventHandler>> = Vec::new();
        for registration in &self.registrations {
            for handler in &registration.handlers {
                if flushed.iter().any(|done| Arc::ptr_eq(done, handler)) {
                    continue;
                }
                flushed.push(handler);

                handler.flush().await.map_err(|e| CdcError::Flush {
                    handler: handler.name().to_string(),
                    source: Box::new(e),
                })?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.registrations.iter().map(|r| r.handlers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CellValue;
    use crate::schema::Column;

    /// 호출 기록을 공유 로그에 남기는 핸들러
    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Recorder {
                name: name.to_string(),
                log: Arc::clone(log),
                fail: false,
            })
        }

        fn failing(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Recorder {
                name: name.to_string(),
                log: Arc::clone(log),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl RowsEventHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_rows(&self, action: Action, table: &Table, _rows: &[Row]) -> Result<()> {
            self.log
                .lock()
                .push(format!("{}:{}:{}", self.name, action, table.name));
            if self.fail {
                return Err(CdcError::Other("boom".to_string()));
            }
            Ok(())
        }

        async fn flush(&self) -> Result<()> {
            self.log.lock().push(format!("{}:flush", self.name));
            Ok(())
        }
    }

    fn table(name: &str) -> Table {
        Table::new("shop", name, vec![Column::new("id", "int", true)])
    }

    fn one_row() -> Vec<Row> {
        vec![vec![CellValue::Int64(1)]]
    }

    #[tokio::test]
    async fn test_exact_before_wildcard_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(TableMatcher::Wildcard, Recorder::new("audit", &log));
        dispatcher.register(TableMatcher::table("shop", "orders"), Recorder::new("first", &log));
        dispatcher.register(TableMatcher::table("shop", "orders"), Recorder::new("second", &log));
        dispatcher.register(TableMatcher::table("shop", "users"), Recorder::new("users", &log));

        let called = dispatcher
            .dispatch(Action::Insert, &table("orders"), &one_row())
            .await
            .unwrap();
        assert_eq!(called, 3);
        assert_eq!(
            *log.lock(),
            vec![
                "first:insert:orders".to_string(),
                "second:insert:orders".to_string(),
                "audit:insert:orders".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_first_error_aborts_remaining() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(TableMatcher::table("shop", "orders"), Recorder::failing("broken", &log));
        dispatcher.register(TableMatcher::Wildcard, Recorder::new("never", &log));

        let err = dispatcher
            .dispatch(Action::Delete, &table("orders"), &one_row())
            .await
            .unwrap_err();
        match err {
            CdcError::Dispatch { handler, table, .. } => {
                assert_eq!(handler, "broken");
                assert_eq!(table, "shop.orders");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(*log.lock(), vec!["broken:delete:orders".to_string()]);
    }

    #[tokio::test]
    async fn test_no_handlers_is_not_an_error() {
        let dispatcher = Dispatcher::new();
        let called = dispatcher
            .dispatch(Action::Update, &table("orders"), &one_row())
            .await
            .unwrap();
        assert_eq!(called, 0);
    }

    #[tokio::test]
    async fn test_flush_each_handler_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = Recorder::new("shared", &log);
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(TableMatcher::table("shop", "orders"), shared.clone());
        dispatcher.register(TableMatcher::Wildcard, shared);
        dispatcher.register(TableMatcher::Wildcard, Recorder::new("other", &log));

        dispatcher.flush().await.unwrap();
        assert_eq!(
            *log.lock(),
            vec!["shared:flush".to_string(), "other:flush".to_string()]
        );
    }

    #[tokio::test]
    async fn test_runtime_registration_applied_between_dispatches() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let registrar = dispatcher.registrar();

        registrar
            .register(TableMatcher::Wildcard, Recorder::new("late", &log))
            .unwrap();
        // 반영 전에는 보이지 않음
        assert!(dispatcher.is_empty());

        assert_eq!(dispatcher.apply_pending(), 1);
        dispatcher
            .dispatch(Action::Insert, &table("orders"), &one_row())
            .await
            .unwrap();
        assert_eq!(*log.lock(), vec!["late:insert:orders".to_string()]);
    }
}
