/// MySQL Canal 실행 예제
///
/// 설정된 스키마의 행 변경을 받아 JSON 로그로 출력합니다.
/// 위치는 파일에 저장되므로 재시작하면 마지막 처리 지점부터 이어갑니다.
use async_trait::async_trait;
use mysql_canal::config::AppConfig;
use mysql_canal::dispatcher::{Dispatcher, RowsEventHandler, TableMatcher};
use mysql_canal::events::{Action, ChangeEvent, Row};
use mysql_canal::schema::Table;
use mysql_canal::{BinlogClient, Canal, FilePositionStore, MySqlIntrospector};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, info_span, warn};

/// 변경 이벤트를 JSON으로 로그에 남기는 핸들러
struct LogHandler;

#[async_trait]
impl RowsEventHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_rows(&self, action: Action, table: &Table, rows: &[Row]) -> mysql_canal::Result<()> {
        for change in ChangeEvent::from_rows(action, table, rows) {
            info!("{}", serde_json::to_string(&change)?);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let config = AppConfig::from_env()?;

    info!("Starting MySQL Canal for schema {}", config.canal.schema);
    info!(
        "Connecting to {}:{}",
        config.connection.hostname, config.connection.port
    );

    let mut dispatcher = Dispatcher::new();
    dispatcher.register(TableMatcher::Wildcard, Arc::new(LogHandler));

    let mut canal = Canal::new(
        config.canal.clone(),
        Box::new(BinlogClient::new(
            config.connection.clone(),
            config.channel_capacity,
        )),
        Arc::new(MySqlIntrospector::new(&config.connection)),
        Arc::new(FilePositionStore::new(&config.position_file)),
        dispatcher,
    )
    .with_span(info_span!(
        "canal",
        schema = %config.canal.schema,
        server_id = config.connection.server_id
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    canal.run(shutdown_rx).await?;

    info!("Canal stopped at {}", canal.position());
    Ok(())
}
