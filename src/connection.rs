//! MySQL 데이터베이스 연결 관리
//!
//! 복제 스트림 외에 Canal이 MySQL에 직접 묻는 것은 세 가지뿐입니다:
//! 현재 binlog 좌표, binlog 형식, 테이블 컬럼 메타데이터.

use crate::error::{CdcError, Result};
use crate::offset::Position;
use crate::schema::{Column, SchemaIntrospector, Table};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, Row};
use std::time::Duration;
use tracing::{debug, warn};

const TABLE_COLUMNS_QUERY: &str = "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY, EXTRA \
     FROM INFORMATION_SCHEMA.COLUMNS \
     WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
     ORDER BY ORDINAL_POSITION";

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// 복제 클라이언트로 등록할 서버 ID (다른 레플리카와 겹치면 안 됨)
    pub server_id: u32,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            server_id: 1001,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn build_opts(&self) -> Opts {
        let password = if self.password.is_empty() {
            None
        } else {
            Some(self.password.clone())
        };

        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(password)
            .db_name(self.database.clone())
            .into()
    }
}

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn = tokio::time::timeout(config.timeout, Conn::new(config.build_opts()))
            .await
            .map_err(|_| {
                CdcError::ConnectionError(format!(
                    "Timed out connecting to {}:{}",
                    config.hostname, config.port
                ))
            })?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;

        Ok(MySqlConnection { conn })
    }

    /// 현재 binlog 파일과 위치
    ///
    /// MySQL 8.2+ 의 `SHOW BINARY LOG STATUS`를 먼저 시도하고 안 되면 `SHOW MASTER STATUS`
    pub async fn get_binlog_status(&mut self) -> Result<Position> {
        let rows: Vec<Row> = match self.conn.query("SHOW BINARY LOG STATUS").await {
            Ok(rows) => rows,
            Err(e) => {
                debug!("SHOW BINARY LOG STATUS failed ({}), falling back", e);
                self.conn
                    .query("SHOW MASTER STATUS")
                    .await
                    .map_err(|e| CdcError::QueryError(format!("Failed to query binlog status: {}", e)))?
            }
        };

        let row = rows
            .first()
            .ok_or_else(|| CdcError::QueryError("No binlog status available (is log_bin enabled?)".to_string()))?;

        let file = row
            .get_opt::<String, _>(0)
            .and_then(|v| v.ok())
            .ok_or_else(|| CdcError::QueryError("Binlog status without file name".to_string()))?;
        let position = row
            .get_opt::<u64, _>(1)
            .and_then(|v| v.ok())
            .ok_or_else(|| CdcError::QueryError("Binlog status without position".to_string()))?;

        Ok(Position::new(file, position))
    }

    /// Binlog 형식 확인 (ROW, STATEMENT, MIXED)
    pub async fn get_binlog_format(&mut self) -> Result<String> {
        let result: Vec<(String,)> = self
            .conn
            .query("SELECT @@global.binlog_format")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query binlog_format: {}", e)))?;

        result
            .into_iter()
            .next()
            .map(|(format,)| format)
            .ok_or_else(|| CdcError::QueryError("Binlog format not found".to_string()))
    }

    pub async fn close(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to close connection: {}", e)))
    }
}

async fn load_columns(conn: &mut Conn, database: &str, table: &str) -> Result<Vec<Column>> {
    let result: Vec<(String, String, String, String, String)> = conn
        .exec(TABLE_COLUMNS_QUERY, (database, table))
        .await
        .map_err(|e| CdcError::QueryError(format!("Failed to query table schema: {}", e)))?;

    Ok(result
        .into_iter()
        .map(|(name, column_type, is_nullable, column_key, extra)| Column {
            name,
            column_type,
            nullable: is_nullable == "YES",
            is_key: column_key == "PRI",
            extra,
        })
        .collect())
}

/// INFORMATION_SCHEMA 기반 스키마 조회기
pub struct MySqlIntrospector {
    pool: Pool,
}

impl MySqlIntrospector {
    pub fn new(config: &ConnectionConfig) -> Self {
        MySqlIntrospector {
            pool: Pool::new(config.build_opts()),
        }
    }
}

#[async_trait]
impl SchemaIntrospector for MySqlIntrospector {
    async fn load_table(&self, schema: &str, table: &str) -> Result<Table> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to get connection: {}", e)))?;

        let columns = load_columns(&mut conn, schema, table).await?;
        if columns.is_empty() {
            warn!("Table {}.{} not found in INFORMATION_SCHEMA", schema, table);
            return Err(CdcError::NotFound(format!("{}.{}", schema, table)));
        }

        Ok(Table::new(schema, table, columns))
    }
}
