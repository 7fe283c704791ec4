//! 테이블 스키마 캐시
//!
//! Rows 이벤트는 연결마다 바뀌는 숫자 테이블 ID만 들고 옵니다. 서버는 재연결이나
//! 일부 DDL 이후 같은 ID를 다른 테이블에 다시 쓰기 때문에, 캐시의 기준 키는
//! 언제나 `(schema, name)` 이고 ID는 따로 무효화할 수 있는 보조 인덱스입니다.

use crate::error::{CdcError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// `schema.table` 형태의 테이블 식별자 (캐시의 영구 키)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        TableName {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// 테이블 컬럼 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: String,
    pub nullable: bool,
    pub is_key: bool,
    pub extra: String,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>, is_key: bool) -> Self {
        Column {
            name: name.into(),
            column_type: column_type.into(),
            nullable: !is_key,
            is_key,
            extra: String::new(),
        }
    }
}

/// 테이블 메타데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub schema: String,
    pub name: String,
    /// 컬럼 (ORDINAL_POSITION 순서)
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, columns: Vec<Column>) -> Self {
        Table {
            schema: schema.into(),
            name: name.into(),
            columns,
        }
    }

    pub fn table_name(&self) -> TableName {
        TableName::new(self.schema.clone(), self.name.clone())
    }

    pub fn primary_keys(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_key)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// 스키마 조회 인터페이스 (INFORMATION_SCHEMA 등)
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    /// 테이블 메타데이터 로드. 없으면 `CdcError::NotFound`
    async fn load_table(&self, schema: &str, table: &str) -> Result<Table>;
}

/// 미리 등록된 테이블만 돌려주는 조회기 (임베딩, 테스트용)
#[derive(Debug, Default)]
pub struct StaticIntrospector {
    tables: RwLock<HashMap<TableName, Table>>,
    loads: AtomicUsize,
}

impl StaticIntrospector {
    pub fn new(tables: impl IntoIterator<Item = Table>) -> Self {
        let introspector = StaticIntrospector::default();
        for table in tables {
            introspector.put(table);
        }
        introspector
    }

    /// 테이블 추가 또는 교체 (DDL 흉내)
    pub fn put(&self, table: Table) {
        self.tables.write().insert(table.table_name(), table);
    }

    /// `load_table` 호출 횟수
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchemaIntrospector for StaticIntrospector {
    async fn load_table(&self, schema: &str, table: &str) -> Result<Table> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.tables
            .read()
            .get(&TableName::new(schema, table))
            .cloned()
            .ok_or_else(|| CdcError::NotFound(format!("{}.{}", schema, table)))
    }
}

/// 테이블 ID + 이름 → 메타데이터 캐시
pub struct SchemaCache {
    introspector: Arc<dyn SchemaIntrospector>,
    tables: HashMap<TableName, Arc<Table>>,
    ids: HashMap<u64, TableName>,
}

impl SchemaCache {
    pub fn new(introspector: Arc<dyn SchemaIntrospector>) -> Self {
        SchemaCache {
            introspector,
            tables: HashMap::new(),
            ids: HashMap::new(),
        }
    }

    /// 테이블 해석
    ///
    /// ID 히트라도 이름이 다르면 ID 항목을 버리고 이름 기준으로 새로 로드합니다.
    /// 로드 실패 시 캐시에 아무것도 넣지 않습니다.
    pub async fn resolve(&mut self, table_id: u64, schema: &str, name: &str) -> Result<Arc<Table>> {
        let wanted = TableName::new(schema, name);

        let mut reused_id = false;
        if let Some(cached) = self.ids.get(&table_id) {
            if *cached == wanted {
                if let Some(table) = self.tables.get(cached) {
                    return Ok(Arc::clone(table));
                }
            } else {
                debug!(
                    "Table id {} reused: cached {}, requested {}",
                    table_id, cached, wanted
                );
                reused_id = true;
                self.ids.remove(&table_id);
            }
        }

        if !reused_id {
            if let Some(table) = self.tables.get(&wanted) {
                let table = Arc::clone(table);
                self.ids.insert(table_id, wanted);
                return Ok(table);
            }
        }

        let table = self
            .introspector
            .load_table(schema, name)
            .await
            .map_err(|e| CdcError::TableLookup {
                schema: schema.to_string(),
                table: name.to_string(),
                source: Box::new(e),
            })?;

        let table = Arc::new(table);
        debug!(
            "Loaded metadata for {} ({} columns, table id {})",
            wanted,
            table.columns.len(),
            table_id
        );
        self.tables.insert(wanted.clone(), Arc::clone(&table));
        self.ids.insert(table_id, wanted);
        Ok(table)
    }

    /// 들어온 행 폭과 컬럼 수가 다르면 한 번 다시 로드
    pub async fn resolve_for_rows(
        &mut self,
        table_id: u64,
        schema: &str,
        name: &str,
        row_width: usize,
    ) -> Result<Arc<Table>> {
        let table = self.resolve(table_id, schema, name).await?;
        if row_width == 0 || table.columns.len() == row_width {
            return Ok(table);
        }

        info!(
            "Column count of {}.{} changed ({} cached, {} in event), reloading",
            schema,
            name,
            table.columns.len(),
            row_width
        );
        self.invalidate(&TableName::new(schema, name));
        let table = self.resolve(table_id, schema, name).await?;
        if table.columns.len() != row_width {
            warn!(
                "{}.{} still has {} columns but event rows carry {}",
                schema,
                name,
                table.columns.len(),
                row_width
            );
        }
        Ok(table)
    }

    /// 테이블 항목과 그 테이블을 가리키는 모든 ID 제거
    pub fn invalidate(&mut self, table: &TableName) {
        self.tables.remove(table);
        self.ids.retain(|_, name| name != table);
    }

    /// 연결이 바뀌면 숫자 ID는 더 이상 믿을 수 없음
    pub fn invalidate_ids(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn ddl_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?is)^\s*(?:ALTER(?:\s+ONLINE|\s+IGNORE)?|DROP|TRUNCATE|RENAME)\s+TABLE\s+(?:IF\s+EXISTS\s+)?(?:`?([\w$]+)`?\s*\.\s*)?`?([\w$]+)`?",
            )
            .ok()
        })
        .as_ref()
}

/// DDL 쿼리가 건드리는 테이블 (ALTER/DROP/TRUNCATE/RENAME TABLE)
pub fn ddl_target(query: &str, default_schema: &str) -> Option<TableName> {
    let caps = ddl_pattern()?.captures(query)?;
    let schema = caps
        .get(1)
        .map(|m| m.as_str())
        .unwrap_or(default_schema);
    let table = caps.get(2)?.as_str();
    Some(TableName::new(schema, table))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders(columns: usize) -> Table {
        let mut cols = vec![Column::new("id", "bigint", true)];
        for i in 1..columns {
            cols.push(Column::new(format!("c{}", i), "varchar(32)", false));
        }
        Table::new("shop", "orders", cols)
    }

    #[tokio::test]
    async fn test_resolve_miss_then_hit() {
        let introspector = Arc::new(StaticIntrospector::new([orders(3)]));
        let mut cache = SchemaCache::new(introspector.clone());

        let table = cache.resolve(42, "shop", "orders").await.unwrap();
        assert_eq!(table.columns.len(), 3);
        assert_eq!(table.primary_keys(), vec!["id"]);

        cache.resolve(42, "shop", "orders").await.unwrap();
        assert_eq!(introspector.load_count(), 1);

        // 새 ID라도 이름 키가 있으면 다시 로드하지 않음
        cache.resolve(77, "shop", "orders").await.unwrap();
        assert_eq!(introspector.load_count(), 1);
    }

    #[tokio::test]
    async fn test_reused_id_forces_reload_by_name() {
        let introspector = Arc::new(StaticIntrospector::new([
            orders(3),
            Table::new("shop", "users", vec![Column::new("id", "int", true)]),
        ]));
        let mut cache = SchemaCache::new(introspector.clone());

        cache.resolve(42, "shop", "orders").await.unwrap();
        let users = cache.resolve(42, "shop", "users").await.unwrap();
        assert_eq!(users.name, "users");
        assert_eq!(introspector.load_count(), 2);

        // 42는 이제 users를 가리킴
        let again = cache.resolve(42, "shop", "users").await.unwrap();
        assert_eq!(again.name, "users");
        assert_eq!(introspector.load_count(), 2);
    }

    #[tokio::test]
    async fn test_lookup_failure_does_not_populate() {
        let introspector = Arc::new(StaticIntrospector::default());
        let mut cache = SchemaCache::new(introspector);

        let err = cache.resolve(1, "shop", "missing").await.unwrap_err();
        match err {
            CdcError::TableLookup { schema, table, source } => {
                assert_eq!(schema, "shop");
                assert_eq!(table, "missing");
                assert!(matches!(*source, CdcError::NotFound(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_row_width_mismatch_reloads_once() {
        let introspector = Arc::new(StaticIntrospector::new([orders(3)]));
        let mut cache = SchemaCache::new(introspector.clone());
        cache.resolve(5, "shop", "orders").await.unwrap();

        // ALTER TABLE ADD COLUMN
        introspector.put(orders(4));
        let table = cache.resolve_for_rows(5, "shop", "orders", 4).await.unwrap();
        assert_eq!(table.columns.len(), 4);
        assert_eq!(introspector.load_count(), 2);

        let table = cache.resolve_for_rows(5, "shop", "orders", 4).await.unwrap();
        assert_eq!(table.columns.len(), 4);
        assert_eq!(introspector.load_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_ids_keeps_tables() {
        let introspector = Arc::new(StaticIntrospector::new([orders(2)]));
        let mut cache = SchemaCache::new(introspector.clone());
        cache.resolve(9, "shop", "orders").await.unwrap();

        cache.invalidate_ids();
        assert_eq!(cache.len(), 1);
        cache.resolve(10, "shop", "orders").await.unwrap();
        assert_eq!(introspector.load_count(), 1);
    }

    #[test]
    fn test_ddl_target() {
        assert_eq!(
            ddl_target("ALTER TABLE `orders` ADD COLUMN note text", "shop"),
            Some(TableName::new("shop", "orders"))
        );
        assert_eq!(
            ddl_target("drop table if exists `crm`.`leads`", "shop"),
            Some(TableName::new("crm", "leads"))
        );
        assert_eq!(
            ddl_target("RENAME TABLE shop.a TO shop.b", "x"),
            Some(TableName::new("shop", "a"))
        );
        assert_eq!(ddl_target("BEGIN", "shop"), None);
        assert_eq!(ddl_target("INSERT INTO orders VALUES (1)", "shop"), None);
    }
}
