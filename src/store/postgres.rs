use super::{Statement, Store, StoreError, StoreTransaction};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use std::time::Duration;
use tracing::info;

/// Bind parameters per row of `article_reference`
const REFERENCE_COLUMNS: usize = 4;

/// Rows per multi-row INSERT; keeps bind parameters well under the protocol's 65535
const MAX_REFERENCE_ROWS: usize = 32_768 / REFERENCE_COLUMNS;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Idempotent DDL for the three tables the importer writes. Parent/child links
/// between tables are not declared as foreign keys: the upsert deletes the
/// `page` row before re-inserting it, and other articles may still point at it.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS page (
        page_id BIGINT PRIMARY KEY,
        title TEXT NOT NULL,
        lower_title TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS page_lower_title_idx ON page (lower_title)",
    "CREATE TABLE IF NOT EXISTS page_content (
        page_id BIGINT PRIMARY KEY,
        content TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS article_reference (
        page_id BIGINT NOT NULL,
        refered_page BIGINT NOT NULL,
        occurrence BIGINT NOT NULL,
        reference_index BIGINT NOT NULL,
        PRIMARY KEY (page_id, refered_page)
    )",
    "CREATE INDEX IF NOT EXISTS article_reference_refered_page_idx ON article_reference (refered_page)",
];

const SQL_DELETE_PAGE: &str = "DELETE FROM page WHERE page_id = $1";
const SQL_INSERT_PAGE: &str = "INSERT INTO page (page_id, title, lower_title) VALUES ($1, $2, $3)";
const SQL_DELETE_CONTENT: &str = "DELETE FROM page_content WHERE page_id = $1";
const SQL_INSERT_CONTENT: &str = "INSERT INTO page_content (page_id, content) VALUES ($1, $2)";
const SQL_DELETE_REFERENCES: &str = "DELETE FROM article_reference WHERE page_id = $1";
const SQL_INSERT_REFERENCES: &str =
    "INSERT INTO article_reference (page_id, refered_page, occurrence, reference_index) ";
const SQL_FIND_PAGE: &str = "SELECT page_id FROM page WHERE lower_title = $1 LIMIT 1";

/// PostgreSQL-protocol store. Works against CockroachDB as well.
///
/// Workers hold one pooled connection for the duration of their transaction and
/// page lookups borrow another, so size the pool above the worker count.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await?;
        info!(max_connections, "Connected to database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        info!("Schema ready");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn find_page_id(&self, lower_title: &str) -> Result<Option<i64>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(SQL_FIND_PAGE)
            .bind(lower_title)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn execute(&mut self, statement: Statement<'_>) -> Result<(), StoreError> {
        match statement {
            Statement::DeletePage { page_id } => {
                sqlx::query(SQL_DELETE_PAGE)
                    .bind(page_id)
                    .execute(&mut *self.tx)
                    .await?;
            }
            Statement::InsertPage {
                page_id,
                title,
                lower_title,
            } => {
                sqlx::query(SQL_INSERT_PAGE)
                    .bind(page_id)
                    .bind(title)
                    .bind(lower_title)
                    .execute(&mut *self.tx)
                    .await?;
            }
            Statement::DeleteContent { page_id } => {
                sqlx::query(SQL_DELETE_CONTENT)
                    .bind(page_id)
                    .execute(&mut *self.tx)
                    .await?;
            }
            Statement::InsertContent { page_id, content } => {
                sqlx::query(SQL_INSERT_CONTENT)
                    .bind(page_id)
                    .bind(content)
                    .execute(&mut *self.tx)
                    .await?;
            }
            Statement::DeleteReferences { page_id } => {
                sqlx::query(SQL_DELETE_REFERENCES)
                    .bind(page_id)
                    .execute(&mut *self.tx)
                    .await?;
            }
            Statement::InsertReferences {
                page_id,
                references,
            } => {
                for chunk in references.chunks(MAX_REFERENCE_ROWS) {
                    let mut builder = QueryBuilder::<Postgres>::new(SQL_INSERT_REFERENCES);
                    builder.push_values(chunk, |mut row, reference| {
                        row.push_bind(page_id)
                            .push_bind(reference.target_id)
                            .push_bind(i64::from(reference.occurrence))
                            .push_bind(i64::from(reference.index));
                    });
                    builder.build().execute(&mut *self.tx).await?;
                }
            }
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let PgTransaction { tx } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let PgTransaction { tx } = *self;
        tx.rollback().await?;
        Ok(())
    }
}
