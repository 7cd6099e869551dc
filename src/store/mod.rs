//! Relational store seam.
//!
//! The pipeline talks to storage through [`Store`] (point lookups and
//! transactions) and [`StoreTransaction`] (ordered [`Statement`]s followed by
//! a commit or a rollback). Two implementations ship with the crate:
//!
//! - [`postgres::PgStore`] -- sqlx over PostgreSQL wire protocol (PostgreSQL or
//!   CockroachDB)
//! - [`memory::MemoryStore`] -- in-process tables for dry runs and tests

pub mod memory;
pub mod postgres;

use crate::models::ResolvedReference;
use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One write against the `page`, `page_content` or `article_reference` tables.
#[derive(Debug, Clone, Copy)]
pub enum Statement<'a> {
    DeletePage {
        page_id: i64,
    },
    InsertPage {
        page_id: i64,
        title: &'a str,
        lower_title: &'a str,
    },
    DeleteContent {
        page_id: i64,
    },
    InsertContent {
        page_id: i64,
        content: &'a str,
    },
    DeleteReferences {
        page_id: i64,
    },
    /// Bulk insert, one row per reference. Never issued with an empty slice.
    InsertReferences {
        page_id: i64,
        references: &'a [ResolvedReference],
    },
}

impl Statement<'_> {
    pub fn page_id(&self) -> i64 {
        match *self {
            Statement::DeletePage { page_id }
            | Statement::InsertPage { page_id, .. }
            | Statement::DeleteContent { page_id }
            | Statement::InsertContent { page_id, .. }
            | Statement::DeleteReferences { page_id }
            | Statement::InsertReferences { page_id, .. } => page_id,
        }
    }

    /// Short label for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::DeletePage { .. } => "DELETE page",
            Statement::InsertPage { .. } => "INSERT page",
            Statement::DeleteContent { .. } => "DELETE page_content",
            Statement::InsertContent { .. } => "INSERT page_content",
            Statement::DeleteReferences { .. } => "DELETE article_reference",
            Statement::InsertReferences { .. } => "INSERT article_reference",
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// `SELECT page_id FROM page WHERE lower_title = ?`
    async fn find_page_id(&self, lower_title: &str) -> Result<Option<i64>, StoreError>;
}

/// Dropping a transaction without committing discards its statements.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn execute(&mut self, statement: Statement<'_>) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
