//! wikiref: streaming Wikipedia dump importer for Postgres-compatible stores
//!
//! Each dump is read once, article by article, and written to three tables:
//!
//! 1. **`page`** -- id, title and lowercase title of every article
//! 2. **`page_content`** (optional) -- raw wikitext
//! 3. **`article_reference`** (optional) -- one row per distinct article a page
//!    links to, with the number of links and the position of the first one
//!
//! # Architecture
//!
//! - **Streaming XML decoding** -- a decoder thread parses the dump with quick-xml
//!   and hands articles over a small bounded channel
//! - **Bounded insertion pool** -- tokio workers pull from a bounded queue, so a
//!   slow database slows the reader instead of growing memory
//! - **Idempotent writes** -- every article is a delete-then-insert transaction
//!   keyed by page id; re-importing a dump converges to the same rows
//! - **Shared page cache** -- lowercase title to page id, filled from the store on
//!   miss and from every committed page
//! - **Per-item retries** -- failed transactions are rolled back and retried with
//!   backoff; items that exhaust their budget are reported and skipped
//!
//! # Key Modules
//!
//! - [`parser`] -- Incremental dump decoder
//! - [`references`] -- Link extraction and title normalization
//! - [`cache`] -- Title to page id cache
//! - [`store`] -- Store traits, Postgres and in-memory implementations
//! - [`pipeline`] -- Worker pool and the per-article write recipe
//! - [`import`] -- Runs the dumps of a folder one after the other
//! - [`fetch`] -- Dump discovery and decompression
//! - [`stats`] -- Atomic counters and velocity tracking
//! - [`models`] -- Core data types (Article, Reference, DumpInfo)
//! - [`config`] -- Constants and run configuration
//!
//! # Example Usage
//!
//! ```bash
//! # Create tables, then import every dump in ./dumps with references
//! wikiref init-schema --database-url postgres://root@localhost:26257/wiki
//! wikiref import -d dumps/ --with-page-references --tight
//!
//! # Try a dump without a database
//! wikiref -v import -d dumps/ --dry-run --limit 1000 --with-page-references
//! ```

pub mod cache;
pub mod config;
pub mod fetch;
pub mod import;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod references;
pub mod stats;
pub mod store;
