use super::{Statement, Store, StoreError, StoreTransaction};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRow {
    pub page_id: i64,
    pub title: String,
    pub lower_title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceRow {
    pub page_id: i64,
    pub refered_page: i64,
    pub occurrence: u32,
    pub reference_index: u32,
}

#[derive(Default)]
struct Tables {
    pages: BTreeMap<i64, PageRow>,
    by_lower_title: FxHashMap<String, BTreeSet<i64>>,
    contents: BTreeMap<i64, String>,
    references: BTreeMap<i64, Vec<ReferenceRow>>,
}

impl Tables {
    fn delete_page(&mut self, page_id: i64) {
        if let Some(row) = self.pages.remove(&page_id) {
            if let Some(ids) = self.by_lower_title.get_mut(&row.lower_title) {
                ids.remove(&page_id);
                if ids.is_empty() {
                    self.by_lower_title.remove(&row.lower_title);
                }
            }
        }
    }

    fn insert_page(&mut self, row: PageRow) {
        self.by_lower_title
            .entry(row.lower_title.clone())
            .or_default()
            .insert(row.page_id);
        self.pages.insert(row.page_id, row);
    }

    /// Primary-key checks for a whole transaction, against committed rows plus
    /// the effects of earlier statements in the same transaction.
    fn validate(&self, ops: &[Op]) -> Result<(), StoreError> {
        let mut page_present: FxHashMap<i64, bool> = FxHashMap::default();
        let mut content_present: FxHashMap<i64, bool> = FxHashMap::default();

        for op in ops {
            match op {
                Op::DeletePage(id) => {
                    page_present.insert(*id, false);
                }
                Op::InsertPage(row) => {
                    let present = page_present
                        .get(&row.page_id)
                        .copied()
                        .unwrap_or_else(|| self.pages.contains_key(&row.page_id));
                    if present {
                        return Err(StoreError::Constraint(format!(
                            "duplicate key page_id={} in page",
                            row.page_id
                        )));
                    }
                    page_present.insert(row.page_id, true);
                }
                Op::DeleteContent(id) => {
                    content_present.insert(*id, false);
                }
                Op::InsertContent(id, _) => {
                    let present = content_present
                        .get(id)
                        .copied()
                        .unwrap_or_else(|| self.contents.contains_key(id));
                    if present {
                        return Err(StoreError::Constraint(format!(
                            "duplicate key page_id={id} in page_content"
                        )));
                    }
                    content_present.insert(*id, true);
                }
                Op::DeleteReferences(_) | Op::InsertReferences(_, _) => {}
            }
        }
        Ok(())
    }

    fn apply(&mut self, ops: Vec<Op>) {
        for op in ops {
            match op {
                Op::DeletePage(id) => self.delete_page(id),
                Op::InsertPage(row) => self.insert_page(row),
                Op::DeleteContent(id) => {
                    self.contents.remove(&id);
                }
                Op::InsertContent(id, content) => {
                    self.contents.insert(id, content);
                }
                Op::DeleteReferences(id) => {
                    self.references.remove(&id);
                }
                Op::InsertReferences(id, rows) => {
                    self.references.entry(id).or_default().extend(rows);
                }
            }
        }
    }
}

/// Owned copy of a [`Statement`], buffered until commit.
enum Op {
    DeletePage(i64),
    InsertPage(PageRow),
    DeleteContent(i64),
    InsertContent(i64, String),
    DeleteReferences(i64),
    InsertReferences(i64, Vec<ReferenceRow>),
}

impl From<Statement<'_>> for Op {
    fn from(statement: Statement<'_>) -> Self {
        match statement {
            Statement::DeletePage { page_id } => Op::DeletePage(page_id),
            Statement::InsertPage {
                page_id,
                title,
                lower_title,
            } => Op::InsertPage(PageRow {
                page_id,
                title: title.to_string(),
                lower_title: lower_title.to_string(),
            }),
            Statement::DeleteContent { page_id } => Op::DeleteContent(page_id),
            Statement::InsertContent { page_id, content } => {
                Op::InsertContent(page_id, content.to_string())
            }
            Statement::DeleteReferences { page_id } => Op::DeleteReferences(page_id),
            Statement::InsertReferences {
                page_id,
                references,
            } => Op::InsertReferences(
                page_id,
                references
                    .iter()
                    .map(|r| ReferenceRow {
                        page_id,
                        refered_page: r.target_id,
                        occurrence: r.occurrence,
                        reference_index: r.index,
                    })
                    .collect(),
            ),
        }
    }
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    lookups: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// In-process store with the same transactional contract as the database:
/// statements are buffered and become visible atomically on commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.shared
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a committed `page` row directly, bypassing transactions.
    pub fn seed_page(&self, page_id: i64, title: &str) {
        let mut tables = self.tables();
        tables.delete_page(page_id);
        tables.insert_page(PageRow {
            page_id,
            title: title.to_string(),
            lower_title: title.to_lowercase(),
        });
    }

    pub fn page(&self, page_id: i64) -> Option<PageRow> {
        self.tables().pages.get(&page_id).cloned()
    }

    pub fn page_count(&self) -> usize {
        self.tables().pages.len()
    }

    pub fn content(&self, page_id: i64) -> Option<String> {
        self.tables().contents.get(&page_id).cloned()
    }

    pub fn content_count(&self) -> usize {
        self.tables().contents.len()
    }

    /// Reference rows of `page_id`, ordered by `reference_index`.
    pub fn references(&self, page_id: i64) -> Vec<ReferenceRow> {
        let mut rows = self
            .tables()
            .references
            .get(&page_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_unstable_by_key(|r| r.reference_index);
        rows
    }

    pub fn reference_count(&self) -> usize {
        self.tables().references.values().map(Vec::len).sum()
    }

    /// Number of `find_page_id` calls served so far.
    pub fn lookup_count(&self) -> u64 {
        self.shared.lookups.load(Ordering::Relaxed)
    }

    pub fn commit_count(&self) -> u64 {
        self.shared.commits.load(Ordering::Relaxed)
    }

    pub fn rollback_count(&self) -> u64 {
        self.shared.rollbacks.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            ops: Vec::new(),
        }))
    }

    async fn find_page_id(&self, lower_title: &str) -> Result<Option<i64>, StoreError> {
        self.shared.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .tables()
            .by_lower_title
            .get(lower_title)
            .and_then(|ids| ids.iter().next().copied()))
    }
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    ops: Vec<Op>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn execute(&mut self, statement: Statement<'_>) -> Result<(), StoreError> {
        self.ops.push(Op::from(statement));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { shared, ops } = *self;
        {
            let mut tables = shared.tables.lock().unwrap_or_else(PoisonError::into_inner);
            tables.validate(&ops)?;
            tables.apply(ops);
        }
        shared.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.shared.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
