use serde::Serialize;

/// Site header read once at the top of every dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DumpInfo {
    pub site_name: String,
    pub db_name: String,
}

/// One `<page>` of a dump. `id` is the natural key; writing the same id again
/// replaces whatever was stored before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub text: String,
}

impl Article {
    pub fn new(id: i64, title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            text: text.into(),
        }
    }

    /// Key used for the `lower_title` column and the page cache.
    pub fn lower_title(&self) -> String {
        self.title.to_lowercase()
    }
}

/// A unique normalized link target within one article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub title: String,
    /// Every raw mention, the first one included.
    pub occurrence: u32,
    /// 1-based rank of the first mention.
    pub index: u32,
}

/// A [`Reference`] whose title resolved to a stored page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedReference {
    pub target_id: i64,
    pub occurrence: u32,
    pub index: u32,
}
