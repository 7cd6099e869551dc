use crate::config::FilterMode;
use crate::models::{Reference, ResolvedReference};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use tracing::trace;

/// `==See also==`, `== See also ==`, `=== See  Also ===`, ...
static SEE_ALSO_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)={2,}[ \t]*see\s+also[ \t]*={2,}").unwrap());

/// Non-greedy, single line. The leading `.` requires a non-empty target.
pub static LINK_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[.(.*?)\]\]").unwrap());

/// Namespace prefixes to recognize in link candidates, and what to do on a match.
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    prefixes: Vec<String>,
    mode: FilterMode,
}

impl NamespaceFilter {
    pub fn new<I, S>(prefixes: I, mode: FilterMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| format!("{}:", p.as_ref().trim().to_lowercase()))
                .collect(),
            mode,
        }
    }

    /// Returns the matching prefix (colon included) of a raw `[[...]]` token.
    fn matching_prefix(&self, candidate: &str) -> Option<&str> {
        let inner = candidate.trim_start_matches("[[").trim_start().to_lowercase();
        self.prefixes
            .iter()
            .find(|p| inner.starts_with(p.as_str()))
            .map(String::as_str)
    }

    fn excludes(&self, candidate: &str) -> bool {
        match self.matching_prefix(candidate) {
            Some(prefix) => {
                trace!(candidate, prefix, mode = ?self.mode, "Namespaced link");
                self.mode == FilterMode::Exclude
            }
            None => false,
        }
    }
}

/// References of one article, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct References {
    ordered: Vec<Reference>,
    positions: FxHashMap<String, usize>,
}

impl References {
    fn mention(&mut self, title: String) {
        if let Some(&pos) = self.positions.get(&title) {
            self.ordered[pos].occurrence += 1;
            return;
        }
        let index = self.ordered.len() as u32 + 1;
        self.positions.insert(title.clone(), self.ordered.len());
        self.ordered.push(Reference {
            title,
            occurrence: 1,
            index,
        });
    }

    pub fn get(&self, title: &str) -> Option<&Reference> {
        self.positions.get(title).map(|&pos| &self.ordered[pos])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reference> {
        self.ordered.iter()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

impl IntoIterator for References {
    type Item = Reference;
    type IntoIter = std::vec::IntoIter<Reference>;

    fn into_iter(self) -> Self::IntoIter {
        self.ordered.into_iter()
    }
}

/// Text before the first "See also" heading.
pub fn body_before_see_also(text: &str) -> &str {
    match SEE_ALSO_HEADER.find(text) {
        Some(m) => &text[..m.start()],
        None => text,
    }
}

/// Canonical form of a raw `[[...]]` token, or of a bare title.
///
/// Order matters: display text after `|` goes first, then the `#anchor`, then
/// anything up to the first `:`; trimming happens before underscores become
/// spaces.
pub fn normalize_title(raw: &str) -> String {
    let s = raw.strip_prefix("[[").unwrap_or(raw);
    let s = s.strip_suffix("]]").unwrap_or(s);
    let s = s.split('|').next().unwrap_or_default();
    let s = s.split('#').next().unwrap_or_default();
    let s = match s.split_once(':') {
        Some((_, rest)) => rest,
        None => s,
    };
    s.trim().replace('_', " ").to_lowercase()
}

/// Aggregates the wiki links of `text` into first-seen-ordered references.
pub fn extract_references(text: &str, filter: &NamespaceFilter) -> References {
    let body = body_before_see_also(text);
    let mut references = References::default();

    for candidate in LINK_REGEX.find_iter(body).map(|m| m.as_str()) {
        if filter.excludes(candidate) {
            continue;
        }
        let title = normalize_title(candidate);
        if title.is_empty() {
            continue;
        }
        references.mention(title);
    }

    references
}

/// Folds references that resolved to the same page: occurrences add up and
/// the earliest index wins. Output is ordered by index.
pub fn merge_resolved<I>(resolved: I) -> Vec<ResolvedReference>
where
    I: IntoIterator<Item = (Reference, i64)>,
{
    let mut by_target: FxHashMap<i64, ResolvedReference> = FxHashMap::default();
    for (reference, target_id) in resolved {
        by_target
            .entry(target_id)
            .and_modify(|existing| {
                existing.occurrence += reference.occurrence;
                existing.index = existing.index.min(reference.index);
            })
            .or_insert(ResolvedReference {
                target_id,
                occurrence: reference.occurrence,
                index: reference.index,
            });
    }

    let mut merged: Vec<_> = by_target.into_values().collect();
    merged.sort_unstable_by_key(|r| r.index);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_ignored_prefixes;

    fn legacy() -> NamespaceFilter {
        NamespaceFilter::new(default_ignored_prefixes(), FilterMode::Legacy)
    }

    fn titles(refs: &References) -> Vec<&str> {
        refs.iter().map(|r| r.title.as_str()).collect()
    }

    #[test]
    fn aggregates_repeated_mentions() {
        let refs = extract_references("[[A]] mid [[A]] [[B]]", &legacy());
        assert_eq!(refs.len(), 2);
        let a = refs.get("a").unwrap();
        assert_eq!((a.occurrence, a.index), (2, 1));
        let b = refs.get("b").unwrap();
        assert_eq!((b.occurrence, b.index), (1, 2));
    }

    #[test]
    fn first_seen_index_is_stable() {
        let refs = extract_references("[[B]] [[A]] [[B]] [[C]] [[A]]", &legacy());
        assert_eq!(titles(&refs), vec!["b", "a", "c"]);
        assert_eq!(refs.get("c").unwrap().index, 3);
        assert_eq!(refs.get("a").unwrap().occurrence, 2);
    }

    #[test]
    fn stops_at_see_also() {
        let text = "Intro [[Rust]].\n== See also ==\n* [[Python]]";
        let refs = extract_references(text, &legacy());
        assert_eq!(titles(&refs), vec!["rust"]);
    }

    #[test]
    fn stops_at_compact_see_also() {
        let text = "Intro [[Rust]].\n==See also==\n* [[Python]]";
        let refs = extract_references(text, &legacy());
        assert_eq!(titles(&refs), vec!["rust"]);
    }

    #[test]
    fn see_also_is_case_insensitive() {
        let text = "[[Rust]]\n=== See Also ===\n[[Go]]";
        assert_eq!(body_before_see_also(text), "[[Rust]]\n");
    }

    #[test]
    fn see_also_at_start_drops_everything() {
        let refs = extract_references("== See also ==\n[[Rust]]", &legacy());
        assert!(refs.is_empty());
    }

    #[test]
    fn no_see_also_keeps_whole_text() {
        let text = "[[A]]\n== History ==\n[[B]]";
        assert_eq!(body_before_see_also(text), text);
    }

    #[test]
    fn normalize_namespace_and_display_text() {
        assert_eq!(normalize_title("[[Category:Foo|bar]]"), "foo");
    }

    #[test]
    fn normalize_pipe_before_colon() {
        // The colon lives in the display text, which is dropped first.
        assert_eq!(normalize_title("[[Foo|see: bar]]"), "foo");
    }

    #[test]
    fn normalize_anchor_before_colon() {
        assert_eq!(normalize_title("[[Rust#Syntax: overview]]"), "rust");
    }

    #[test]
    fn normalize_keeps_everything_after_first_colon() {
        assert_eq!(normalize_title("[[fr:Wikipédia:Accueil]]"), "wikipédia:accueil");
    }

    #[test]
    fn normalize_trims_before_underscores() {
        assert_eq!(normalize_title("[[ New_York_City ]]"), "new york city");
        assert_eq!(normalize_title("[[_Foo_]]"), " foo ");
    }

    #[test]
    fn normalize_bare_title() {
        assert_eq!(normalize_title("Rust (Programming Language)"), "rust (programming language)");
    }

    #[test]
    fn normalize_unicode_lowercase() {
        assert_eq!(normalize_title("[[Édouard_Manet]]"), "édouard manet");
    }

    #[test]
    fn empty_titles_are_discarded() {
        let refs = extract_references("[[#Section]] [[ |x]] [[Category:]] [[A]]", &legacy());
        assert_eq!(titles(&refs), vec!["a"]);
        assert_eq!(refs.get("a").unwrap().index, 1);
    }

    #[test]
    fn anchors_merge_into_same_title() {
        let refs = extract_references("[[Rust#History]] [[rust|the language]]", &legacy());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs.get("rust").unwrap().occurrence, 2);
    }

    #[test]
    fn links_do_not_span_lines() {
        let refs = extract_references("[[Broken\nlink]] [[Ok]]", &legacy());
        assert_eq!(titles(&refs), vec!["ok"]);
    }

    #[test]
    fn legacy_mode_keeps_namespaced_links() {
        let refs = extract_references("[[Category:Science]] [[Template:Cite]]", &legacy());
        assert_eq!(titles(&refs), vec!["science", "cite"]);
    }

    #[test]
    fn exclude_mode_drops_namespaced_links() {
        let filter = NamespaceFilter::new(default_ignored_prefixes(), FilterMode::Exclude);
        let refs = extract_references(
            "[[Category:Science]] [[Physics]] [[catégorie:Sciences]] [[Portal: Art]]",
            &filter,
        );
        assert_eq!(titles(&refs), vec!["physics"]);
        assert_eq!(refs.get("physics").unwrap().index, 1);
    }

    #[test]
    fn exclude_mode_keeps_unlisted_namespaces() {
        let filter = NamespaceFilter::new(["category"], FilterMode::Exclude);
        let refs = extract_references("[[File:Logo.png|thumb]]", &filter);
        assert_eq!(titles(&refs), vec!["logo.png"]);
    }

    #[test]
    fn merge_sums_and_keeps_earliest_index() {
        let merged = merge_resolved(vec![
            (
                Reference {
                    title: "uk".into(),
                    occurrence: 1,
                    index: 3,
                },
                7,
            ),
            (
                Reference {
                    title: "london".into(),
                    occurrence: 2,
                    index: 1,
                },
                9,
            ),
            (
                Reference {
                    title: "united kingdom".into(),
                    occurrence: 4,
                    index: 2,
                },
                7,
            ),
        ]);
        assert_eq!(
            merged,
            vec![
                ResolvedReference {
                    target_id: 9,
                    occurrence: 2,
                    index: 1
                },
                ResolvedReference {
                    target_id: 7,
                    occurrence: 5,
                    index: 2
                },
            ]
        );
    }

    #[test]
    fn merge_empty() {
        assert!(merge_resolved(Vec::new()).is_empty());
    }
}
