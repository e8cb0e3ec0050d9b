//! Read requests: search mode selection, cache keys and pagination math.

use serde::{Deserialize, Serialize};

use crate::DEFAULT_PAGE_SIZE;
use crate::types::Item;

/// Remote search strategy for a query string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Plain substring search through `GET /items`.
    #[default]
    Keyword,
    /// AI-assisted search through `GET /items/search/ai`.
    NaturalLanguage,
}

impl SearchMode {
    /// Classify a query: a sentence of three or more words is natural language.
    pub fn classify(query: &str) -> Self {
        if query.contains(' ') && query.split_whitespace().count() > 2 {
            Self::NaturalLanguage
        } else {
            Self::Keyword
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::NaturalLanguage => "natural_language",
        }
    }
}

/// Identifies one logical read; equal descriptors share a fetch and a cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub page: u32,
    pub page_size: u32,
    pub query: Option<String>,
    pub mode: SearchMode,
}

impl QueryDescriptor {
    /// Build a descriptor, clamping page numbers to at least 1 and classifying
    /// the query text. Blank queries are treated as no query.
    pub fn new(page: u32, page_size: u32, query: Option<&str>) -> Self {
        let query = query
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string);
        let mode = query
            .as_deref()
            .map(SearchMode::classify)
            .unwrap_or_default();
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
            query,
            mode,
        }
    }

    /// Force a search mode regardless of the classifier.
    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    /// First page of the unfiltered collection.
    pub fn first_page() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE, None)
    }

    /// Whether the remote call for this descriptor goes to AI search.
    pub fn uses_ai_search(&self) -> bool {
        self.mode == SearchMode::NaturalLanguage && self.query.is_some()
    }
}

/// Page metadata, as sent by the server and as derived locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    #[serde(alias = "pageSize")]
    pub page_size: u32,
    #[serde(alias = "totalItems")]
    pub total_items: u64,
    #[serde(alias = "totalPages")]
    pub total_pages: u64,
    #[serde(alias = "hasNextPage")]
    pub has_next_page: bool,
    #[serde(alias = "hasPreviousPage")]
    pub has_previous_page: bool,
}

impl Pagination {
    pub fn compute(page: u32, page_size: u32, total_items: u64) -> Self {
        let page_size = page_size.max(1);
        let total_pages = total_items.div_ceil(u64::from(page_size));
        Self {
            page,
            page_size,
            total_items,
            total_pages,
            has_next_page: u64::from(page) < total_pages,
            has_previous_page: page > 1,
        }
    }
}

/// One page of items plus its pagination metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedResult {
    pub items: Vec<Item>,
    #[serde(flatten)]
    pub pagination: Pagination,
}

impl PaginatedResult {
    /// Build a page from already-sliced items, truncating to the page size.
    pub fn new(mut items: Vec<Item>, page: u32, page_size: u32, total_items: u64) -> Self {
        let pagination = Pagination::compute(page, page_size, total_items);
        items.truncate(pagination.page_size as usize);
        Self { items, pagination }
    }

    pub fn empty(desc: &QueryDescriptor) -> Self {
        Self::new(Vec::new(), desc.page, desc.page_size, 0)
    }

    /// Recompute derived fields after `total_items` or `items` changed.
    pub fn renormalize(&mut self) {
        let p = self.pagination;
        self.pagination = Pagination::compute(p.page, p.page_size, p.total_items);
        self.items.truncate(self.pagination.page_size as usize);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|item| item.id == id)
    }
}

/// Filter by the descriptor's query and slice out the requested page.
pub fn paginate(items: &[Item], desc: &QueryDescriptor) -> PaginatedResult {
    let matching: Vec<&Item> = match desc.query.as_deref() {
        Some(q) => items.iter().filter(|item| item.matches(q)).collect(),
        None => items.iter().collect(),
    };

    // Descriptors built without `new` may carry zeros.
    let page = desc.page.max(1);
    let page_size = desc.page_size.max(1);
    let start = (page as usize - 1).saturating_mul(page_size as usize);
    let page_items = matching
        .iter()
        .skip(start)
        .take(page_size as usize)
        .map(|item| (*item).clone())
        .collect();

    PaginatedResult::new(page_items, page, page_size, matching.len() as u64)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CreateItemInput;

    fn items(names: &[(&str, &str)]) -> Vec<Item> {
        names
            .iter()
            .map(|(n, l)| Item::provisional(&CreateItemInput::new(*n, *l)))
            .collect()
    }

    #[test]
    fn test_paginate_clamps_zero_page_and_size() {
        let all = items(&[("Keys", "Drawer"), ("Wallet", "Shelf")]);
        let desc = QueryDescriptor {
            page: 0,
            page_size: 0,
            query: None,
            mode: SearchMode::Keyword,
        };
        let page = paginate(&all, &desc);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name, "Keys");
        assert_eq!(page.pagination.page, 1);
        assert_eq!(page.pagination.total_pages, 2);
        assert!(page.pagination.has_next_page);
    }

    // --- SearchMode ---

    #[test]
    fn test_single_word_is_keyword() {
        assert_eq!(SearchMode::classify("keys"), SearchMode::Keyword);
    }

    #[test]
    fn test_two_words_is_keyword() {
        assert_eq!(SearchMode::classify("car keys"), SearchMode::Keyword);
    }

    #[test]
    fn test_sentence_is_natural_language() {
        assert_eq!(
            SearchMode::classify("where are my keys"),
            SearchMode::NaturalLanguage
        );
    }

    // --- QueryDescriptor ---

    #[test]
    fn test_descriptor_classifies_query() {
        let desc = QueryDescriptor::new(1, 10, Some("where did I leave the charger"));
        assert_eq!(desc.mode, SearchMode::NaturalLanguage);
        assert!(desc.uses_ai_search());
    }

    #[test]
    fn test_descriptor_blank_query_is_none() {
        let desc = QueryDescriptor::new(1, 10, Some("   "));
        assert_eq!(desc.query, None);
        assert_eq!(desc.mode, SearchMode::Keyword);
    }

    #[test]
    fn test_descriptor_clamps_page() {
        let desc = QueryDescriptor::new(0, 0, None);
        assert_eq!(desc.page, 1);
        assert_eq!(desc.page_size, 1);
    }

    #[test]
    fn test_mode_is_part_of_key() {
        let keyword = QueryDescriptor::new(1, 10, Some("keys"));
        let natural = keyword.clone().with_mode(SearchMode::NaturalLanguage);
        assert_ne!(keyword, natural);
        assert_eq!(keyword, QueryDescriptor::new(1, 10, Some(" keys ")));
    }

    // --- Pagination ---

    #[test]
    fn test_pagination_invariant() {
        for total in 0u64..40 {
            for size in 1u32..8 {
                for page in 1u32..8 {
                    let p = Pagination::compute(page, size, total);
                    assert_eq!(p.total_pages, total.div_ceil(u64::from(size)));
                    assert_eq!(p.has_next_page, u64::from(page) < p.total_pages);
                    assert_eq!(p.has_previous_page, page > 1);
                }
            }
        }
    }

    #[test]
    fn test_pagination_empty_collection() {
        let p = Pagination::compute(1, 10, 0);
        assert_eq!(p.total_pages, 0);
        assert!(!p.has_next_page);
        assert!(!p.has_previous_page);
    }

    #[test]
    fn test_paginate_slices_pages() {
        let all = items(&[("a", "x"), ("b", "x"), ("c", "x"), ("d", "x"), ("e", "x")]);

        let first = paginate(&all, &QueryDescriptor::new(1, 2, None));
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].name, "a");
        assert_eq!(first.pagination.total_pages, 3);
        assert!(first.pagination.has_next_page);

        let last = paginate(&all, &QueryDescriptor::new(3, 2, None));
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].name, "e");
        assert!(!last.pagination.has_next_page);
        assert!(last.pagination.has_previous_page);
    }

    #[test]
    fn test_paginate_past_end_is_empty() {
        let all = items(&[("a", "x")]);
        let page = paginate(&all, &QueryDescriptor::new(5, 10, None));
        assert!(page.items.is_empty());
        assert_eq!(page.pagination.total_items, 1);
    }

    #[test]
    fn test_paginate_filters_name_or_location() {
        let all = items(&[
            ("Keys", "Drawer"),
            ("Wallet", "Key hook"),
            ("Glasses", "Nightstand"),
        ]);
        let page = paginate(&all, &QueryDescriptor::new(1, 10, Some("KEY")));
        let names: Vec<&str> = page.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Keys", "Wallet"]);
        assert_eq!(page.pagination.total_items, 2);
    }

    #[test]
    fn test_result_truncates_to_page_size() {
        let all = items(&[("a", "x"), ("b", "x"), ("c", "x")]);
        let result = PaginatedResult::new(all, 1, 2, 3);
        assert_eq!(result.items.len(), 2);
    }

    #[test]
    fn test_pagination_accepts_camel_case() {
        let json = r#"{"page":2,"pageSize":5,"totalItems":11,"totalPages":3,"hasNextPage":true,"hasPreviousPage":true}"#;
        let p: Pagination = serde_json::from_str(json).unwrap();
        assert_eq!(p, Pagination::compute(2, 5, 11));
    }
}
