//! Pagination primitives for read-side listings.

use serde::{Deserialize, Serialize};

const MAX_PAGE_SIZE: usize = 100;
const DEFAULT_PAGE_SIZE: usize = 20;

/// A page request: 1-based page number plus a clamped page size.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: usize,
    /// Items per page, clamped to `1..=100`.
    pub page_size: usize,
}

impl PageRequest {
    /// Build a request, clamping out-of-range values instead of failing.
    pub fn new(page: usize, page_size: usize) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Index of the first item on this page.
    pub fn offset(&self) -> usize {
        (self.page - 1) * self.page_size
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

/// One page of results plus the total count across all pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// 1-based page number this page corresponds to.
    pub page: usize,
    /// Page size that was applied.
    pub page_size: usize,
    /// Total matching items across all pages.
    pub total: usize,
}

impl<T> Page<T> {
    /// Slice `items` (already filtered and ordered) down to the
    /// requested page.
    pub fn from_items(items: Vec<T>, request: PageRequest) -> Self {
        let total = items.len();
        let items = items
            .into_iter()
            .skip(request.offset())
            .take(request.page_size)
            .collect();
        Self {
            items,
            page: request.page,
            page_size: request.page_size,
            total,
        }
    }

    /// Whether a page after this one exists.
    pub fn has_next(&self) -> bool {
        self.page * self.page_size < self.total
    }
}
