//! Page slicing for list endpoints.
//!
//! Drift and promotion listings are sorted in memory before slicing, so pages
//! are cut from a loaded `Vec` rather than pushed down to the store.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: usize = 25;
pub const MAX_PAGE_SIZE: usize = 100;

/// `?page=&per_page=` query; pages are 1-indexed
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationParams {
    #[serde(default = "first_page")]
    pub page: usize,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

fn first_page() -> usize {
    1
}

fn default_per_page() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: first_page(),
            per_page: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PaginationParams {
    pub fn page(&self) -> usize {
        self.page.max(1)
    }

    pub fn limit(&self) -> usize {
        self.per_page.clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> usize {
        (self.page() - 1) * self.limit()
    }

    /// Cut one page out of an already ordered collection
    pub fn paginate<T>(&self, items: Vec<T>) -> PaginatedResponse<T> {
        let total = items.len();
        let data = items.into_iter().skip(self.offset()).take(self.limit()).collect();
        PaginatedResponse {
            data,
            meta: PaginationMeta::new(self.page(), self.limit(), total),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PaginationMeta {
    fn new(page: usize, per_page: usize, total: usize) -> Self {
        let total_pages = total.div_ceil(per_page);
        Self {
            page,
            per_page,
            total,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub meta: PaginationMeta,
}
