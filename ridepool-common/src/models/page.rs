use serde::{Deserialize, Serialize};

/// Offset-based page request.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    pub fn next(&self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// One page of results plus the total count, so callers can compute
/// `has_more` explicitly instead of guessing from a short page.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
}

impl<T> Paged<T> {
    pub fn new(items: Vec<T>, total: usize, offset: usize) -> Self {
        Self {
            items,
            total,
            offset,
        }
    }

    pub fn has_more(&self) -> bool {
        self.offset + self.items.len() < self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_more_compares_total_against_fetched() {
        let page = Paged::new(vec![1, 2, 3], 10, 0);
        assert!(page.has_more());

        let last = Paged::new(vec![9, 10], 10, 8);
        assert!(!last.has_more());

        let empty: Paged<i32> = Paged::new(vec![], 0, 0);
        assert!(!empty.has_more());
    }

    #[test]
    fn next_page_advances_by_limit() {
        let page = Page::first(20);
        assert_eq!(page.next().offset, 20);
        assert_eq!(page.next().limit, 20);
    }
}
