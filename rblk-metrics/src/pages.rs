use rblk_core::PAGE_SIZE;
use std::collections::HashMap;
use std::sync::Mutex;

/// Per-page fetch counts, used to spot pages that are repeatedly evicted
/// and fetched again.
#[derive(Debug, Default)]
pub struct PageStats {
    fetches: Mutex<HashMap<u64, u64>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PageStatsSummary {
    pub unique_pages: u64,
    pub total_fetches: u64,
    /// Average fetches per distinct page.
    pub average_refetch: f64,
}

impl PageStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one fetch of every page touched by `[position, position + len)`.
    pub fn record_fetch(&self, position: u64, len: usize) {
        let first = position / PAGE_SIZE as u64;
        let last = (position + len.max(1) as u64 - 1) / PAGE_SIZE as u64;
        if let Ok(mut fetches) = self.fetches.lock() {
            for page in first..=last {
                *fetches.entry(page).or_insert(0) += 1;
            }
        }
    }

    #[must_use]
    pub fn summary(&self) -> PageStatsSummary {
        let Ok(fetches) = self.fetches.lock() else {
            return PageStatsSummary::default();
        };
        let unique_pages = fetches.len() as u64;
        let total_fetches: u64 = fetches.values().sum();
        let average_refetch = if unique_pages == 0 {
            0.0
        } else {
            total_fetches as f64 / unique_pages as f64
        };
        PageStatsSummary {
            unique_pages,
            total_fetches,
            average_refetch,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut fetches) = self.fetches.lock() {
            fetches.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refetch_average() {
        let stats = PageStats::new();
        stats.record_fetch(0, PAGE_SIZE);
        stats.record_fetch(0, PAGE_SIZE);
        stats.record_fetch(PAGE_SIZE as u64, PAGE_SIZE);
        stats.record_fetch(0, 100);

        let summary = stats.summary();
        assert_eq!(summary.unique_pages, 2);
        assert_eq!(summary.total_fetches, 4);
        assert!((summary.average_refetch - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_multi_page_fetch_counts_each_page() {
        let stats = PageStats::new();
        stats.record_fetch(PAGE_SIZE as u64 - 1, 2);
        assert_eq!(stats.summary().unique_pages, 2);

        stats.clear();
        assert_eq!(stats.summary(), PageStatsSummary::default());
    }
}
