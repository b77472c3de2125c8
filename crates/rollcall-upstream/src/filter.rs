//! Event filters applied during sync.
//!
//! Two stages, logged separately: the category allow-list, then the
//! name/fee predicate. Matching is case-insensitive throughout.

use rollcall_core::config::{FeeFilter, FilterConfig};

use crate::types::UpstreamEvent;

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    categories: Vec<String>,
    keywords: Vec<String>,
    exclude_keywords: Vec<String>,
    fee: FeeFilter,
}

fn lowered(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl EventFilter {
    pub fn from_config(cfg: &FilterConfig) -> Self {
        Self {
            categories: lowered(&cfg.categories),
            keywords: lowered(&cfg.keywords),
            exclude_keywords: lowered(&cfg.exclude_keywords),
            fee: cfg.fee,
        }
    }

    /// An empty allow-list accepts everything.
    pub fn category_allows(&self, event: &UpstreamEvent) -> bool {
        self.categories.is_empty()
            || event
                .categories
                .iter()
                .any(|c| self.categories.contains(&c.trim().to_lowercase()))
    }

    pub fn predicate_allows(&self, event: &UpstreamEvent) -> bool {
        let name = event.name.to_lowercase();
        if !self.keywords.is_empty() && !self.keywords.iter().any(|k| name.contains(k.as_str())) {
            return false;
        }
        if self.exclude_keywords.iter().any(|k| name.contains(k.as_str())) {
            return false;
        }
        match self.fee {
            FeeFilter::Any => true,
            FeeFilter::Free => event.is_free(),
            FeeFilter::Paid => !event.is_free(),
        }
    }
}
