//! Full roster download and the phone-key index built over it.

use std::collections::HashMap;

use bpre_adapters::RosterSource;
use bpre_core::{BatchIntent, CustomerRecord, PhoneKey};
use tracing::{debug, warn};

use crate::ReconcileError;

pub const DEFAULT_PAGE_SIZE: usize = 500;
/// Hard ceiling on page requests, independent of what the server reports.
pub const DEFAULT_MAX_PAGES: usize = 200;

/// Normalized phone -> ids of the customers carrying it. Several records may
/// share a phone (households, duplicate entries), hence a list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhoneIndex {
    entries: HashMap<PhoneKey, Vec<String>>,
}

impl PhoneIndex {
    /// Records with an empty normalized phone or no id are left out.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CustomerRecord>) -> Self {
        let mut entries: HashMap<PhoneKey, Vec<String>> = HashMap::new();
        for record in records {
            let key = record.phone_key();
            if key.is_empty() || record.id.is_empty() {
                continue;
            }
            let ids = entries.entry(key).or_default();
            if !ids.contains(&record.id) {
                ids.push(record.id.clone());
            }
        }
        Self { entries }
    }

    /// Index only the records still awaiting `intent`, so a roster that has
    /// already converged yields no targets.
    pub fn for_intent(records: &[CustomerRecord], intent: BatchIntent) -> Self {
        Self::from_records(records.iter().filter(|r| intent.is_actionable(r)))
    }

    pub fn get(&self, key: &PhoneKey) -> Option<&[String]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &PhoneKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything fetched for one store during one session.
#[derive(Debug, Clone, Default)]
pub struct RosterSnapshot {
    pub store_id: String,
    pub records: Vec<CustomerRecord>,
    pub pages_fetched: usize,
    pub reported_total: Option<usize>,
    /// The page ceiling stopped the download before the roster said it was done.
    pub truncated: bool,
}

impl RosterSnapshot {
    pub fn records_by_id(&self) -> HashMap<&str, &CustomerRecord> {
        self.records.iter().map(|r| (r.id.as_str(), r)).collect()
    }
}

pub struct RosterIndexer<'a> {
    source: &'a dyn RosterSource,
    page_size: usize,
    max_pages: usize,
}

impl<'a> RosterIndexer<'a> {
    pub fn new(source: &'a dyn RosterSource) -> Self {
        Self {
            source,
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_limits(mut self, page_size: usize, max_pages: usize) -> Self {
        self.page_size = page_size.max(1);
        self.max_pages = max_pages.max(1);
        self
    }

    /// Page through the roster until a short page, until the reported total
    /// is reached, or until the page ceiling, whichever comes first.
    pub async fn fetch_roster(&self, store_id: &str) -> Result<RosterSnapshot, ReconcileError> {
        let store_id = store_id.trim();
        if store_id.is_empty() {
            return Err(ReconcileError::MissingStore);
        }

        let mut snapshot = RosterSnapshot {
            store_id: store_id.to_string(),
            truncated: true,
            ..Default::default()
        };

        for page in 1..=self.max_pages {
            let fetched = self
                .source
                .fetch_customer_page(store_id, page, self.page_size)
                .await
                .map_err(|source| ReconcileError::RosterFetch {
                    store_id: store_id.to_string(),
                    page,
                    source,
                })?;

            let received = fetched.data.len();
            snapshot.pages_fetched = page;
            if fetched.total.is_some() {
                snapshot.reported_total = fetched.total;
            }
            snapshot.records.extend(fetched.data);
            debug!(store_id, page, received, accumulated = snapshot.records.len(), "roster page");

            let short_page = received < self.page_size;
            let reached_total = snapshot
                .reported_total
                .is_some_and(|total| snapshot.records.len() >= total);
            if short_page || reached_total {
                snapshot.truncated = false;
                break;
            }
        }

        if snapshot.truncated {
            warn!(
                store_id,
                max_pages = self.max_pages,
                accumulated = snapshot.records.len(),
                reported_total = ?snapshot.reported_total,
                "roster page ceiling reached; reconciling against a partial roster"
            );
        }

        Ok(snapshot)
    }

    pub async fn build_index(
        &self,
        store_id: &str,
        intent: BatchIntent,
    ) -> Result<(PhoneIndex, RosterSnapshot), ReconcileError> {
        let snapshot = self.fetch_roster(store_id).await?;
        let index = PhoneIndex::for_intent(&snapshot.records, intent);
        Ok((index, snapshot))
    }
}
