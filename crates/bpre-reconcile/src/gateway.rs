//! Single-customer state change with optimistic local cache update.

use std::sync::Arc;

use bpre_adapters::RosterSource;
use bpre_core::{BatchFailure, CustomerRecord, UpsertCustomer};
use bpre_storage::RosterCache;
use thiserror::Error;
use tracing::{debug, warn};

/// Per-item failure. Stays inside its batch result; never aborts a batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("customer {customer_id}: {message}")]
pub struct MutationError {
    pub customer_id: String,
    pub phone_number: String,
    pub message: String,
    pub detail: Option<String>,
}

impl From<MutationError> for BatchFailure {
    fn from(err: MutationError) -> Self {
        BatchFailure {
            customer_id: err.customer_id,
            phone_number: err.phone_number,
            message: err.message,
            detail: err.detail,
        }
    }
}

#[derive(Clone)]
pub struct OptimisticMutationGateway {
    source: Arc<dyn RosterSource>,
    cache: Arc<RosterCache>,
}

impl OptimisticMutationGateway {
    pub fn new(source: Arc<dyn RosterSource>, cache: Arc<RosterCache>) -> Self {
        Self { source, cache }
    }

    /// Write `active` into the cache, push the full customer through the
    /// upsert path, and put the cached entry back if the server refuses. The
    /// cache is marked stale either way so the next read refetches it.
    pub async fn set_active(
        &self,
        customer: &CustomerRecord,
        active: bool,
    ) -> Result<CustomerRecord, MutationError> {
        let prior = self.cache.set_active(&customer.id, active).await;
        let payload = UpsertCustomer::from_record(customer, active);

        let outcome = self.source.upsert_customer(&payload).await;
        self.cache.invalidate().await;

        match outcome {
            Ok(updated) => {
                debug!(customer_id = %customer.id, active, "customer updated");
                Ok(updated)
            }
            Err(err) => {
                if let Some(prior) = prior {
                    if !self.cache.restore(prior).await {
                        debug!(customer_id = %customer.id, "roster replaced mid-write; rollback skipped");
                    }
                }
                let detail = err.detail().map(str::to_string);
                warn!(
                    customer_id = %customer.id,
                    active,
                    error = %err,
                    detail = detail.as_deref().unwrap_or("-"),
                    "customer update failed; optimistic write rolled back"
                );
                Err(MutationError {
                    customer_id: customer.id.clone(),
                    phone_number: customer.phone_number.clone(),
                    message: err.to_string(),
                    detail,
                })
            }
        }
    }
}
