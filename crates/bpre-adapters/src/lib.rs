//! Roster source contract + HTTP and fixture-backed implementations.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bpre_core::{CustomerPage, CustomerRecord, PhoneKey, UpsertCustomer};
use bpre_storage::{ApiClient, FetchError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;

pub const CRATE_NAME: &str = "bpre-adapters";

pub const CUSTOMERS_PATH: &str = "customers";
pub const UPSERT_PATH: &str = "customers/upsert";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{message}")]
    Rejected {
        message: String,
        detail: Option<String>,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl SourceError {
    /// Server-reported detail, when the backend supplied one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            SourceError::Fetch(err) => err.detail(),
            SourceError::Rejected { detail, .. } => detail.as_deref(),
            SourceError::Anyhow(_) => None,
        }
    }
}

/// The two remote operations the engine consumes: a paginated roster read and
/// the upsert write path. No partial update: the backend answers 404 for it.
#[async_trait]
pub trait RosterSource: Send + Sync {
    /// `page` is 1-based.
    async fn fetch_customer_page(
        &self,
        store_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<CustomerPage, SourceError>;

    async fn upsert_customer(&self, payload: &UpsertCustomer) -> Result<CustomerRecord, SourceError>;
}

/// Customer as the API returns it. Field names drift between endpoints, so ids
/// and scalars are accepted in several shapes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCustomer {
    #[serde(default)]
    pub id: Option<JsonValue>,
    #[serde(default, rename = "_id")]
    pub underscore_id: Option<JsonValue>,
    #[serde(default)]
    pub customer_id: Option<JsonValue>,
    #[serde(default)]
    pub uuid: Option<JsonValue>,
    #[serde(default, alias = "phone")]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub country_code: Option<JsonValue>,
    #[serde(default)]
    pub stores: Vec<JsonValue>,
    #[serde(default, alias = "isActive")]
    pub active: Option<bool>,
}

impl WireCustomer {
    /// First non-empty of `id`, `_id`, `customerId`, `uuid`.
    pub fn resolved_id(&self) -> Option<String> {
        [&self.id, &self.underscore_id, &self.customer_id, &self.uuid]
            .into_iter()
            .filter_map(|v| v.as_ref().and_then(scalar_text))
            .find(|s| !s.is_empty())
    }

    /// Missing `active` is read as active.
    pub fn into_record(self) -> CustomerRecord {
        let id = self.resolved_id().unwrap_or_default();
        let stores = self
            .stores
            .iter()
            .filter_map(|store| match store {
                JsonValue::Object(map) => ["id", "_id", "storeId"]
                    .iter()
                    .filter_map(|k| map.get(*k).and_then(scalar_text))
                    .find(|s| !s.is_empty()),
                other => scalar_text(other),
            })
            .filter(|s| !s.is_empty())
            .collect();
        CustomerRecord {
            id,
            phone_number: self.phone_number.unwrap_or_default(),
            first_name: self.first_name.unwrap_or_default(),
            country_code: self
                .country_code
                .as_ref()
                .and_then(scalar_text)
                .filter(|s| !s.is_empty()),
            stores,
            active: self.active.unwrap_or(true),
        }
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WirePage {
    #[serde(default, alias = "customers", alias = "items")]
    pub data: Vec<WireCustomer>,
    #[serde(default, alias = "count")]
    pub total: Option<JsonValue>,
}

impl WirePage {
    pub fn into_page(self) -> CustomerPage {
        let total = self.total.as_ref().and_then(|v| match v {
            JsonValue::Number(n) => n.as_u64().map(|n| n as usize),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        CustomerPage {
            data: self.data.into_iter().map(WireCustomer::into_record).collect(),
            total,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireUpsertResponse {
    Wrapped { data: WireCustomer },
    Bare(WireCustomer),
}

/// Talks to the customer REST API.
#[derive(Debug)]
pub struct HttpRosterSource {
    client: ApiClient,
}

impl HttpRosterSource {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RosterSource for HttpRosterSource {
    async fn fetch_customer_page(
        &self,
        store_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<CustomerPage, SourceError> {
        let query = [
            ("storeId", store_id.to_string()),
            ("page", page.to_string()),
            ("limit", page_size.to_string()),
        ];
        let wire: WirePage = self.client.get_json(CUSTOMERS_PATH, &query).await?;
        Ok(wire.into_page())
    }

    async fn upsert_customer(&self, payload: &UpsertCustomer) -> Result<CustomerRecord, SourceError> {
        let response: WireUpsertResponse = self.client.post_json(UPSERT_PATH, payload).await?;
        let wire = match response {
            WireUpsertResponse::Wrapped { data } => data,
            WireUpsertResponse::Bare(wire) => wire,
        };
        Ok(wire.into_record())
    }
}

/// Roster file used by fixture-backed runs and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterFixture {
    pub store_id: String,
    #[serde(default)]
    pub customers: Vec<WireCustomer>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_roster_fixture(path: impl AsRef<Path>) -> Result<RosterFixture> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// In-memory roster that behaves like the remote API, with knobs for failure
/// injection and call accounting.
#[derive(Debug, Default)]
pub struct FixtureRosterSource {
    store_id: String,
    customers: Mutex<Vec<CustomerRecord>>,
    failing_phones: HashSet<PhoneKey>,
    failing_pages: HashSet<usize>,
    reported_total: Option<usize>,
    upsert_latency: Option<Duration>,
    page_calls: AtomicUsize,
    upsert_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl FixtureRosterSource {
    pub fn new(store_id: impl Into<String>, customers: Vec<CustomerRecord>) -> Self {
        Self {
            store_id: store_id.into(),
            customers: Mutex::new(customers),
            ..Default::default()
        }
    }

    pub fn from_fixture(fixture: RosterFixture) -> Self {
        let customers = fixture
            .customers
            .into_iter()
            .map(WireCustomer::into_record)
            .collect();
        Self::new(fixture.store_id, customers)
    }

    pub fn from_fixture_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_fixture(load_roster_fixture(path)?))
    }

    /// Upserts for this phone are rejected with a validation error.
    pub fn fail_upserts_for(mut self, phone: &str) -> Self {
        self.failing_phones.insert(PhoneKey::normalize(phone));
        self
    }

    /// Fetching this 1-based page fails with a 503.
    pub fn fail_page(mut self, page: usize) -> Self {
        self.failing_pages.insert(page);
        self
    }

    /// Report this total instead of the true roster size.
    pub fn with_reported_total(mut self, total: usize) -> Self {
        self.reported_total = Some(total);
        self
    }

    pub fn with_upsert_latency(mut self, latency: Duration) -> Self {
        self.upsert_latency = Some(latency);
        self
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn network_calls(&self) -> usize {
        self.page_calls() + self.upsert_calls()
    }

    pub async fn customers(&self) -> Vec<CustomerRecord> {
        self.customers.lock().await.clone()
    }

    fn belongs_to(&self, record: &CustomerRecord, store_id: &str) -> bool {
        record.stores.iter().any(|s| s == store_id)
            || (record.stores.is_empty() && store_id == self.store_id)
    }
}

#[async_trait]
impl RosterSource for FixtureRosterSource {
    async fn fetch_customer_page(
        &self,
        store_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<CustomerPage, SourceError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_pages.contains(&page) {
            return Err(SourceError::Rejected {
                message: format!("page {page} unavailable"),
                detail: Some("503 Service Unavailable".to_string()),
            });
        }

        let customers = self.customers.lock().await;
        let in_store: Vec<&CustomerRecord> = customers
            .iter()
            .filter(|c| self.belongs_to(c, store_id))
            .collect();
        let start = page.saturating_sub(1).saturating_mul(page_size);
        let data = in_store
            .iter()
            .skip(start)
            .take(page_size)
            .map(|c| (*c).clone())
            .collect();
        Ok(CustomerPage {
            data,
            total: Some(self.reported_total.unwrap_or(in_store.len())),
        })
    }

    async fn upsert_customer(&self, payload: &UpsertCustomer) -> Result<CustomerRecord, SourceError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.upsert_latency {
            tokio::time::sleep(latency).await;
        }

        let key = PhoneKey::normalize(&payload.phone_number);
        if key.is_empty() {
            return Err(SourceError::Rejected {
                message: "validation failed".to_string(),
                detail: Some("phoneNumber is required".to_string()),
            });
        }
        if self.failing_phones.contains(&key) {
            return Err(SourceError::Rejected {
                message: "validation failed".to_string(),
                detail: Some(format!("phoneNumber {} rejected by server", payload.phone_number)),
            });
        }

        // Upsert is keyed by phone within the payload's stores, so every
        // duplicate sharing that phone takes the write.
        let mut customers = self.customers.lock().await;
        let mut updated: Option<CustomerRecord> = None;
        for record in customers.iter_mut().filter(|c| {
            c.phone_key() == key && payload.stores.iter().any(|s| c.stores.contains(s))
        }) {
            record.first_name = payload.first_name.clone();
            record.country_code = Some(payload.country_code.clone());
            record.active = payload.active;
            updated.get_or_insert_with(|| record.clone());
        }
        let record = match updated {
            Some(record) => record,
            None => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                let record = CustomerRecord {
                    id: format!("fixture-new-{n}"),
                    phone_number: payload.phone_number.clone(),
                    first_name: payload.first_name.clone(),
                    country_code: Some(payload.country_code.clone()),
                    stores: payload.stores.clone(),
                    active: payload.active,
                };
                customers.push(record.clone());
                record
            }
        };
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, phone: &str) -> CustomerRecord {
        CustomerRecord {
            id: id.into(),
            phone_number: phone.into(),
            first_name: "Test".into(),
            country_code: None,
            stores: vec!["s1".into()],
            active: true,
        }
    }

    #[test]
    fn wire_customer_resolves_first_non_empty_id() {
        let wire: WireCustomer = serde_json::from_value(serde_json::json!({
            "id": "",
            "_id": "64f0c0ffee",
            "customerId": 99,
            "phone": "555-123-4567",
            "isActive": false,
            "countryCode": 1,
            "stores": ["s1", {"_id": "s2"}, {"name": "no id"}]
        }))
        .expect("wire");
        let record = wire.into_record();
        assert_eq!(record.id, "64f0c0ffee");
        assert_eq!(record.phone_number, "555-123-4567");
        assert!(!record.active);
        assert_eq!(record.country_code.as_deref(), Some("1"));
        assert_eq!(record.stores, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn wire_customer_numeric_id_and_default_active() {
        let wire: WireCustomer = serde_json::from_value(serde_json::json!({
            "customerId": 42,
            "phoneNumber": "15551234567"
        }))
        .expect("wire");
        let record = wire.into_record();
        assert_eq!(record.id, "42");
        assert!(record.active);
        assert!(record.stores.is_empty());
    }

    #[test]
    fn wire_page_accepts_string_total_and_aliases() {
        let page: WirePage = serde_json::from_value(serde_json::json!({
            "customers": [{"id": "a", "phone": "1"}],
            "count": "17"
        }))
        .expect("page");
        let page = page.into_page();
        assert_eq!(page.total, Some(17));
        assert_eq!(page.data.len(), 1);
    }

    #[test]
    fn upsert_response_accepts_wrapped_and_bare_shapes() {
        let wrapped: WireUpsertResponse =
            serde_json::from_value(serde_json::json!({"data": {"id": "x", "active": false}}))
                .expect("wrapped");
        assert!(matches!(wrapped, WireUpsertResponse::Wrapped { .. }));

        let bare: WireUpsertResponse =
            serde_json::from_value(serde_json::json!({"id": "x", "active": false})).expect("bare");
        assert!(matches!(bare, WireUpsertResponse::Bare(_)));
    }

    #[tokio::test]
    async fn fixture_source_paginates_and_counts_calls() {
        let customers = (0..7)
            .map(|i| record(&format!("c{i}"), &format!("55500000{i:02}")))
            .collect();
        let source = FixtureRosterSource::new("s1", customers);

        let first = source.fetch_customer_page("s1", 1, 3).await.expect("page 1");
        let third = source.fetch_customer_page("s1", 3, 3).await.expect("page 3");
        assert_eq!(first.data.len(), 3);
        assert_eq!(first.total, Some(7));
        assert_eq!(third.data.len(), 1);
        assert_eq!(third.data[0].id, "c6");
        assert_eq!(source.page_calls(), 2);

        let other_store = source.fetch_customer_page("s2", 1, 3).await.expect("other");
        assert!(other_store.data.is_empty());
    }

    #[tokio::test]
    async fn fixture_source_upserts_by_phone_and_injects_failures() {
        let source = FixtureRosterSource::new("s1", vec![record("c1", "555-123-4567"), record("c2", "5550001111")])
            .fail_upserts_for("(555) 000-1111");

        let ok = source
            .upsert_customer(&UpsertCustomer::from_record(&record("c1", "555-123-4567"), false))
            .await
            .expect("upsert");
        assert_eq!(ok.id, "c1");
        assert!(!ok.active);

        let err = source
            .upsert_customer(&UpsertCustomer::from_record(&record("c2", "5550001111"), false))
            .await
            .expect_err("injected");
        assert!(err.detail().unwrap_or_default().contains("rejected"));
        assert_eq!(source.upsert_calls(), 2);

        let stored = source.customers().await;
        assert!(stored.iter().find(|c| c.id == "c2").expect("c2").active);
    }
}
