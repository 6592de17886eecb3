//! Core domain model for BPRE: phone keys, roster records and batch reports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bpre-core";

/// Country code submitted on upserts when the roster record carries none.
pub const DEFAULT_COUNTRY_CODE: &str = "1";

/// Canonical digits-only form of a phone number used for equality comparisons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct PhoneKey(String);

impl PhoneKey {
    /// Strips every non-digit and reduces an 11-digit `1XXXXXXXXXX` to its
    /// trailing ten digits. Other lengths pass through unmodified.
    pub fn normalize(text: &str) -> Self {
        let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() == 11 && digits.starts_with('1') {
            return Self(digits[1..].to_string());
        }
        Self(digits)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PhoneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PhoneKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Read-only snapshot of one customer as held by the remote roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRecord {
    pub id: String,
    pub phone_number: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub stores: Vec<String>,
    pub active: bool,
}

impl CustomerRecord {
    pub fn phone_key(&self) -> PhoneKey {
        PhoneKey::normalize(&self.phone_number)
    }
}

/// One page of the paginated roster read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CustomerPage {
    pub data: Vec<CustomerRecord>,
    /// Total reported by the server, when it reports one.
    pub total: Option<usize>,
}

/// Full field set for the upsert write path. The backend has no partial
/// update for customers, so every required field is resubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertCustomer {
    pub phone_number: String,
    pub first_name: String,
    pub country_code: String,
    pub stores: Vec<String>,
    pub active: bool,
}

impl UpsertCustomer {
    pub fn from_record(record: &CustomerRecord, active: bool) -> Self {
        let country_code = record
            .country_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_COUNTRY_CODE)
            .to_string();
        Self {
            phone_number: record.phone_number.clone(),
            first_name: record.first_name.clone(),
            country_code,
            stores: record.stores.clone(),
            active,
        }
    }
}

/// Which state change a session applies to matched customers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchIntent {
    #[default]
    Deactivate,
    Reactivate,
}

impl BatchIntent {
    /// The `active` value written to every target.
    pub fn target_active(self) -> bool {
        matches!(self, BatchIntent::Reactivate)
    }

    /// Whether a record is still waiting for this intent to be applied.
    pub fn is_actionable(self, record: &CustomerRecord) -> bool {
        record.active != self.target_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchIntent::Deactivate => "deactivate",
            BatchIntent::Reactivate => "reactivate",
        }
    }
}

impl std::str::FromStr for BatchIntent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deactivate" => Ok(BatchIntent::Deactivate),
            "reactivate" => Ok(BatchIntent::Reactivate),
            other => Err(format!("unknown intent `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationSummary {
    pub total_csv: usize,
    pub found: usize,
    pub not_found: usize,
    /// Size of the union of matched customer ids, not the per-key sum.
    pub to_deactivate_unique_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProgressState {
    pub done: usize,
    pub total: usize,
}

impl ProgressState {
    pub fn is_finished(&self) -> bool {
        self.done >= self.total
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub customer_id: String,
    pub phone_number: String,
    pub message: String,
    /// Server-reported detail, when the backend returned one.
    pub detail: Option<String>,
}

/// Final outcome of one executed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub session_id: Uuid,
    pub store_id: String,
    pub intent: BatchIntent,
    pub upload_sha256: String,
    pub summary: ReconciliationSummary,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<BatchFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    pub fn summary_line(&self) -> String {
        format!("succeeded: {}, failed: {}", self.succeeded, self.failed)
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}
