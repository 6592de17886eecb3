//! Intersects uploaded phone keys with the roster index.

use std::collections::HashSet;

use bpre_core::{PhoneKey, ReconciliationSummary};
use serde::Serialize;

use crate::roster::PhoneIndex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct ReconciliationPlan {
    pub summary: ReconciliationSummary,
    /// Distinct customer ids in first-matched order.
    pub target_ids: Vec<String>,
    pub unmatched: Vec<PhoneKey>,
}

/// Pure function of its inputs; no I/O.
pub fn plan(phone_keys: &[PhoneKey], index: &PhoneIndex) -> ReconciliationPlan {
    let mut found = 0usize;
    let mut not_found = 0usize;
    let mut seen: HashSet<&str> = HashSet::new();
    let mut target_ids = Vec::new();
    let mut unmatched = Vec::new();

    for key in phone_keys {
        match index.get(key) {
            Some(ids) => {
                found += 1;
                for id in ids {
                    if seen.insert(id.as_str()) {
                        target_ids.push(id.clone());
                    }
                }
            }
            None => {
                not_found += 1;
                unmatched.push(key.clone());
            }
        }
    }

    ReconciliationPlan {
        summary: ReconciliationSummary {
            total_csv: phone_keys.len(),
            found,
            not_found,
            to_deactivate_unique_count: target_ids.len(),
        },
        target_ids,
        unmatched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpre_core::CustomerRecord;

    fn customer(id: &str, phone: &str) -> CustomerRecord {
        CustomerRecord {
            id: id.into(),
            phone_number: phone.into(),
            first_name: String::new(),
            country_code: None,
            stores: vec![],
            active: true,
        }
    }

    fn keys(raw: &[&str]) -> Vec<PhoneKey> {
        raw.iter().map(|s| PhoneKey::normalize(s)).collect()
    }

    #[test]
    fn counts_add_up_to_total() {
        let index = PhoneIndex::from_records(&[customer("a", "5550000001"), customer("b", "5550000002")]);
        let result = plan(&keys(&["5550000001", "5550000003", "5550000002", "5550000004"]), &index);
        assert_eq!(result.summary.total_csv, 4);
        assert_eq!(result.summary.found, 2);
        assert_eq!(result.summary.not_found, 2);
        assert_eq!(
            result.summary.found + result.summary.not_found,
            result.summary.total_csv
        );
        assert_eq!(result.target_ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(result.unmatched, keys(&["5550000003", "5550000004"]));
    }

    #[test]
    fn overlapping_matches_count_the_union() {
        // Two index keys resolving to the same customer id "X".
        let records = [
            customer("X", "5550000001"),
            customer("X", "5550000002"),
            customer("Y", "5550000002"),
        ];
        let index = PhoneIndex::from_records(&records);
        let result = plan(&keys(&["5550000001", "5550000002"]), &index);
        assert_eq!(result.summary.found, 2);
        // Naive per-key sum would be 3.
        assert_eq!(result.summary.to_deactivate_unique_count, 2);
        assert_eq!(result.target_ids, vec!["X".to_string(), "Y".to_string()]);
    }

    #[test]
    fn shared_phone_targets_every_holder() {
        let records = [customer("a", "555-111-2222"), customer("b", "15551112222")];
        let index = PhoneIndex::from_records(&records);
        let result = plan(&keys(&["5551112222"]), &index);
        assert_eq!(result.summary.found, 1);
        assert_eq!(result.summary.to_deactivate_unique_count, 2);
    }

    #[test]
    fn empty_inputs_produce_empty_plan() {
        let result = plan(&[], &PhoneIndex::default());
        assert_eq!(result, ReconciliationPlan::default());
    }
}
