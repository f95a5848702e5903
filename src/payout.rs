//! Payout Calculator
//!
//! Commission rule: `floor(subtotal * rate)`, raised to the mounting floor for
//! mounting work, then bounded below by the minimum payout and above by
//! `subtotal * max_payout_pct`. The cap wins when the two bounds cross.

use serde::Serialize;

use crate::config::PayoutPolicy;
use crate::types::JobRecord;

/// Per-unit floor for mounting jobs.
pub const MOUNT_FLOOR_PER_UNIT: f64 = 45.0;

/// Round to cents.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn floor2(value: f64) -> f64 {
    (value * 100.0).floor() / 100.0
}

fn is_mounting(hint: &str) -> bool {
    hint.to_ascii_lowercase().contains("mount")
}

impl PayoutPolicy {
    /// Bounded commission for `subtotal`. Non-positive subtotals pay nothing.
    ///
    /// A `quantity_hint` of 0 counts as a single unit.
    pub fn compute_payout(&self, subtotal: f64, service_hint: &str, quantity_hint: u32) -> f64 {
        if !subtotal.is_finite() || subtotal <= 0.0 {
            return 0.0;
        }
        let units = f64::from(quantity_hint.max(1));
        let mut base = (subtotal * self.rate).floor();
        let mount_floor = MOUNT_FLOOR_PER_UNIT * units;
        if base < mount_floor && is_mounting(service_hint) {
            base = mount_floor;
        }

        let cap = subtotal * self.max_payout_pct;
        let amount = base.max(self.min_payout);
        if amount > cap {
            floor2(cap)
        } else {
            round2(amount)
        }
    }
}

/// Where the payout amount came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutSource {
    /// Pre-computed value stored on the job.
    Stored,
    LineItems,
    OrderSubtotal,
    OrderTotal,
    /// Nothing to compute from; amount is zero.
    Unpriced,
}

/// How a payout amount was derived; snapshotted into ledger metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutDerivation {
    pub amount: f64,
    pub source: PayoutSource,
    /// Subtotal the calculator ran on, when it ran.
    pub basis: Option<f64>,
    pub service_hint: String,
    pub quantity_hint: u32,
    pub rate: f64,
    pub min_payout: f64,
    pub max_payout_pct: f64,
}

/// Reconstructed calculator inputs for a job without a stored payout.
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutInputs {
    pub subtotal: Option<f64>,
    pub source: PayoutSource,
    pub service_hint: String,
    pub quantity_hint: u32,
}

impl PayoutInputs {
    /// Line items first, then order subtotal, then order total.
    pub fn from_job(job: &JobRecord) -> Self {
        let items = job.line_items();

        let mut hint_parts: Vec<String> = job.service_type().into_iter().collect();
        hint_parts.extend(items.iter().map(|i| i.name.clone()).filter(|n| !n.is_empty()));
        let service_hint = hint_parts.join(" ");

        let mounted: f64 = items
            .iter()
            .filter(|i| is_mounting(&i.name))
            .map(|i| i.quantity.max(0.0))
            .sum();
        let quantity_hint = if mounted >= 1.0 {
            mounted.round() as u32
        } else {
            1
        };

        let item_totals: Vec<f64> = items
            .iter()
            .filter_map(|i| i.total())
            .filter(|t| t.is_finite())
            .collect();
        let from_items = (!item_totals.is_empty())
            .then(|| item_totals.iter().sum::<f64>())
            .filter(|s| *s > 0.0);

        let (subtotal, source) = match from_items {
            Some(sum) => (Some(sum), PayoutSource::LineItems),
            None => match job.order_subtotal() {
                Some(s) => (Some(s), PayoutSource::OrderSubtotal),
                None => match job.order_total() {
                    Some(t) => (Some(t), PayoutSource::OrderTotal),
                    None => (None, PayoutSource::Unpriced),
                },
            },
        };

        Self {
            subtotal,
            source,
            service_hint,
            quantity_hint,
        }
    }
}

/// Stored payout when present and finite, otherwise the calculator fallback.
pub fn derive_payout(policy: &PayoutPolicy, job: &JobRecord) -> PayoutDerivation {
    let inputs = PayoutInputs::from_job(job);
    let (amount, source, basis) = match job.stored_payout() {
        Some(stored) => (round2(stored), PayoutSource::Stored, None),
        None => {
            let subtotal = inputs.subtotal.unwrap_or(0.0);
            (
                policy.compute_payout(subtotal, &inputs.service_hint, inputs.quantity_hint),
                inputs.source,
                inputs.subtotal,
            )
        }
    };
    PayoutDerivation {
        amount,
        source,
        basis,
        service_hint: inputs.service_hint,
        quantity_hint: inputs.quantity_hint,
        rate: policy.rate,
        min_payout: policy.min_payout,
        max_payout_pct: policy.max_payout_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AssignmentsTable, JobsTable, SchemaDescriptor};
    use crate::store::{row_of, Row};
    use proptest::prelude::*;
    use serde_json::json;

    fn policy() -> PayoutPolicy {
        PayoutPolicy::default()
    }

    fn job(row: Row) -> JobRecord {
        let schema = SchemaDescriptor {
            jobs: JobsTable {
                table: "jobs".into(),
                id_column: "id".into(),
                status_column: Some("status".into()),
                columns: None,
            },
            assignments: AssignmentsTable {
                table: "job_assignments".into(),
                job_column: "job_id".into(),
                pro_id_column: Some("pro_id".into()),
                pro_email_column: None,
                state_column: None,
                columns: None,
            },
        };
        JobRecord::from_row(&schema, row).unwrap()
    }

    #[test]
    fn test_rate_applies_above_minimum() {
        // floor(200 * 0.35) = 70, cap 90
        assert_eq!(policy().compute_payout(200.0, "Plumbing", 1), 70.0);
    }

    #[test]
    fn test_minimum_payout() {
        // floor(80 * 0.35) = 28 → 35, cap 36
        assert_eq!(policy().compute_payout(80.0, "Cleaning", 1), 35.0);
    }

    #[test]
    fn test_cap_wins_over_minimum() {
        // min 35 but cap is 50 * 0.45 = 22.5
        assert_eq!(policy().compute_payout(50.0, "Cleaning", 1), 22.5);
    }

    #[test]
    fn test_mounting_floor() {
        // floor(250 * 0.35) = 87 < 45 * 2 = 90, cap 112.5
        assert_eq!(policy().compute_payout(250.0, "TV MOUNTING", 2), 90.0);
        assert_eq!(policy().compute_payout(250.0, "Drywall", 2), 87.0);
        // Floor still capped: 45 * 3 = 135 > 250 * 0.45
        assert_eq!(policy().compute_payout(250.0, "mount", 3), 112.5);
    }

    #[test]
    fn test_zero_and_invalid_subtotals() {
        assert_eq!(policy().compute_payout(0.0, "mount", 1), 0.0);
        assert_eq!(policy().compute_payout(-10.0, "mount", 1), 0.0);
        assert_eq!(policy().compute_payout(f64::NAN, "mount", 1), 0.0);
    }

    #[test]
    fn test_zero_quantity_counts_as_one() {
        assert_eq!(
            policy().compute_payout(120.0, "mount", 0),
            policy().compute_payout(120.0, "mount", 1)
        );
    }

    #[test]
    fn test_derive_prefers_stored_payout() {
        let j = job(row_of([
            ("id", json!("j1")),
            ("pro_payout", json!("61.239")),
            ("subtotal", json!(500)),
        ]));
        let d = derive_payout(&policy(), &j);
        assert_eq!(d.amount, 61.24);
        assert_eq!(d.source, PayoutSource::Stored);
        assert_eq!(d.basis, None);
    }

    #[test]
    fn test_derive_from_line_items() {
        let j = job(row_of([
            ("id", json!("j1")),
            ("service_type", json!("Install")),
            (
                "line_items",
                json!([
                    {"name": "TV Mount", "quantity": 2, "unit_price": 60},
                    {"name": "Cable hide", "line_total": 30, "quantity": 3, "unit_price": 99}
                ]),
            ),
            ("subtotal", json!(1000)),
        ]));
        let d = derive_payout(&policy(), &j);
        // items sum 150; floor(52.5) = 52 < 90 mount floor; cap 67.5
        assert_eq!(d.source, PayoutSource::LineItems);
        assert_eq!(d.basis, Some(150.0));
        assert_eq!(d.quantity_hint, 2);
        assert_eq!(d.service_hint, "Install TV Mount Cable hide");
        assert_eq!(d.amount, 67.5);
    }

    #[test]
    fn test_derive_falls_back_to_subtotal_then_total() {
        let j = job(row_of([("id", json!("j1")), ("subtotal", json!(200))]));
        let d = derive_payout(&policy(), &j);
        assert_eq!(d.source, PayoutSource::OrderSubtotal);
        assert_eq!(d.amount, 70.0);

        let j = job(row_of([("id", json!("j1")), ("total", json!(300))]));
        let d = derive_payout(&policy(), &j);
        assert_eq!(d.source, PayoutSource::OrderTotal);
        assert_eq!(d.amount, 105.0);

        let j = job(row_of([("id", json!("j1"))]));
        let d = derive_payout(&policy(), &j);
        assert_eq!(d.source, PayoutSource::Unpriced);
        assert_eq!(d.amount, 0.0);
    }

    proptest! {
        #[test]
        fn prop_payout_within_bounds(
            subtotal in 0.0f64..100_000.0,
            qty in 0u32..10,
            mount in any::<bool>()
        ) {
            let p = policy();
            let hint = if mount { "wall mount" } else { "repair" };
            let payout = p.compute_payout(subtotal, hint, qty);
            if subtotal <= 0.0 {
                prop_assert_eq!(payout, 0.0);
            } else {
                prop_assert!(payout <= subtotal * p.max_payout_pct + 1e-9);
                if subtotal * p.max_payout_pct >= p.min_payout {
                    prop_assert!(payout >= p.min_payout);
                }
            }
        }

        #[test]
        fn prop_mounting_floor_holds_under_cap(subtotal in 1.0f64..10_000.0, qty in 1u32..6) {
            let p = policy();
            let payout = p.compute_payout(subtotal, "Mounting", qty);
            let floor = MOUNT_FLOOR_PER_UNIT * f64::from(qty);
            if (subtotal * p.rate).floor() < floor {
                let cap = subtotal * p.max_payout_pct;
                prop_assert!(payout >= floor.min(cap) - 0.01);
            }
        }
    }
}
