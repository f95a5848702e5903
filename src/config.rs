//! Portal configuration
//!
//! Everything is read from the process environment. [`PortalConfig::from_lookup`]
//! takes the lookup as a closure so tests can supply a map instead of mutating
//! global state.

use std::time::Duration;

use tracing::warn;

/// Default commission rate applied to a job subtotal.
pub const DEFAULT_PAYOUT_RATE: f64 = 0.35;
/// Default payout floor.
pub const DEFAULT_MIN_PAYOUT: f64 = 35.0;
/// Default payout cap as a fraction of the subtotal.
pub const DEFAULT_MAX_PAYOUT_PCT: f64 = 0.45;
/// Default lifetime of a discovered schema descriptor.
pub const DEFAULT_SCHEMA_TTL: Duration = Duration::from_secs(300);

/// Commission parameters for the payout calculator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayoutPolicy {
    pub rate: f64,
    pub min_payout: f64,
    pub max_payout_pct: f64,
}

impl Default for PayoutPolicy {
    fn default() -> Self {
        Self {
            rate: DEFAULT_PAYOUT_RATE,
            min_payout: DEFAULT_MIN_PAYOUT,
            max_payout_pct: DEFAULT_MAX_PAYOUT_PCT,
        }
    }
}

/// Explicit table/column names that bypass discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaOverrides {
    pub assignments_table: Option<String>,
    pub assignments_job_column: Option<String>,
    pub assignments_pro_column: Option<String>,
    pub assignments_state_column: Option<String>,
    pub jobs_table: Option<String>,
    pub jobs_id_column: Option<String>,
    pub jobs_status_column: Option<String>,
}

/// Fixed foreign-key values for new dispatch jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceOverrides {
    pub sequence_id: Option<String>,
    pub recipient_id: Option<String>,
    pub step_id: Option<String>,
}

/// Mail provider settings used by the HTTP notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub from: String,
}

/// Top-level configuration of the dispatch core.
#[derive(Debug, Clone, PartialEq)]
pub struct PortalConfig {
    pub payout: PayoutPolicy,
    pub schema: SchemaOverrides,
    pub references: ReferenceOverrides,
    pub schema_ttl: Duration,
    pub pros_table: String,
    pub payouts_table: String,
    pub mail: Option<MailConfig>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            payout: PayoutPolicy::default(),
            schema: SchemaOverrides::default(),
            references: ReferenceOverrides::default(),
            schema_ttl: DEFAULT_SCHEMA_TTL,
            pros_table: "pros".to_string(),
            payouts_table: "pro_payouts".to_string(),
            mail: None,
        }
    }
}

impl PortalConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let defaults = PayoutPolicy::default();
        let payout = PayoutPolicy {
            rate: get("PORTAL_PAYOUT_PERCENT")
                .or_else(|| get("PRO_PAYOUT_PERCENT"))
                .and_then(|v| parse_fraction("PORTAL_PAYOUT_PERCENT", &v))
                .unwrap_or(defaults.rate),
            min_payout: get("PORTAL_MIN_PAYOUT")
                .and_then(|v| parse_number("PORTAL_MIN_PAYOUT", &v))
                .filter(|v| *v >= 0.0)
                .unwrap_or(defaults.min_payout),
            max_payout_pct: get("PORTAL_MAX_PAYOUT_PCT")
                .and_then(|v| parse_fraction("PORTAL_MAX_PAYOUT_PCT", &v))
                .unwrap_or(defaults.max_payout_pct),
        };

        let schema = SchemaOverrides {
            assignments_table: get("PORTAL_ASSIGNMENTS_TABLE"),
            assignments_job_column: get("PORTAL_ASSIGNMENTS_JOB_COLUMN"),
            assignments_pro_column: get("PORTAL_ASSIGNMENTS_PRO_COLUMN"),
            assignments_state_column: get("PORTAL_ASSIGNMENTS_STATE_COLUMN"),
            jobs_table: get("PORTAL_JOBS_TABLE"),
            jobs_id_column: get("PORTAL_JOBS_ID_COLUMN"),
            jobs_status_column: get("PORTAL_JOBS_STATUS_COLUMN"),
        };

        let references = ReferenceOverrides {
            sequence_id: get("DEFAULT_DISPATCH_SEQUENCE_ID"),
            recipient_id: get("DEFAULT_DISPATCH_RECIPIENT_ID"),
            step_id: get("DEFAULT_DISPATCH_STEP_ID"),
        };

        let schema_ttl = get("PORTAL_SCHEMA_CACHE_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SCHEMA_TTL);

        let mail = get("MAIL_API_URL").map(|api_url| MailConfig {
            api_url,
            api_key: get("MAIL_API_KEY"),
            from: get("MAIL_FROM").unwrap_or_else(|| "dispatch@localhost".to_string()),
        });

        Self {
            payout,
            schema,
            references,
            schema_ttl,
            pros_table: get("PORTAL_PROS_TABLE").unwrap_or_else(|| "pros".to_string()),
            payouts_table: get("PORTAL_PAYOUTS_TABLE")
                .unwrap_or_else(|| "pro_payouts".to_string()),
            mail,
        }
    }
}

fn parse_number(key: &str, raw: &str) -> Option<f64> {
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => {
            warn!(key, value = raw, "ignoring non-numeric setting");
            None
        }
    }
}

/// Fractions may be given as `0.35` or as whole percents (`35`).
fn parse_fraction(key: &str, raw: &str) -> Option<f64> {
    let v = parse_number(key, raw)?;
    let v = if v > 1.0 { v / 100.0 } else { v };
    if (0.0..=1.0).contains(&v) && v > 0.0 {
        Some(v)
    } else {
        warn!(key, value = raw, "ignoring out-of-range percentage");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> PortalConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PortalConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]);
        assert_eq!(cfg.payout, PayoutPolicy::default());
        assert_eq!(cfg.schema_ttl, Duration::from_secs(300));
        assert_eq!(cfg.pros_table, "pros");
        assert_eq!(cfg.payouts_table, "pro_payouts");
        assert!(cfg.mail.is_none());
    }

    #[test]
    fn test_payout_percent_aliases_and_whole_percents() {
        let cfg = config(&[("PRO_PAYOUT_PERCENT", "40")]);
        assert!((cfg.payout.rate - 0.40).abs() < 1e-9);

        let cfg = config(&[
            ("PORTAL_PAYOUT_PERCENT", "0.3"),
            ("PRO_PAYOUT_PERCENT", "0.5"),
        ]);
        assert!((cfg.payout.rate - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let cfg = config(&[
            ("PORTAL_MIN_PAYOUT", "lots"),
            ("PORTAL_MAX_PAYOUT_PCT", "250"),
            ("PORTAL_SCHEMA_CACHE_SECS", "-1"),
        ]);
        assert_eq!(cfg.payout.min_payout, DEFAULT_MIN_PAYOUT);
        assert_eq!(cfg.payout.max_payout_pct, DEFAULT_MAX_PAYOUT_PCT);
        assert_eq!(cfg.schema_ttl, DEFAULT_SCHEMA_TTL);
    }

    #[test]
    fn test_overrides_ignore_blank_values() {
        let cfg = config(&[
            ("PORTAL_JOBS_TABLE", "h2s_dispatch_jobs"),
            ("PORTAL_ASSIGNMENTS_TABLE", "   "),
            ("DEFAULT_DISPATCH_STEP_ID", "42"),
        ]);
        assert_eq!(cfg.schema.jobs_table.as_deref(), Some("h2s_dispatch_jobs"));
        assert_eq!(cfg.schema.assignments_table, None);
        assert_eq!(cfg.references.step_id.as_deref(), Some("42"));
    }
}
