use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::NaiveTime;

use crate::model::Role;

const MAX_DAYS_IN_ADVANCE: u32 = 3650;
const MAX_HOURS_BEFORE: u32 = 24 * 365;

/// Rules applied to reservation requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationPolicy {
    pub max_days_in_advance: u32,
    /// Minimum lead time before the reservation starts. Zero disables the check.
    pub min_hours_before: u32,
    pub max_hours_per_reservation: u32,
    /// Active (pending or approved) reservations per user per Monday-based week.
    pub max_reservations_per_week: u32,
    pub student_require_approval: bool,
    pub professor_require_approval: bool,
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self {
            max_days_in_advance: 30,
            min_hours_before: 0,
            max_hours_per_reservation: 4,
            max_reservations_per_week: 5,
            student_require_approval: true,
            professor_require_approval: true,
        }
    }
}

impl ReservationPolicy {
    pub fn requires_approval(&self, role: Role) -> bool {
        match role {
            Role::Admin => false,
            Role::Professor => self.professor_require_approval,
            Role::Student => self.student_require_approval,
        }
    }
}

/// Service configuration, read from `ROOMWARDEN_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub log_level: String,
    pub log_json: bool,
    pub cache_timeout: Duration,
    pub status_sweep_interval: Duration,
    /// Local wall-clock time of the daily auto-rejection sweep.
    pub auto_reject_at: NaiveTime,
    pub compact_threshold: u64,
    pub policy: ReservationPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| {
            lookup(&format!("ROOMWARDEN_{name}")).filter(|v| !v.trim().is_empty())
        };
        let parsed = |name: &str| -> Result<Option<u64>> {
            get(name).map(|v| parse(name, &v)).transpose()
        };
        let flag = |name: &str, default: bool| -> Result<bool> {
            Ok(get(name).map(|v| parse(name, &v)).transpose()?.unwrap_or(default))
        };
        let small = |name: &str, default: u32| -> Result<u32> {
            Ok(get(name).map(|v| parse(name, &v)).transpose()?.unwrap_or(default))
        };

        let defaults = ReservationPolicy::default();
        let policy = ReservationPolicy {
            max_days_in_advance: small("MAX_DAYS_IN_ADVANCE", defaults.max_days_in_advance)?,
            min_hours_before: small("MIN_HOURS_BEFORE", defaults.min_hours_before)?,
            max_hours_per_reservation: small(
                "MAX_HOURS_PER_RESERVATION",
                defaults.max_hours_per_reservation,
            )?,
            max_reservations_per_week: small(
                "MAX_RESERVATIONS_PER_WEEK",
                defaults.max_reservations_per_week,
            )?,
            student_require_approval: flag(
                "STUDENT_REQUIRE_APPROVAL",
                defaults.student_require_approval,
            )?,
            professor_require_approval: flag(
                "PROFESSOR_REQUIRE_APPROVAL",
                defaults.professor_require_approval,
            )?,
        };
        if !(1..=24).contains(&policy.max_hours_per_reservation) {
            return Err(anyhow!("ROOMWARDEN_MAX_HOURS_PER_RESERVATION must be between 1 and 24"));
        }
        if policy.max_days_in_advance > MAX_DAYS_IN_ADVANCE {
            return Err(anyhow!(
                "ROOMWARDEN_MAX_DAYS_IN_ADVANCE must be at most {MAX_DAYS_IN_ADVANCE}"
            ));
        }
        if policy.min_hours_before > MAX_HOURS_BEFORE {
            return Err(anyhow!("ROOMWARDEN_MIN_HOURS_BEFORE must be at most {MAX_HOURS_BEFORE}"));
        }

        let auto_reject_at = match get("AUTO_REJECT_AT") {
            Some(v) => NaiveTime::parse_from_str(v.trim(), "%H:%M")
                .with_context(|| format!("ROOMWARDEN_AUTO_REJECT_AT: expected HH:MM, got {v:?}"))?,
            None => NaiveTime::from_hms_opt(1, 0, 0).context("default auto-reject time")?,
        };

        let status_sweep_secs = parsed("STATUS_SWEEP_SECS")?.unwrap_or(1800);
        if status_sweep_secs == 0 {
            return Err(anyhow!("ROOMWARDEN_STATUS_SWEEP_SECS must be positive"));
        }

        Ok(Self {
            data_dir: PathBuf::from(get("DATA_DIR").unwrap_or_else(|| "./data".into())),
            metrics_port: get("METRICS_PORT").map(|v| parse("METRICS_PORT", &v)).transpose()?,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            log_json: flag("LOG_JSON", false)?,
            cache_timeout: Duration::from_secs(parsed("CACHE_TIMEOUT_SECS")?.unwrap_or(300)),
            status_sweep_interval: Duration::from_secs(status_sweep_secs),
            auto_reject_at,
            compact_threshold: parsed("COMPACT_THRESHOLD")?.unwrap_or(1000),
            policy,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roomwarden.wal")
    }
}

fn parse<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("ROOMWARDEN_{name}: invalid value {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.log_level, "info");
        assert!(!cfg.log_json);
        assert_eq!(cfg.cache_timeout, Duration::from_secs(300));
        assert_eq!(cfg.status_sweep_interval, Duration::from_secs(1800));
        assert_eq!(cfg.auto_reject_at, NaiveTime::from_hms_opt(1, 0, 0).unwrap());
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.policy, ReservationPolicy::default());
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/roomwarden.wal"));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config(&[
            ("ROOMWARDEN_DATA_DIR", "/var/lib/rooms"),
            ("ROOMWARDEN_METRICS_PORT", "9100"),
            ("ROOMWARDEN_LOG_JSON", "true"),
            ("ROOMWARDEN_AUTO_REJECT_AT", "02:30"),
            ("ROOMWARDEN_MAX_RESERVATIONS_PER_WEEK", "2"),
            ("ROOMWARDEN_STUDENT_REQUIRE_APPROVAL", "false"),
        ])
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/rooms"));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert!(cfg.log_json);
        assert_eq!(cfg.auto_reject_at, NaiveTime::from_hms_opt(2, 30, 0).unwrap());
        assert_eq!(cfg.policy.max_reservations_per_week, 2);
        assert!(!cfg.policy.requires_approval(Role::Student));
        assert!(cfg.policy.requires_approval(Role::Professor));
        assert!(!cfg.policy.requires_approval(Role::Admin));
    }

    #[test]
    fn invalid_values_are_reported_with_the_variable() {
        let err = config(&[("ROOMWARDEN_METRICS_PORT", "ninety")]).unwrap_err();
        assert!(format!("{err:#}").contains("ROOMWARDEN_METRICS_PORT"));

        let err = config(&[("ROOMWARDEN_AUTO_REJECT_AT", "25:00")]).unwrap_err();
        assert!(format!("{err:#}").contains("ROOMWARDEN_AUTO_REJECT_AT"));

        assert!(config(&[("ROOMWARDEN_STATUS_SWEEP_SECS", "0")]).is_err());
    }

    #[test]
    fn policy_values_are_bounded() {
        let err = config(&[("ROOMWARDEN_MAX_DAYS_IN_ADVANCE", "4294967295")]).unwrap_err();
        assert!(err.to_string().contains("ROOMWARDEN_MAX_DAYS_IN_ADVANCE"));
        let err = config(&[("ROOMWARDEN_MAX_HOURS_PER_RESERVATION", "100000000")]).unwrap_err();
        assert!(err.to_string().contains("ROOMWARDEN_MAX_HOURS_PER_RESERVATION"));
        assert!(config(&[("ROOMWARDEN_MIN_HOURS_BEFORE", "9000")]).is_err());

        let cfg = config(&[
            ("ROOMWARDEN_MAX_DAYS_IN_ADVANCE", "3650"),
            ("ROOMWARDEN_MAX_HOURS_PER_RESERVATION", "24"),
            ("ROOMWARDEN_MIN_HOURS_BEFORE", "8760"),
        ])
        .unwrap();
        assert_eq!(cfg.policy.max_days_in_advance, 3650);
        assert_eq!(cfg.policy.max_hours_per_reservation, 24);
    }
}
