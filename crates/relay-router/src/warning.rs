//! In-memory warning store surfaced to the control plane.
//!
//! Warnings are structured `{code, severity, message, source}` records.
//! The store is bounded, supports acknowledgement, and ages out old
//! entries so a long-running router does not accumulate stale noise.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use relay_common::{Warning, WarningCode, WarningSeverity};

#[derive(Debug, Clone)]
pub struct WarningServiceConfig {
    pub max_warnings: usize,
    /// Warnings older than this are dropped by `cleanup`.
    pub max_warning_age_hours: i64,
    /// Warnings older than this are auto-acknowledged by `cleanup`.
    pub auto_acknowledge_hours: i64,
}

impl Default for WarningServiceConfig {
    fn default() -> Self {
        Self {
            max_warnings: 1000,
            max_warning_age_hours: 24,
            auto_acknowledge_hours: 8,
        }
    }
}

pub struct WarningService {
    warnings: RwLock<HashMap<String, Warning>>,
    config: WarningServiceConfig,
}

impl WarningService {
    pub fn new(config: WarningServiceConfig) -> Self {
        Self {
            warnings: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn raise(
        &self,
        code: WarningCode,
        severity: WarningSeverity,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> String {
        let warning = Warning::new(code, severity, message.into(), source.into());
        let id = warning.id.clone();

        match severity {
            WarningSeverity::Critical => warn!(
                code = %code,
                source = %warning.source,
                "{}", warning.message
            ),
            WarningSeverity::Warn => debug!(
                code = %code,
                source = %warning.source,
                "{}", warning.message
            ),
        }

        let mut warnings = self.warnings.write();
        if warnings.len() >= self.config.max_warnings {
            Self::evict_oldest(&mut warnings);
        }
        warnings.insert(id.clone(), warning);
        id
    }

    pub fn all(&self) -> Vec<Warning> {
        self.warnings.read().values().cloned().collect()
    }

    pub fn by_code(&self, code: WarningCode) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.code == code)
            .cloned()
            .collect()
    }

    pub fn unacknowledged(&self) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged)
            .cloned()
            .collect()
    }

    pub fn critical_count(&self) -> usize {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == WarningSeverity::Critical && !w.acknowledged)
            .count()
    }

    pub fn count(&self) -> usize {
        self.warnings.read().len()
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        let mut warnings = self.warnings.write();
        if let Some(warning) = warnings.get_mut(id) {
            warning.acknowledged = true;
            warning.acknowledged_at = Some(Utc::now());
            true
        } else {
            false
        }
    }

    /// Periodic maintenance: auto-acknowledge aging warnings, drop ancient ones.
    pub fn cleanup(&self) {
        let ack_cutoff = self.config.auto_acknowledge_hours * 60;
        let drop_cutoff = self.config.max_warning_age_hours * 60;
        let now = Utc::now();

        let mut warnings = self.warnings.write();
        let before = warnings.len();

        for warning in warnings.values_mut() {
            if !warning.acknowledged && warning.age_minutes() > ack_cutoff {
                warning.acknowledged = true;
                warning.acknowledged_at = Some(now);
            }
        }
        warnings.retain(|_, w| w.age_minutes() <= drop_cutoff);

        let removed = before - warnings.len();
        if removed > 0 {
            info!(removed = removed, "Dropped aged-out warnings");
        }
    }

    fn evict_oldest(warnings: &mut HashMap<String, Warning>) {
        let to_remove = (warnings.len() / 10).max(1);
        let mut by_age: Vec<_> = warnings
            .iter()
            .map(|(id, w)| (id.clone(), w.created_at))
            .collect();
        by_age.sort_by_key(|(_, created)| *created);

        for (id, _) in by_age.into_iter().take(to_remove) {
            warnings.remove(&id);
        }
    }
}

impl Default for WarningService {
    fn default() -> Self {
        Self::new(WarningServiceConfig::default())
    }
}
