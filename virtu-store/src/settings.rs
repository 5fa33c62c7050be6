use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::Row;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use virtu_shared::models::kind::ProductKind;
use virtu_shared::PlatformSettings;

use crate::database::DbClient;

/// Versioned, hot-reloadable view of the `platform_settings` table.
///
/// `snapshot()` is cheap (Arc clone); services take one snapshot per
/// operation and never observe a mid-flight change. `update()` writes
/// through to the database and refreshes immediately, so a provider
/// disabled by an operator stops being selected on the next operation.
pub struct SettingsCache {
    db: DbClient,
    defaults: PlatformSettings,
    current: RwLock<Arc<PlatformSettings>>,
    version: AtomicU64,
}

impl SettingsCache {
    pub fn new(db: DbClient, defaults: PlatformSettings) -> Self {
        let initial = Arc::new(defaults.clone());
        Self {
            db,
            defaults,
            current: RwLock::new(initial),
            version: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> Arc<PlatformSettings> {
        self.current.read().unwrap().clone()
    }

    /// Re-read every settings row and swap in a new snapshot.
    pub async fn refresh(&self) -> Result<Arc<PlatformSettings>, sqlx::Error> {
        let rows = sqlx::query("SELECT setting_key, setting_value FROM platform_settings")
            .fetch_all(&self.db.pool)
            .await?;

        let mut settings = self.defaults.clone();

        for row in rows {
            let key: String = row.get("setting_key");
            let value: Value = row.get("setting_value");

            // Expected format: {"value": <number/string/bool>}
            let Some(v) = value.get("value") else {
                warn!(key, "settings row missing value wrapper, skipping");
                continue;
            };
            apply_setting(&mut settings, &key, v);
        }

        settings.version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(settings);
        *self.current.write().unwrap() = snapshot.clone();
        info!(version = snapshot.version, "platform settings refreshed");
        Ok(snapshot)
    }

    /// Upsert one settings row, then refresh so the change is visible to the
    /// next snapshot.
    pub async fn update(&self, key: &str, value: Value) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO platform_settings (setting_key, setting_value, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (setting_key)
             DO UPDATE SET setting_value = $2, updated_at = NOW()",
        )
        .bind(key)
        .bind(serde_json::json!({ "value": value }))
        .execute(&self.db.pool)
        .await?;

        self.refresh().await?;
        Ok(())
    }
}

fn apply_setting(settings: &mut PlatformSettings, key: &str, v: &Value) {
    match key {
        "pricing_markup_percentage" => {
            if let Some(d) = as_decimal(v) {
                settings.pricing.markup_percentage = d;
            }
        }
        "pricing_min_price" => {
            if let Some(d) = as_decimal(v) {
                settings.pricing.min_price = d;
            }
        }
        "pricing_platform_fee" => {
            if let Some(d) = as_decimal(v) {
                settings.pricing.platform_fee = d;
            }
        }
        "pricing_exchange_rate" => {
            if let Some(d) = as_decimal(v) {
                settings.pricing.exchange_rate = d;
            }
        }
        "max_open_orders" => {
            if let Some(n) = v.as_i64() {
                settings.max_open_orders = n;
            }
        }
        "commission_rate" => {
            if let Some(d) = as_decimal(v) {
                settings.commission.rate = d;
            }
        }
        "commission_max_purchases" => {
            if let Some(n) = v.as_i64() {
                settings.commission.max_purchases = n;
            }
        }
        "fulfillment_timeout_secs" => {
            if let Some(n) = v.as_u64() {
                settings.fulfillment_timeout_secs = n;
            }
        }
        "pending_grace_minutes" => {
            if let Some(n) = v.as_i64() {
                settings.pending_grace_minutes = n;
            }
        }
        _ => {
            // Per-provider and per-kind keys carry the subject in the key name.
            if let Some(identifier) = key.strip_prefix("provider_enabled_") {
                if let Some(b) = v.as_bool() {
                    settings.provider_enabled.insert(identifier.to_string(), b);
                }
            } else if let Some(kind) = key.strip_prefix("min_purchase_") {
                match (ProductKind::from_str(kind), as_decimal(v)) {
                    (Ok(kind), Some(d)) => {
                        settings.min_purchase.insert(kind, d);
                    }
                    _ => warn!(key, "unparseable min_purchase setting"),
                }
            } else if let Some(kind) = key.strip_prefix("order_ttl_minutes_") {
                match (ProductKind::from_str(kind), v.as_i64()) {
                    (Ok(kind), Some(n)) => {
                        settings.order_ttl_minutes.insert(kind, n);
                    }
                    _ => warn!(key, "unparseable order_ttl setting"),
                }
            } else {
                warn!(key, "unknown platform setting, ignoring");
            }
        }
    }
}

fn as_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Number(_) => v.as_f64().and_then(Decimal::from_f64),
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_setting_overlays_defaults() {
        let mut settings = PlatformSettings::default();

        apply_setting(
            &mut settings,
            "pricing_exchange_rate",
            &serde_json::json!(1650.0),
        );
        apply_setting(&mut settings, "max_open_orders", &serde_json::json!(5));
        apply_setting(
            &mut settings,
            "provider_enabled_alpha",
            &serde_json::json!(false),
        );
        apply_setting(
            &mut settings,
            "min_purchase_TEMP_NUMBER",
            &serde_json::json!("250"),
        );

        assert_eq!(settings.pricing.exchange_rate, Decimal::from(1650));
        assert_eq!(settings.max_open_orders, 5);
        assert!(!settings.is_provider_enabled("alpha"));
        assert!(settings.is_provider_enabled("beta"));
        assert_eq!(
            settings.min_purchase_for(ProductKind::TempNumber),
            Decimal::from(250)
        );
    }

    #[test]
    fn test_unknown_key_is_ignored() {
        let mut settings = PlatformSettings::default();
        apply_setting(&mut settings, "bogus", &serde_json::json!(42));
        assert_eq!(settings.max_open_orders, 10);
    }
}
