//! Runtime settings updates.

use std::collections::HashMap;

use tracing::info;

use crate::config::DynamicConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::service::DocflowService;

impl DocflowService {
    /// Current effective dynamic settings
    pub fn settings(&self) -> HashMap<String, serde_json::Value> {
        self.runtime_config.dynamic().to_key_value_map()
    }

    /// Persist setting overrides and hot-reload the dynamic config.
    ///
    /// Null values remove an override and restore the default.
    pub fn update_settings(
        &self,
        updates: HashMap<String, serde_json::Value>,
    ) -> ServiceResult<HashMap<String, serde_json::Value>> {
        let valid_keys = DynamicConfig::valid_keys();
        let mut unknown: Vec<&str> = updates
            .keys()
            .map(String::as_str)
            .filter(|key| !valid_keys.contains(key))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(ServiceError::InvalidRequest {
                message: format!("Unknown setting keys: {}", unknown.join(", ")),
            });
        }

        let keys: Vec<String> = updates.keys().cloned().collect();

        // Persist to DB
        self.db.set_settings(updates)?;

        // Reload config from DB
        self.runtime_config.reload_from_db(&self.db)?;

        info!(keys = ?keys, "Settings updated");

        Ok(self.settings())
    }
}
