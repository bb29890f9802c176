//! Plugin configuration validation against each plugin's JSON-schema.
//!
//! Compiled schemas are cached per plugin name; a plugin's schema does not change for the lifetime
//! of the process, so every route reuses the first compilation.

use dashmap::DashMap;
use jsonschema::JSONSchema;
use serde_json::Value;
use std::sync::Arc;

use crate::core::error::{GatewayError, GatewayResult};

#[derive(Default)]
pub struct SchemaValidator {
    compiled: DashMap<String, Arc<JSONSchema>>,
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("cached", &self.compiled.len())
            .finish()
    }
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `config` against `schema`, reporting every violation at once
    pub fn validate(&self, plugin: &str, schema: &Value, config: &Value) -> GatewayResult<()> {
        let compiled = self.compiled_for(plugin, schema)?;

        let result = compiled.validate(config);
        if let Err(errors) = result {
            let message = errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(GatewayError::SchemaValidation {
                plugin: plugin.to_string(),
                message,
            });
        }

        Ok(())
    }

    fn compiled_for(&self, plugin: &str, schema: &Value) -> GatewayResult<Arc<JSONSchema>> {
        if let Some(compiled) = self.compiled.get(plugin) {
            return Ok(Arc::clone(compiled.value()));
        }

        let compiled = JSONSchema::compile(schema).map_err(|e| {
            GatewayError::plugin(plugin, format!("invalid plugin schema: {}", e))
        })?;
        let compiled = Arc::new(compiled);
        self.compiled
            .insert(plugin.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn cached(&self) -> usize {
        self.compiled.len()
    }
}
