//! Step definition registry
//!
//! Step modules contribute definitions through a [`StepRegistryBuilder`] at
//! startup. The built registry is immutable and shared by `Arc`, so lookups
//! need no synchronization.

use super::context::StepContext;
use crate::error::{FleetError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Executable behaviour of a step type
#[async_trait]
pub trait StepBehavior: Send + Sync {
    async fn execute(&self, ctx: &StepContext) -> Result<()>;
}

pub struct StepDefinition {
    key: String,
    property_keys: Vec<String>,
    behavior: Arc<dyn StepBehavior>,
}

impl StepDefinition {
    pub fn new<B>(key: impl Into<String>, property_keys: &[&str], behavior: B) -> Self
    where
        B: StepBehavior + 'static,
    {
        Self {
            key: key.into(),
            property_keys: property_keys.iter().map(|k| k.to_string()).collect(),
            behavior: Arc::new(behavior),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn property_keys(&self) -> &[String] {
        &self.property_keys
    }

    pub fn declares(&self, property: &str) -> bool {
        self.property_keys.iter().any(|k| k == property)
    }

    pub(crate) fn behavior(&self) -> &Arc<dyn StepBehavior> {
        &self.behavior
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("key", &self.key)
            .field("property_keys", &self.property_keys)
            .finish()
    }
}

#[derive(Debug)]
pub struct StepRegistry {
    definitions: HashMap<String, Arc<StepDefinition>>,
}

impl StepRegistry {
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::default()
    }

    pub fn lookup(&self, key: &str) -> Result<Arc<StepDefinition>> {
        self.definitions
            .get(key)
            .cloned()
            .ok_or_else(|| FleetError::UnknownStepDefinition(key.to_string()))
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct StepRegistryBuilder {
    definitions: HashMap<String, Arc<StepDefinition>>,
}

impl StepRegistryBuilder {
    /// Add a definition; a key may only be registered once
    pub fn register(mut self, definition: StepDefinition) -> Result<Self> {
        if self.definitions.contains_key(definition.key()) {
            return Err(FleetError::DuplicateStepDefinition(definition.key.clone()));
        }
        debug!(
            "[JOB] Registered step definition {} {:?}",
            definition.key, definition.property_keys
        );
        self.definitions
            .insert(definition.key.clone(), Arc::new(definition));
        Ok(self)
    }

    pub fn build(self) -> Arc<StepRegistry> {
        Arc::new(StepRegistry {
            definitions: self.definitions,
        })
    }
}
