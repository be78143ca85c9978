//! Descriptor arena
//!
//! Descriptors live in a dense vector; ids map to slot indices. Removal
//! swaps the last slot into the hole and fixes its index entry.

use std::collections::HashMap;

use crate::descriptor::PluginDescriptor;

#[derive(Debug, Default)]
pub struct PluginRegistry {
    slots: Vec<PluginDescriptor>,
    index: HashMap<String, usize>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a descriptor. Returns it back if the id is taken.
    #[allow(clippy::result_large_err)]
    pub fn insert(&mut self, descriptor: PluginDescriptor) -> Result<(), PluginDescriptor> {
        if self.index.contains_key(descriptor.id()) {
            return Err(descriptor);
        }
        self.index.insert(descriptor.id().to_string(), self.slots.len());
        self.slots.push(descriptor);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&PluginDescriptor> {
        self.index.get(id).and_then(|&slot| self.slots.get(slot))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PluginDescriptor> {
        let slot = *self.index.get(id)?;
        self.slots.get_mut(slot)
    }

    pub fn remove(&mut self, id: &str) -> Option<PluginDescriptor> {
        let slot = self.index.remove(id)?;
        if slot >= self.slots.len() {
            return None;
        }
        let removed = self.slots.swap_remove(slot);
        if let Some(moved) = self.slots.get(slot) {
            self.index.insert(moved.id().to_string(), slot);
        }
        Some(removed)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PluginDescriptor> {
        self.slots.iter_mut()
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.index.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Plugin, PluginConfig, PluginMetadata};
    use crate::error::PluginResult;
    use crate::lifecycle::PluginState;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Noop(PluginMetadata);

    #[async_trait]
    impl Plugin for Noop {
        fn metadata(&self) -> &PluginMetadata {
            &self.0
        }
        fn state(&self) -> PluginState {
            PluginState::Registered
        }
        async fn initialize(&mut self, _config: &PluginConfig) -> PluginResult<()> {
            Ok(())
        }
        async fn start(&mut self) -> PluginResult<()> {
            Ok(())
        }
        async fn stop(&mut self) -> PluginResult<()> {
            Ok(())
        }
        async fn uninstall(&mut self) -> PluginResult<()> {
            Ok(())
        }
    }

    fn descriptor(id: &str) -> PluginDescriptor {
        let metadata = PluginMetadata::new(id, "1.0.0");
        let inner = metadata.clone();
        PluginDescriptor::new(
            id,
            format!("mem://{id}"),
            metadata,
            Arc::new(move || Box::new(Noop(inner.clone())) as Box<dyn Plugin>),
        )
    }

    #[test]
    fn duplicate_insert_hands_descriptor_back() {
        let mut registry = PluginRegistry::new();
        registry.insert(descriptor("a")).expect("first insert");
        let rejected = registry.insert(descriptor("a")).expect_err("duplicate");
        assert_eq!(rejected.id(), "a");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removal_keeps_index_consistent() {
        let mut registry = PluginRegistry::new();
        for id in ["a", "b", "c", "d"] {
            registry.insert(descriptor(id)).expect("insert");
        }

        let removed = registry.remove("b").expect("present");
        assert_eq!(removed.id(), "b");
        assert!(registry.remove("b").is_none());

        // "d" was swapped into the freed slot.
        for id in ["a", "c", "d"] {
            assert_eq!(registry.get(id).map(PluginDescriptor::id), Some(id));
        }
        assert_eq!(registry.ids(), vec!["a", "c", "d"]);

        registry.get_mut("d").expect("present").error = Some("x".into());
        assert_eq!(registry.get("d").and_then(PluginDescriptor::error), Some("x"));
    }
}
