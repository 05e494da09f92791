//! Registry of open realtime channels, one per subscription key

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::lock;
use crate::{error::AppError, models::SubscriptionKey, realtime::ChannelHandle};

#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<SubscriptionKey, Arc<dyn ChannelHandle>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle already registered for `key`, if any
    pub fn acquire(&self, key: &SubscriptionKey) -> Option<Arc<dyn ChannelHandle>> {
        lock(&self.channels).get(key).cloned()
    }

    /// Store a new handle. An existing registration is kept and the attempt is
    /// only logged; callers are expected to [`acquire`](Self::acquire) first.
    pub fn register(&self, key: SubscriptionKey, handle: Arc<dyn ChannelHandle>) -> bool {
        let mut channels = lock(&self.channels);
        if channels.contains_key(&key) {
            let error = AppError::DuplicateSubscription(key.to_string());
            tracing::warn!("{}", error);
            return false;
        }
        tracing::debug!("Registered channel {}", key);
        channels.insert(key, handle);
        true
    }

    pub fn release(&self, key: &SubscriptionKey) -> Option<Arc<dyn ChannelHandle>> {
        lock(&self.channels).remove(key)
    }

    /// Release `key` only while it still maps to `handle`
    pub fn release_if(&self, key: &SubscriptionKey, handle: &Arc<dyn ChannelHandle>) -> bool {
        let mut channels = lock(&self.channels);
        match channels.get(key) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                channels.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        lock(&self.channels).contains_key(key)
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = lock(&self.channels).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the registry, returning the handles it held
    pub fn clear(&self) -> Vec<Arc<dyn ChannelHandle>> {
        lock(&self.channels).drain().map(|(_, handle)| handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceDescriptor;
    use crate::realtime::{memory::MemoryProvider, RealtimeProvider};

    #[test]
    fn test_register_refuses_duplicates() {
        let provider = MemoryProvider::new();
        let registry = ChannelRegistry::new();
        let key = ResourceDescriptor::table("books").filter("dashboard_stats").key();

        let first = provider.channel(key.as_str());
        let second = provider.channel(key.as_str());

        assert!(registry.register(key.clone(), first.clone()));
        assert!(!registry.register(key.clone(), second.clone()));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.acquire(&key).unwrap(), &first));
    }

    #[test]
    fn test_release_if_checks_identity() {
        let provider = MemoryProvider::new();
        let registry = ChannelRegistry::new();
        let key = ResourceDescriptor::table("users").key();

        let owner = provider.channel(key.as_str());
        let stranger = provider.channel(key.as_str());
        registry.register(key.clone(), owner.clone());

        assert!(!registry.release_if(&key, &stranger));
        assert!(registry.contains(&key));
        assert!(registry.release_if(&key, &owner));
        assert!(registry.is_empty());
    }
}
