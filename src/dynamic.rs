//! `DynamicConfig` handles for live-updatable config.
//!
//! Backed by `ArcSwap` so readers on the hot path never take a lock while a policy
//! update swaps thresholds underneath them.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// `DynamicConfig<T>` gives cheap reads and controlled updates for shared config.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    /// Create a new `DynamicConfig` with the given initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Replace the value and hand back the previous one.
    pub fn replace(&self, value: T) -> Arc<T> {
        self.inner.swap(Arc::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;

    #[test]
    fn get_set_replace() {
        let cfg = DynamicConfig::new(1);
        assert_eq!(*cfg.get(), 1);
        cfg.set(2);
        assert_eq!(*cfg.get(), 2);
        let prev = cfg.replace(7);
        assert_eq!(*prev, 2);
        assert_eq!(*cfg.get(), 7);
    }

    #[test]
    fn clones_observe_updates() {
        let cfg = DynamicConfig::new(String::from("a"));
        let reader = cfg.clone();
        cfg.set("b".into());
        assert_eq!(reader.get().as_str(), "b");
    }
}
