//! Shared fixtures for unit tests

use crate::object_store::ObjectStore;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// In-memory object store whose writes can be switched to fail
#[derive(Default)]
pub struct FlakyStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
    puts: AtomicUsize,
}

impl FlakyStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful writes so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn get_stored(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("object store unavailable"));
        }
        self.objects.lock().insert(key.to_string(), bytes);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(format!("mem://{key}"))
    }

    async fn get(&self, reference: &str) -> Result<Vec<u8>> {
        let key = reference.trim_start_matches("mem://");
        self.get_stored(key)
            .ok_or_else(|| anyhow!("no object at {reference}"))
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        let key = reference.trim_start_matches("mem://");
        self.objects.lock().remove(key);
        Ok(())
    }
}
