//! Recording object writer for tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::storage::{ObjectKey, ObjectWriter};

#[derive(Default)]
struct Inner {
    objects: Vec<(ObjectKey, Vec<u8>)>,
    fail_uploads: usize,
    attempts: usize,
}

#[derive(Clone, Default)]
pub struct MemoryObjectWriter {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryObjectWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_uploads(&self, count: usize) {
        self.inner.lock().unwrap().fail_uploads = count;
    }

    /// Successful uploads in order.
    pub fn objects(&self) -> Vec<(ObjectKey, Vec<u8>)> {
        self.inner.lock().unwrap().objects.clone()
    }

    /// Record arrays of each uploaded object.
    pub fn records(&self) -> Vec<Vec<serde_json::Value>> {
        self.objects()
            .iter()
            .map(|(_, bytes)| serde_json::from_slice(bytes).unwrap())
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.inner.lock().unwrap().attempts
    }
}

#[async_trait]
impl ObjectWriter for MemoryObjectWriter {
    async fn upload(&self, key: &ObjectKey, payload: Vec<u8>) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.attempts += 1;
        if inner.fail_uploads > 0 {
            inner.fail_uploads -= 1;
            return Err(AppError::upload(key.path("mem"), "access denied"));
        }
        inner.objects.push((key.clone(), payload));
        Ok(format!("mem://{}", key.path("")))
    }
}
