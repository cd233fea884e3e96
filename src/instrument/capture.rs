use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::class::{ClassLoader, ClassRef};
use crate::instrument::ClassFileTransformer;

/// Bytes seen during retransformation, keyed by qualified class name.
///
/// Entries are removed as they are read.
#[derive(Debug, Default)]
pub struct CapturedByteCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl CapturedByteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, name: impl Into<String>, bytes: Vec<u8>) {
        self.entries.lock().insert(name.into(), bytes);
    }

    /// Removes and returns the entry for `name`.
    pub fn take(&self, name: &str) -> Option<Vec<u8>> {
        self.entries.lock().remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Records the bytes of every retransformed class into a [`CapturedByteCache`]
/// and never changes them.
#[derive(Debug, Clone)]
pub struct CapturingTransformer {
    cache: Arc<CapturedByteCache>,
}

impl CapturingTransformer {
    pub fn new(cache: Arc<CapturedByteCache>) -> Self {
        Self { cache }
    }
}

impl ClassFileTransformer for CapturingTransformer {
    fn transform(
        &self,
        _loader: Option<&Arc<dyn ClassLoader>>,
        class_name: Option<&str>,
        class_being_redefined: Option<&ClassRef>,
        class_bytes: &[u8],
    ) -> Option<Vec<u8>> {
        // Initial loads are not ours to record.
        let redefined = class_being_redefined?;
        let key = redefined.name().to_string();
        tracing::trace!(class = %key, internal = ?class_name, len = class_bytes.len(), "captured class bytes");
        self.cache.put(key, class_bytes.to_vec());
        None
    }
}
