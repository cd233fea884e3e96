//! Turning a class into text through an external decompiler.

use std::sync::Arc;

use crate::class::{ClassBytes, ClassRef};
use crate::collector::CollectorChain;
use crate::discovery::InnerClassDiscovery;
use crate::error::Result;

/// Renders class files as source-like text.
pub trait Decompiler: Send + Sync {
    /// `inner` pairs each nested class's internal name with its bytes.
    fn decompile(&self, class: &ClassBytes, inner: &[(String, ClassBytes)]) -> Result<String>;
}

pub struct ClassSourceParser {
    chain: Arc<CollectorChain>,
    discovery: InnerClassDiscovery,
    decompiler: Arc<dyn Decompiler>,
}

impl ClassSourceParser {
    pub fn new(chain: Arc<CollectorChain>, discovery: InnerClassDiscovery, decompiler: Arc<dyn Decompiler>) -> Self {
        Self {
            chain,
            discovery,
            decompiler,
        }
    }

    /// Decompiled text of `class`, or `None` when its bytes cannot be found.
    ///
    /// Nested classes whose bytes are missing are left out.
    pub fn parse(&self, class: &ClassRef) -> Result<Option<String>> {
        let Some(bytes) = self.chain.get_bytes(Some(class))? else {
            return Ok(None);
        };

        let mut inner = Vec::new();
        for nested in self.discovery.find_nested_classes(Some(class))? {
            match self.chain.get_bytes(Some(&nested))? {
                Some(nested_bytes) => inner.push((nested.internal_name(), nested_bytes)),
                None => tracing::debug!(class = %nested, "nested class has no bytes"),
            }
        }
        inner.sort_by(|a, b| a.0.cmp(&b.0));

        self.decompiler.decompile(&bytes, &inner).map(Some)
    }
}
