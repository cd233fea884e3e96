//! Live class transformation.
//!
//! [`Instrumentation`] is the process's class-transformation capability.
//! In a JVM it is backed by JVMTI ([`JvmtiInstrumentation`]); there is only
//! ever one of it per process, held by the [`AgentHandle`]. Each logical
//! agent talks to it through its own [`InstrumentationGateway`].

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::class::{ClassLoader, ClassRef};
use crate::error::Result;

pub mod capture;
pub mod gateway;
pub mod jvmti;

pub use capture::{CapturedByteCache, CapturingTransformer};
pub use gateway::{AgentHandle, InstrumentationGateway};
pub use jvmti::JvmtiInstrumentation;

/// A class-file transformation callback.
pub trait ClassFileTransformer: Send + Sync {
    /// Called with the current bytes of `class_name` (internal form).
    ///
    /// `class_being_redefined` is set during retransformation and redefinition.
    /// Return `Some(bytes)` to replace the class, `None` to leave it alone.
    fn transform(
        &self,
        loader: Option<&Arc<dyn ClassLoader>>,
        class_name: Option<&str>,
        class_being_redefined: Option<&ClassRef>,
        class_bytes: &[u8],
    ) -> Option<Vec<u8>>;
}

/// The JVM's class-transformation capability.
pub trait Instrumentation: Send + Sync {
    fn add_transformer(&self, transformer: Arc<dyn ClassFileTransformer>, can_retransform: bool);

    /// Removes by identity. Returns whether it was registered.
    fn remove_transformer(&self, transformer: &Arc<dyn ClassFileTransformer>) -> bool;

    /// Re-runs the retransform-capable transformers over the current bytes of `classes`.
    fn retransform_classes(&self, classes: &[ClassRef]) -> Result<()>;

    fn redefine_class(&self, class: &ClassRef, bytes: &[u8]) -> Result<()>;

    fn is_modifiable_class(&self, class: &ClassRef) -> Result<bool>;

    fn is_retransform_classes_supported(&self) -> bool;

    fn is_redefine_classes_supported(&self) -> bool;

    fn all_loaded_classes(&self) -> Result<Vec<ClassRef>>;
}

#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) transformer: Arc<dyn ClassFileTransformer>,
    pub(crate) can_retransform: bool,
}

/// Transformers in registration order.
///
/// Copy-on-write: callbacks iterate a snapshot while writers swap in a new list.
pub(crate) struct TransformerQueue {
    list: RwLock<Arc<[Registration]>>,
}

impl TransformerQueue {
    pub(crate) fn new() -> Self {
        Self {
            list: RwLock::new(Arc::from(Vec::new())),
        }
    }

    pub(crate) fn push(&self, transformer: Arc<dyn ClassFileTransformer>, can_retransform: bool) {
        let mut list = self.list.write();
        let mut next = list.to_vec();
        next.push(Registration {
            transformer,
            can_retransform,
        });
        *list = next.into();
    }

    /// Removes the first registration of `transformer`, compared by identity.
    pub(crate) fn remove(&self, transformer: &Arc<dyn ClassFileTransformer>) -> bool {
        let mut list = self.list.write();
        let Some(pos) = list
            .iter()
            .position(|reg| same_transformer(&reg.transformer, transformer))
        else {
            return false;
        };
        let mut next = list.to_vec();
        next.remove(pos);
        *list = next.into();
        true
    }

    pub(crate) fn snapshot(&self) -> Arc<[Registration]> {
        self.list.read().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.list.read().len()
    }
}

fn same_transformer(a: &Arc<dyn ClassFileTransformer>, b: &Arc<dyn ClassFileTransformer>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Produces the process's instrumentation capability on first use.
pub trait InstrumentationSource: Send + Sync {
    fn acquire(&self) -> Result<Arc<dyn Instrumentation>>;
}

/// A source that always hands out the same capability.
#[derive(Clone)]
pub struct FixedInstrumentation(pub Arc<dyn Instrumentation>);

impl InstrumentationSource for FixedInstrumentation {
    fn acquire(&self) -> Result<Arc<dyn Instrumentation>> {
        Ok(self.0.clone())
    }
}

impl fmt::Debug for FixedInstrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FixedInstrumentation")
    }
}

/// A source that always fails with the given message, for when no live
/// capability can exist (offline tooling).
#[derive(Debug, Clone)]
pub struct Unavailable(pub String);

impl InstrumentationSource for Unavailable {
    fn acquire(&self) -> Result<Arc<dyn Instrumentation>> {
        Err(crate::error::Error::AttachFailure(self.0.clone()))
    }
}
