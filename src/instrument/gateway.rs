//! Sharing the single process-wide instrumentation capability.
//!
//! The JVM hands out one class-transformation capability per process. The
//! [`AgentHandle`] holds it; every logical agent wraps it in its own
//! [`InstrumentationGateway`], which is itself an [`Instrumentation`].
//!
//! A gateway registers one callback with the real capability. That callback
//! only acts while *this* gateway has a `retransform_classes` call running on
//! the current thread, so agents never see (or alter) retransformations
//! another agent asked for:
//!
//! ```text
//! agent A ── gateway A ──┐
//!                        ├── AgentHandle ── JVMTI
//! agent B ── gateway B ──┘
//! ```

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::class::{ClassLoader, ClassRef};
use crate::error::{Error, Result};
use crate::instrument::{ClassFileTransformer, Instrumentation, InstrumentationSource, TransformerQueue};

/// Owner of the process's one instrumentation capability.
///
/// Initialized lazily and never torn down.
pub struct AgentHandle {
    cell: OnceLock<Arc<dyn Instrumentation>>,
    init: Mutex<()>,
}

static GLOBAL_HANDLE: AgentHandle = AgentHandle::new();

impl AgentHandle {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            init: parking_lot::const_mutex(()),
        }
    }

    /// The process-wide handle.
    pub fn global() -> &'static AgentHandle {
        &GLOBAL_HANDLE
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Returns the capability, acquiring it from `source` the first time.
    ///
    /// Concurrent first calls acquire once; a failed acquisition leaves the
    /// handle empty so a later call can try again.
    pub fn get_or_acquire(&self, source: &dyn InstrumentationSource) -> Result<Arc<dyn Instrumentation>> {
        if let Some(inst) = self.cell.get() {
            return Ok(inst.clone());
        }
        let _guard = self.init.lock();
        if let Some(inst) = self.cell.get() {
            return Ok(inst.clone());
        }
        let inst = source.acquire().map_err(Error::into_bootstrap_failure)?;
        tracing::info!("instrumentation capability acquired");
        Ok(self.cell.get_or_init(|| inst).clone())
    }

    /// A new gateway over the capability.
    pub fn gateway(&self, source: &dyn InstrumentationSource) -> Result<Arc<InstrumentationGateway>> {
        Ok(InstrumentationGateway::new(self.get_or_acquire(source)?))
    }
}

impl Default for AgentHandle {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    // Gateways with a retransform running on this thread.
    static IN_FLIGHT: RefCell<Vec<u64>> = RefCell::new(Vec::new());
}

struct InFlight(u64);

impl InFlight {
    fn enter(id: u64) -> Self {
        IN_FLIGHT.with(|ids| ids.borrow_mut().push(id));
        InFlight(id)
    }

    fn is_set(id: u64) -> bool {
        IN_FLIGHT.with(|ids| ids.borrow().contains(&id))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        IN_FLIGHT.with(|ids| {
            let mut ids = ids.borrow_mut();
            if let Some(pos) = ids.iter().rposition(|&id| id == self.0) {
                ids.remove(pos);
            }
        });
    }
}

/// The callback a gateway installs on the real capability.
struct SharedCallback {
    gateway_id: u64,
    queue: Arc<TransformerQueue>,
}

impl ClassFileTransformer for SharedCallback {
    fn transform(
        &self,
        loader: Option<&Arc<dyn ClassLoader>>,
        class_name: Option<&str>,
        class_being_redefined: Option<&ClassRef>,
        class_bytes: &[u8],
    ) -> Option<Vec<u8>> {
        if !InFlight::is_set(self.gateway_id) {
            return None;
        }
        let snapshot = self.queue.snapshot();
        let mut accepted = None;
        for reg in snapshot.iter() {
            let out = reg
                .transformer
                .transform(loader, class_name, class_being_redefined, class_bytes);
            if let Some(out) = out {
                if reg.can_retransform {
                    accepted = Some(out);
                }
            }
        }
        accepted.filter(|out| out.as_slice() != class_bytes)
    }
}

static NEXT_GATEWAY_ID: AtomicU64 = AtomicU64::new(1);

/// One logical agent's view of the shared capability.
///
/// Passes every call through, except:
///
/// - `add_transformer` / `remove_transformer` manage this gateway's own queue
/// - `retransform_classes` marks the gateway as in flight on the calling
///   thread for the duration of the call
pub struct InstrumentationGateway {
    id: u64,
    inner: Arc<dyn Instrumentation>,
    queue: Arc<TransformerQueue>,
    callback: Arc<dyn ClassFileTransformer>,
    installed: AtomicBool,
    install_lock: Mutex<()>,
}

impl InstrumentationGateway {
    pub fn new(inner: Arc<dyn Instrumentation>) -> Arc<Self> {
        let id = NEXT_GATEWAY_ID.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(TransformerQueue::new());
        let callback: Arc<dyn ClassFileTransformer> = Arc::new(SharedCallback {
            gateway_id: id,
            queue: queue.clone(),
        });
        Arc::new(Self {
            id,
            inner,
            queue,
            callback,
            installed: AtomicBool::new(false),
            install_lock: parking_lot::const_mutex(()),
        })
    }

    pub fn transformer_count(&self) -> usize {
        self.queue.len()
    }

    fn ensure_callback(&self) {
        if self.installed.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.install_lock.lock();
        if self.installed.load(Ordering::Relaxed) {
            return;
        }
        self.inner.add_transformer(self.callback.clone(), true);
        self.installed.store(true, Ordering::Release);
        tracing::debug!(gateway = self.id, "installed shared transform callback");
    }
}

impl Instrumentation for InstrumentationGateway {
    fn add_transformer(&self, transformer: Arc<dyn ClassFileTransformer>, can_retransform: bool) {
        self.ensure_callback();
        self.queue.push(transformer, can_retransform);
    }

    fn remove_transformer(&self, transformer: &Arc<dyn ClassFileTransformer>) -> bool {
        self.queue.remove(transformer)
    }

    fn retransform_classes(&self, classes: &[ClassRef]) -> Result<()> {
        let _token = InFlight::enter(self.id);
        self.inner.retransform_classes(classes)
    }

    fn redefine_class(&self, class: &ClassRef, bytes: &[u8]) -> Result<()> {
        self.inner.redefine_class(class, bytes)
    }

    fn is_modifiable_class(&self, class: &ClassRef) -> Result<bool> {
        self.inner.is_modifiable_class(class)
    }

    fn is_retransform_classes_supported(&self) -> bool {
        self.inner.is_retransform_classes_supported()
    }

    fn is_redefine_classes_supported(&self) -> bool {
        self.inner.is_redefine_classes_supported()
    }

    fn all_loaded_classes(&self) -> Result<Vec<ClassRef>> {
        self.inner.all_loaded_classes()
    }
}

impl Drop for InstrumentationGateway {
    fn drop(&mut self) {
        if *self.installed.get_mut() {
            self.inner.remove_transformer(&self.callback);
        }
    }
}
