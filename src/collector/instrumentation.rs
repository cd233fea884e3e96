use std::collections::HashMap;
use std::sync::{Arc, Once};

use parking_lot::Mutex;

use crate::class::{ClassBytes, ClassRef};
use crate::collector::{ByteCollector, CollectorContext};
use crate::config::CollectorOptions;
use crate::error::Result;
use crate::instrument::gateway::{AgentHandle, InstrumentationGateway};
use crate::instrument::{
    CapturedByteCache, CapturingTransformer, ClassFileTransformer, Instrumentation, InstrumentationSource,
};

/// Gets the bytes the JVM currently holds for a class by retransforming it
/// with a capturing transformer installed.
///
/// This is the only collector that sees classes defined at runtime without
/// a backing resource. It is also the most expensive, hence the last in
/// line by default.
pub struct InstrumentationCollector {
    settings: CollectorOptions,
    handle: &'static AgentHandle,
    source: Arc<dyn InstrumentationSource>,
    gateway: Mutex<Option<Arc<InstrumentationGateway>>>,
    cache: Arc<CapturedByteCache>,
    capture_installed: Once,
    // Keyed by name alone: captured bytes are too. An entry lives only
    // while some thread holds or waits for it.
    class_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InstrumentationCollector {
    pub fn new(ctx: &CollectorContext) -> Self {
        Self {
            settings: ctx.options.instrumentation,
            handle: ctx.handle,
            source: ctx.instrumentation.clone(),
            gateway: Mutex::new(None),
            cache: Arc::new(CapturedByteCache::new()),
            capture_installed: Once::new(),
            class_locks: Mutex::new(HashMap::new()),
        }
    }

    fn gateway(&self) -> Result<Arc<InstrumentationGateway>> {
        let mut slot = self.gateway.lock();
        if let Some(gateway) = slot.as_ref() {
            return Ok(gateway.clone());
        }
        let gateway = self.handle.gateway(&*self.source)?;
        *slot = Some(gateway.clone());
        Ok(gateway)
    }

    /// Captured bytes not yet handed out.
    pub fn pending_captures(&self) -> usize {
        self.cache.len()
    }

    fn class_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.class_locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_class_lock(&self, name: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.class_locks.lock();
        // Ours and the table's: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(name);
        }
    }

    fn capture(&self, gateway: &InstrumentationGateway, class: &ClassRef) -> Result<Option<ClassBytes>> {
        self.ensure_capture(gateway);

        if !gateway.is_retransform_classes_supported() {
            tracing::warn!(class = %class, "retransformation not supported by this JVM");
            return Ok(None);
        }
        if !gateway.is_modifiable_class(class)? {
            tracing::warn!(class = %class, "class is not modifiable");
            return Ok(None);
        }

        gateway.retransform_classes(std::slice::from_ref(class))?;

        match self.cache.take(class.name()) {
            Some(bytes) => Ok(Some(bytes.into())),
            None => {
                tracing::warn!(class = %class, "retransformation did not deliver class bytes");
                Ok(None)
            }
        }
    }

    fn ensure_capture(&self, gateway: &InstrumentationGateway) {
        self.capture_installed.call_once(|| {
            let transformer: Arc<dyn ClassFileTransformer> =
                Arc::new(CapturingTransformer::new(self.cache.clone()));
            gateway.add_transformer(transformer, true);
        });
    }
}

impl ByteCollector for InstrumentationCollector {
    fn name(&self) -> &'static str {
        "instrumentation"
    }

    fn priority(&self) -> i32 {
        self.settings.priority
    }

    fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    fn try_get_bytes(&self, class: &ClassRef) -> Result<Option<ClassBytes>> {
        // Bootstrap failures go up as they are; the chain decides whether
        // other collectors can make up for them.
        let gateway = self.gateway()?;

        let lock = self.class_lock(class.name());
        let result = {
            let _guard = lock.lock();
            self.capture(&gateway, class)
        };
        self.release_class_lock(class.name(), lock);
        result
    }
}
