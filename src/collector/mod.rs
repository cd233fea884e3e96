//! Byte collectors and the chain that orders them.
//!
//! Each [`ByteCollector`] is one way of getting the bytes of a class. The
//! [`CollectorChain`] asks the enabled ones in ascending priority order and
//! stops at the first that answers:
//!
//! | Collector                    | Priority | Source                                   |
//! |------------------------------|----------|------------------------------------------|
//! | [`ClasspathCollector`]       | 0        | `<internal name>.class` from the loader  |
//! | [`DumperCollector`]          | 500      | `./DUMP_CLASS_FILES/<internal name>.class` |
//! | [`InstrumentationCollector`] | 1000     | live retransformation                    |
//!
//! A collector that finds nothing returns `Ok(None)` and the chain moves on.
//! An `Err` is a real failure and is returned to the caller unchanged, with
//! one exception: a collector that cannot get started (see
//! [`crate::Error::is_bootstrap_failure`]) is skipped with a warning as long as the
//! chain has other collectors to ask.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::class::{ClassBytes, ClassLoader, ClassRef};
use crate::config::Options;
use crate::error::Result;
use crate::instrument::gateway::AgentHandle;
use crate::instrument::InstrumentationSource;

mod classpath;
mod dumper;
mod instrumentation;

pub use classpath::ClasspathCollector;
pub use dumper::{remove_dump_tree, DumperCollector, DUMP_PROPERTIES};
pub use instrumentation::InstrumentationCollector;

/// One strategy for producing the bytes of a class.
pub trait ByteCollector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower runs earlier.
    fn priority(&self) -> i32;

    fn is_enabled(&self) -> bool;

    /// `Ok(None)` when this source does not have the class.
    fn try_get_bytes(&self, class: &ClassRef) -> Result<Option<ClassBytes>>;
}

/// Read access to JVM system properties.
pub trait SystemProperties: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Properties from a fixed map.
#[derive(Debug, Clone, Default)]
pub struct StaticProperties(HashMap<String, String>);

impl StaticProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

impl SystemProperties for StaticProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Everything a collector factory may need.
#[derive(Clone)]
pub struct CollectorContext {
    pub options: Arc<Options>,
    /// Stands in for classes that report no loader.
    pub boot_loader: Arc<dyn ClassLoader>,
    pub properties: Arc<dyn SystemProperties>,
    pub instrumentation: Arc<dyn InstrumentationSource>,
    pub handle: &'static AgentHandle,
}

impl CollectorContext {
    pub fn new(
        options: Arc<Options>,
        boot_loader: Arc<dyn ClassLoader>,
        properties: Arc<dyn SystemProperties>,
        instrumentation: Arc<dyn InstrumentationSource>,
    ) -> Self {
        Self {
            options,
            boot_loader,
            properties,
            instrumentation,
            handle: AgentHandle::global(),
        }
    }

    /// Uses `handle` instead of the process-wide one.
    pub fn with_handle(mut self, handle: &'static AgentHandle) -> Self {
        self.handle = handle;
        self
    }
}

impl fmt::Debug for CollectorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorContext")
            .field("options", &self.options)
            .field("boot_loader", &self.boot_loader)
            .finish_non_exhaustive()
    }
}

type Factory = Box<dyn Fn(&CollectorContext) -> Arc<dyn ByteCollector> + Send + Sync>;

/// The set of known collectors, as factories.
///
/// [`CollectorRegistry::standard`] holds the three built-in collectors;
/// more can be added with [`CollectorRegistry::register`].
#[derive(Default)]
pub struct CollectorRegistry {
    factories: Vec<Factory>,
}

impl CollectorRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(|ctx| Arc::new(ClasspathCollector::new(ctx)) as Arc<dyn ByteCollector>);
        registry.register(|ctx| Arc::new(DumperCollector::new(ctx)) as Arc<dyn ByteCollector>);
        registry.register(|ctx| Arc::new(InstrumentationCollector::new(ctx)) as Arc<dyn ByteCollector>);
        registry
    }

    pub fn register<F>(&mut self, factory: F) -> &mut Self
    where
        F: Fn(&CollectorContext) -> Arc<dyn ByteCollector> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(factory));
        self
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    fn instantiate(&self, ctx: &CollectorContext) -> Vec<Arc<dyn ByteCollector>> {
        self.factories.iter().map(|factory| factory(ctx)).collect()
    }
}

/// Enabled collectors in priority order.
pub struct CollectorChain {
    collectors: Vec<Arc<dyn ByteCollector>>,
}

impl CollectorChain {
    /// Instantiates the registry, drops disabled collectors and sorts the
    /// rest by priority. Equal priorities keep registration order.
    pub fn new(registry: &CollectorRegistry, ctx: &CollectorContext) -> Self {
        Self::from_collectors(registry.instantiate(ctx))
    }

    pub fn standard(ctx: &CollectorContext) -> Self {
        Self::new(&CollectorRegistry::standard(), ctx)
    }

    pub fn from_collectors(collectors: Vec<Arc<dyn ByteCollector>>) -> Self {
        let mut collectors: Vec<_> = collectors
            .into_iter()
            .filter(|c| {
                let enabled = c.is_enabled();
                if !enabled {
                    tracing::debug!(collector = c.name(), "collector disabled");
                }
                enabled
            })
            .collect();
        collectors.sort_by_key(|c| c.priority());
        Self { collectors }
    }

    /// Names of the active collectors, in the order they are asked.
    pub fn collector_names(&self) -> Vec<&'static str> {
        self.collectors.iter().map(|c| c.name()).collect()
    }

    /// Bytes of `class` from the first collector that has them.
    ///
    /// `None` input, or no collector having the class, gives `Ok(None)`.
    pub fn get_bytes(&self, class: Option<&ClassRef>) -> Result<Option<ClassBytes>> {
        let Some(class) = class else {
            return Ok(None);
        };
        let sole_collector = self.collectors.len() == 1;
        for collector in &self.collectors {
            match collector.try_get_bytes(class) {
                Ok(Some(bytes)) => {
                    tracing::debug!(class = %class, collector = collector.name(), len = bytes.len(), "collected class bytes");
                    return Ok(Some(bytes));
                }
                Ok(None) => {}
                Err(e) if e.is_bootstrap_failure() && !sole_collector => {
                    tracing::warn!(class = %class, collector = collector.name(), error = %e, "collector unavailable, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(class = %class, "no collector produced bytes");
        Ok(None)
    }
}

impl fmt::Debug for CollectorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.collector_names()).finish()
    }
}
