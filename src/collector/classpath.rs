use std::io::Read;
use std::sync::Arc;

use crate::class::{ClassBytes, ClassLoader, ClassRef};
use crate::collector::{ByteCollector, CollectorContext};
use crate::config::CollectorOptions;
use crate::error::{Error, Result};
use crate::names;

/// Reads `<internal name>.class` through the class's defining loader.
///
/// Classes without a loader are looked up through the boot loader.
pub struct ClasspathCollector {
    settings: CollectorOptions,
    boot_loader: Arc<dyn ClassLoader>,
}

impl ClasspathCollector {
    pub fn new(ctx: &CollectorContext) -> Self {
        Self {
            settings: ctx.options.classpath,
            boot_loader: ctx.boot_loader.clone(),
        }
    }

    /// A collector that is always enabled, for bootstrap use.
    pub fn with_boot_loader(boot_loader: Arc<dyn ClassLoader>) -> Self {
        Self {
            settings: CollectorOptions { enabled: true, priority: 0 },
            boot_loader,
        }
    }

    fn read(loader: &dyn ClassLoader, resource: &str) -> Result<Option<ClassBytes>> {
        let Some(mut stream) = loader
            .open_resource(resource)
            .map_err(|e| Error::resource_read(resource, e))?
        else {
            return Ok(None);
        };
        let mut bytes = Vec::new();
        stream
            .read_to_end(&mut bytes)
            .map_err(|e| Error::resource_read(resource, e))?;
        Ok(Some(bytes.into()))
    }
}

impl ByteCollector for ClasspathCollector {
    fn name(&self) -> &'static str {
        "classpath"
    }

    fn priority(&self) -> i32 {
        self.settings.priority
    }

    fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    fn try_get_bytes(&self, class: &ClassRef) -> Result<Option<ClassBytes>> {
        let resource = names::resource_path(class.name());
        let loader = class.loader().unwrap_or_else(|| self.boot_loader.clone());
        Self::read(&*loader, &resource)
    }
}
