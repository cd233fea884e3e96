//! Finding every class nested inside another one.
//!
//! The JVM only reports *member* classes structurally. Anonymous classes
//! (`Outer$1`, `Outer$2`, ...) are found by probing their javac names, and
//! local classes (`Outer$1Helper`) by scanning the outer class's constant
//! pool for references to them. Each class found is searched the same way,
//! so arbitrarily deep nesting is covered.

use std::collections::HashSet;
use std::sync::Arc;

use crate::class::{ClassKind, ClassLoader, ClassRef};
use crate::classfile;
use crate::collector::CollectorChain;
use crate::config::{ProbeOptions, ProbeStop};
use crate::error::{Error, Result};

pub struct InnerClassDiscovery {
    chain: Arc<CollectorChain>,
    probe: ProbeOptions,
    boot_loader: Option<Arc<dyn ClassLoader>>,
}

impl InnerClassDiscovery {
    pub fn new(chain: Arc<CollectorChain>, probe: ProbeOptions) -> Self {
        Self {
            chain,
            probe,
            boot_loader: None,
        }
    }

    /// Loader used to probe anonymous classes of boot-loaded outers.
    pub fn with_boot_loader(mut self, loader: Arc<dyn ClassLoader>) -> Self {
        self.boot_loader = Some(loader);
        self
    }

    /// All classes nested in `class` at any depth, excluding `class` itself.
    pub fn find_nested_classes(&self, class: Option<&ClassRef>) -> Result<HashSet<ClassRef>> {
        let class = class.ok_or(Error::NullInputClass)?;
        if matches!(class.kind(), ClassKind::Array | ClassKind::Primitive) {
            return Err(Error::IllegalInputClass(class.name().to_string()));
        }

        let mut found = HashSet::new();
        let mut pending = vec![class.clone()];
        while let Some(outer) = pending.pop() {
            for nested in self.direct_nested(&outer)? {
                if nested != *class && found.insert(nested.clone()) {
                    pending.push(nested);
                }
            }
        }
        tracing::debug!(class = %class, nested = found.len(), "nested class discovery finished");
        Ok(found)
    }

    fn direct_nested(&self, outer: &ClassRef) -> Result<Vec<ClassRef>> {
        let mut out = outer.declared_classes()?;
        let loader = outer.loader().or_else(|| self.boot_loader.clone());
        match loader {
            Some(loader) => {
                self.probe_anonymous(outer, &*loader, &mut out)?;
                self.local_classes(outer, &*loader, &mut out)?;
            }
            None => tracing::debug!(class = %outer, "no loader to probe nested classes with"),
        }
        Ok(out)
    }

    fn probe_anonymous(&self, outer: &ClassRef, loader: &dyn ClassLoader, out: &mut Vec<ClassRef>) -> Result<()> {
        for n in 1..=self.probe.max {
            match loader.load_class(&format!("{}${n}", outer.name()))? {
                Some(class) => out.push(class),
                None if self.probe.stop == ProbeStop::FirstMiss => break,
                None => {}
            }
        }
        Ok(())
    }

    fn local_classes(&self, outer: &ClassRef, loader: &dyn ClassLoader, out: &mut Vec<ClassRef>) -> Result<()> {
        let Some(bytes) = self.chain.get_bytes(Some(outer))? else {
            tracing::debug!(class = %outer, "no bytes, skipping local class scan");
            return Ok(());
        };
        let prefix = format!("{}$", outer.name());
        for reference in classfile::enumerate_class_references(bytes.as_slice()) {
            let name = reference?;
            if !name.starts_with(&prefix) {
                continue;
            }
            if let Some(class) = loader.load_class(&name)? {
                if class.kind() == ClassKind::Local {
                    out.push(class);
                }
            }
        }
        Ok(())
    }
}
