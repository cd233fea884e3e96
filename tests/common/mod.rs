#![allow(dead_code)]

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use jvmti_classbytes::bootstrap::{AgentRuntime, AttachCommand, AttachProvider};
use jvmti_classbytes::class::{ClassBytes, ClassKind, ClassLoader, ClassRef, JavaClass};
use jvmti_classbytes::collector::ByteCollector;
use jvmti_classbytes::error::{Error, Result};
use jvmti_classbytes::instrument::{ClassFileTransformer, Instrumentation};
use jvmti_classbytes::names;

pub struct CpBuilder {
    entries: Vec<Vec<u8>>,
    slots: u16,
}

impl CpBuilder {
    pub fn new() -> Self {
        Self { entries: Vec::new(), slots: 0 }
    }

    fn push(&mut self, entry: Vec<u8>, width: u16) -> u16 {
        self.entries.push(entry);
        let index = self.slots + 1;
        self.slots += width;
        index
    }

    pub fn utf8(&mut self, s: &str) -> u16 {
        let mut entry = vec![1];
        entry.extend_from_slice(&(s.len() as u16).to_be_bytes());
        entry.extend_from_slice(s.as_bytes());
        self.push(entry, 1)
    }

    pub fn class(&mut self, name_index: u16) -> u16 {
        let mut entry = vec![7];
        entry.extend_from_slice(&name_index.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn class_named(&mut self, internal: &str) -> u16 {
        let name = self.utf8(internal);
        self.class(name)
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        let mut entry = vec![3];
        entry.extend_from_slice(&value.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn long(&mut self, value: i64) -> u16 {
        let mut entry = vec![5];
        entry.extend_from_slice(&value.to_be_bytes());
        self.push(entry, 2)
    }

    pub fn string(&mut self, utf8_index: u16) -> u16 {
        let mut entry = vec![8];
        entry.extend_from_slice(&utf8_index.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn name_and_type(&mut self, name_index: u16, descriptor_index: u16) -> u16 {
        let mut entry = vec![12];
        entry.extend_from_slice(&name_index.to_be_bytes());
        entry.extend_from_slice(&descriptor_index.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn methodref(&mut self, class_index: u16, name_and_type_index: u16) -> u16 {
        let mut entry = vec![10];
        entry.extend_from_slice(&class_index.to_be_bytes());
        entry.extend_from_slice(&name_and_type_index.to_be_bytes());
        self.push(entry, 1)
    }

    pub fn method_handle(&mut self, kind: u8, reference_index: u16) -> u16 {
        let mut entry = vec![15, kind];
        entry.extend_from_slice(&reference_index.to_be_bytes());
        self.push(entry, 1)
    }

    /// `constant_pool_count` followed by the entries.
    pub fn encode(&self, out: &mut Vec<u8>) {
        u2(out, self.slots + 1);
        for entry in &self.entries {
            out.extend_from_slice(entry);
        }
    }
}

pub fn u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// A class file with the given pool, `this_class`, no super class and no members.
pub fn assemble(cp: &CpBuilder, this_class: u16) -> Vec<u8> {
    let mut out = Vec::new();
    u4(&mut out, 0xCAFEBABE);
    u2(&mut out, 0);
    u2(&mut out, 52);
    cp.encode(&mut out);
    u2(&mut out, 0x0021);
    u2(&mut out, this_class);
    u2(&mut out, 0); // super_class
    u2(&mut out, 0); // interfaces
    u2(&mut out, 0); // fields
    u2(&mut out, 0); // methods
    u2(&mut out, 0); // attributes
    out
}

/// A class named `name` whose pool also references `references`.
pub fn class_file(name: &str, references: &[&str]) -> Vec<u8> {
    let mut cp = CpBuilder::new();
    let this = cp.class_named(&names::to_internal_name(name));
    for reference in references {
        cp.class_named(&names::to_internal_name(reference));
    }
    assemble(&cp, this)
}

/// Writes one `.class` file per name under `root`, each referencing `refs[name]`.
pub fn write_classes(root: &Path, classes: &[(&str, &[&str])]) {
    for (name, refs) in classes {
        ClassBytes::from(class_file(name, refs))
            .write_to(root.join(names::resource_path(name)))
            .unwrap();
    }
}

/// A class with no loader and no members.
#[derive(Debug)]
pub struct FakeClass {
    name: String,
    kind: ClassKind,
}

impl FakeClass {
    pub fn new(name: &str, kind: ClassKind) -> ClassRef {
        ClassRef::new(FakeClass {
            name: name.to_string(),
            kind,
        })
    }

    pub fn top_level(name: &str) -> ClassRef {
        Self::new(name, ClassKind::TopLevel)
    }
}

impl JavaClass for FakeClass {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ClassKind {
        self.kind
    }

    fn loader(&self) -> Option<Arc<dyn ClassLoader>> {
        None
    }

    fn declared_classes(&self) -> Result<Vec<ClassRef>> {
        Ok(Vec::new())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A collector with a fixed answer that counts how often it was asked.
pub struct CountingCollector {
    pub name: &'static str,
    pub priority: i32,
    pub enabled: bool,
    pub answer: Option<Vec<u8>>,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl CountingCollector {
    pub fn new(name: &'static str, priority: i32, answer: Option<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            priority,
            enabled: true,
            answer,
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(name: &'static str, priority: i32) -> Arc<Self> {
        Arc::new(Self {
            name,
            priority,
            enabled: true,
            answer: None,
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn disabled(name: &'static str, priority: i32, answer: Option<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            priority,
            enabled: false,
            answer,
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ByteCollector for CountingCollector {
    fn name(&self) -> &'static str {
        self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn try_get_bytes(&self, class: &ClassRef) -> Result<Option<ClassBytes>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::ResourceReadFailure {
                resource: names::resource_path(class.name()),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
            });
        }
        Ok(self.answer.clone().map(ClassBytes::from))
    }
}

/// In-memory instrumentation that runs its transformers synchronously on
/// `retransform_classes`, the way the JVM does on the calling thread.
pub struct FakeInstrumentation {
    transformers: Mutex<Vec<(Arc<dyn ClassFileTransformer>, bool)>>,
    bytes: Mutex<HashMap<String, Vec<u8>>>,
    pub retransforms: AtomicUsize,
    pub retransform_supported: bool,
    pub modifiable: bool,
}

impl FakeInstrumentation {
    pub fn new() -> Arc<Self> {
        Self::with(true, true)
    }

    pub fn with(retransform_supported: bool, modifiable: bool) -> Arc<Self> {
        Arc::new(Self {
            transformers: Mutex::new(Vec::new()),
            bytes: Mutex::new(HashMap::new()),
            retransforms: AtomicUsize::new(0),
            retransform_supported,
            modifiable,
        })
    }

    /// Makes `name` a loaded class with the given bytes.
    pub fn define(&self, name: &str, bytes: Vec<u8>) {
        self.bytes.lock().insert(name.to_string(), bytes);
    }

    pub fn current_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.bytes.lock().get(name).cloned()
    }

    pub fn transformer_count(&self) -> usize {
        self.transformers.lock().len()
    }

    pub fn retransform_count(&self) -> usize {
        self.retransforms.load(Ordering::SeqCst)
    }
}

impl Instrumentation for FakeInstrumentation {
    fn add_transformer(&self, transformer: Arc<dyn ClassFileTransformer>, can_retransform: bool) {
        self.transformers.lock().push((transformer, can_retransform));
    }

    fn remove_transformer(&self, transformer: &Arc<dyn ClassFileTransformer>) -> bool {
        let mut list = self.transformers.lock();
        let target = Arc::as_ptr(transformer) as *const ();
        match list.iter().position(|(t, _)| Arc::as_ptr(t) as *const () == target) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    fn retransform_classes(&self, classes: &[ClassRef]) -> Result<()> {
        self.retransforms.fetch_add(1, Ordering::SeqCst);
        let transformers = self.transformers.lock().clone();
        for class in classes {
            let Some(mut current) = self.current_bytes(class.name()) else {
                continue;
            };
            let internal = class.internal_name();
            for (transformer, can_retransform) in &transformers {
                if !can_retransform {
                    continue;
                }
                if let Some(out) = transformer.transform(None, Some(&internal), Some(class), &current) {
                    current = out;
                }
            }
            self.define(class.name(), current);
        }
        Ok(())
    }

    fn redefine_class(&self, class: &ClassRef, bytes: &[u8]) -> Result<()> {
        self.define(class.name(), bytes.to_vec());
        Ok(())
    }

    fn is_modifiable_class(&self, _class: &ClassRef) -> Result<bool> {
        Ok(self.modifiable)
    }

    fn is_retransform_classes_supported(&self) -> bool {
        self.retransform_supported
    }

    fn is_redefine_classes_supported(&self) -> bool {
        true
    }

    fn all_loaded_classes(&self) -> Result<Vec<ClassRef>> {
        Ok(self.bytes.lock().keys().map(|name| FakeClass::top_level(name)).collect())
    }
}

/// What an attach saw: the command and the jar entries present at that moment.
#[derive(Debug, Clone)]
pub struct AttachRecord {
    pub pid: u32,
    pub command: AttachCommand,
    pub jar_entries: Vec<String>,
    pub manifest: String,
}

/// Where an attached agent leaves the capability it was started with, the
/// way `bootstrap::hand_off` does for a real VM.
pub type Delivery = Arc<Mutex<Option<Arc<dyn Instrumentation>>>>;

#[derive(Default)]
pub struct RecordingAttach {
    pub records: Mutex<Vec<AttachRecord>>,
    pub fail: bool,
    pub delivers: Option<(Delivery, Arc<dyn Instrumentation>)>,
}

impl RecordingAttach {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Succeeds and hands `inst` over through `slot`, as a loaded agent would.
    pub fn delivering(slot: Delivery, inst: Arc<dyn Instrumentation>) -> Self {
        Self {
            delivers: Some((slot, inst)),
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.records.lock().len()
    }
}

impl AttachProvider for RecordingAttach {
    fn attach(&self, pid: u32, command: &AttachCommand) -> Result<()> {
        let (jar_entries, manifest) = match command {
            AttachCommand::JavaAgent { jar, .. } => read_jar(jar),
            AttachCommand::NativeAgent { .. } => (Vec::new(), String::new()),
        };
        self.records.lock().push(AttachRecord {
            pid,
            command: command.clone(),
            jar_entries,
            manifest,
        });
        if self.fail {
            return Err(Error::AttachFailure("status 100: agent refused".into()));
        }
        if let Some((slot, inst)) = &self.delivers {
            *slot.lock() = Some(inst.clone());
        }
        Ok(())
    }
}

/// Entry names in order, plus the manifest text.
pub fn read_jar(path: &Path) -> (Vec<String>, String) {
    use std::io::Read;

    let mut archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let names = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    let mut manifest = String::new();
    archive
        .by_name("META-INF/MANIFEST.MF")
        .unwrap()
        .read_to_string(&mut manifest)
        .unwrap();
    (names, manifest)
}

pub struct FakeRuntime {
    pub loader: Arc<dyn ClassLoader>,
    /// What the runtime offers without any agent.
    pub instrumentation: Arc<dyn Instrumentation>,
    pub delivered: Delivery,
}

impl AgentRuntime for FakeRuntime {
    fn boot_loader(&self) -> Arc<dyn ClassLoader> {
        self.loader.clone()
    }

    fn system_loader(&self) -> Result<Arc<dyn ClassLoader>> {
        Ok(self.loader.clone())
    }

    fn instrumentation(&self) -> Result<Arc<dyn Instrumentation>> {
        Ok(self.instrumentation.clone())
    }

    fn delivered_instrumentation(&self) -> Result<Option<Arc<dyn Instrumentation>>> {
        Ok(self.delivered.lock().clone())
    }
}
