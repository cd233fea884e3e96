//! The class model the collectors and discovery work against.
//!
//! A live JVM supplies these through JNI (see [`crate::runtime`]); offline
//! tooling and tests use [`crate::loader::ArchiveClassLoader`].

use std::any::Any;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::{self, Read};
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use crate::classfile;
use crate::error::Result;
use crate::names;

/// Identity of a class loader. `BOOT_LOADER` stands for "no loader".
pub type LoaderId = u64;

pub const BOOT_LOADER: LoaderId = 0;

/// How a class is declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassKind {
    Primitive,
    Array,
    TopLevel,
    Member,
    Local,
    Anonymous,
}

impl ClassKind {
    /// Guesses the kind from a binary name using javac's naming scheme:
    /// `Outer$Inner` is a member, `Outer$1` anonymous, `Outer$1Local` local.
    pub fn from_binary_name(name: &str) -> ClassKind {
        if name.starts_with('[') {
            return ClassKind::Array;
        }
        let simple = names::simple_binary_name(name);
        let Some((_, last)) = simple.rsplit_once('$') else {
            return ClassKind::TopLevel;
        };
        let digits = last.bytes().take_while(u8::is_ascii_digit).count();
        match (digits, last.len()) {
            (0, 0) => ClassKind::TopLevel,
            (0, _) => ClassKind::Member,
            (d, len) if d == len => ClassKind::Anonymous,
            _ => ClassKind::Local,
        }
    }
}

/// A loaded (or loadable) JVM class.
pub trait JavaClass: Send + Sync + fmt::Debug {
    /// Binary name in source form, e.g. `com.example.Outer$Inner`.
    fn name(&self) -> &str;

    fn kind(&self) -> ClassKind;

    /// The defining loader; `None` for the boot loader.
    fn loader(&self) -> Option<Arc<dyn ClassLoader>>;

    /// Member classes declared directly by this class.
    fn declared_classes(&self) -> Result<Vec<ClassRef>>;

    fn as_any(&self) -> &dyn Any;
}

/// A source of class resources and class definitions.
pub trait ClassLoader: Send + Sync + fmt::Debug {
    fn id(&self) -> LoaderId;

    /// Opens a resource such as `com/example/Foo.class`.
    ///
    /// `Ok(None)` means the resource does not exist.
    fn open_resource(&self, path: &str) -> io::Result<Option<Box<dyn Read + Send>>>;

    /// Looks a class up by binary name. `Ok(None)` means class-not-found.
    fn load_class(&self, name: &str) -> Result<Option<ClassRef>>;
}

/// Shared handle to a class.
///
/// Two handles are equal when they name the same class in the same loader,
/// so they can be collected into sets without duplicates.
#[derive(Clone)]
pub struct ClassRef(Arc<dyn JavaClass>);

impl ClassRef {
    pub fn new<C: JavaClass + 'static>(class: C) -> Self {
        ClassRef(Arc::new(class))
    }

    pub fn from_arc(class: Arc<dyn JavaClass>) -> Self {
        ClassRef(class)
    }

    pub fn internal_name(&self) -> String {
        names::to_internal_name(self.0.name())
    }

    pub fn loader_id(&self) -> LoaderId {
        self.0.loader().map_or(BOOT_LOADER, |l| l.id())
    }

    pub fn key(&self) -> ClassKey {
        ClassKey {
            name: self.0.name().to_string(),
            loader: self.loader_id(),
        }
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }
}

impl Deref for ClassRef {
    type Target = dyn JavaClass;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for ClassRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.name() == other.0.name() && self.loader_id() == other.loader_id())
    }
}

impl Eq for ClassRef {}

impl Hash for ClassRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.name().hash(state);
        self.loader_id().hash(state);
    }
}

impl fmt::Debug for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.0.name(), self.loader_id())
    }
}

impl fmt::Display for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.name())
    }
}

/// Owned identity of a class: binary name plus loader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassKey {
    pub name: String,
    pub loader: LoaderId,
}

/// The bytes of one class file. Immutable once produced.
#[derive(Clone, PartialEq, Eq)]
pub struct ClassBytes(Arc<[u8]>);

impl ClassBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// The `this_class` name recorded in the bytes.
    pub fn qualified_name(&self) -> Result<String> {
        classfile::resolve_qualified_name(&self.0)
    }

    /// Writes the bytes to `path`, creating parent directories.
    pub fn write_to(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &self.0)
    }
}

impl From<Vec<u8>> for ClassBytes {
    fn from(v: Vec<u8>) -> Self {
        ClassBytes(v.into())
    }
}

impl From<&[u8]> for ClassBytes {
    fn from(v: &[u8]) -> Self {
        ClassBytes(v.into())
    }
}

impl AsRef<[u8]> for ClassBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ClassBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassBytes({} bytes)", self.0.len())
    }
}
