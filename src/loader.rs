//! A class loader over exploded directories and jar files.
//!
//! Used where no live JVM is available: inspecting a classpath on disk,
//! building agent jars from compiled classes, and tests.

use std::any::Any;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::class::{ClassKind, ClassLoader, ClassRef, JavaClass, LoaderId};
use crate::classfile;
use crate::error::{Error, Result};
use crate::names;

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

/// One classpath entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassRoot {
    Directory(PathBuf),
    Jar(PathBuf),
}

impl ClassRoot {
    /// Picks the root kind from the path: `.jar`/`.zip` files are archives.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let is_archive = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("jar") || e.eq_ignore_ascii_case("zip"));
        if is_archive {
            ClassRoot::Jar(path)
        } else {
            ClassRoot::Directory(path)
        }
    }

    fn open(&self, jar_cache: &JarCache, resource: &str) -> io::Result<Option<Vec<u8>>> {
        match self {
            ClassRoot::Directory(dir) => match fs::read(dir.join(resource)) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            },
            ClassRoot::Jar(jar) => jar_cache.with(jar, |archive| {
                let mut entry = match archive.by_name(resource) {
                    Ok(entry) => entry,
                    Err(ZipError::FileNotFound) => return Ok(None),
                    Err(e) => return Err(zip_to_io(e)),
                };
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut bytes)?;
                Ok(Some(bytes))
            }),
        }
    }

    /// Simple names (`Outer$Inner`) of the classes in one package.
    fn list_package(&self, jar_cache: &JarCache, package: &str) -> io::Result<Vec<String>> {
        let mut out = Vec::new();
        match self {
            ClassRoot::Directory(dir) => {
                let pkg_dir = if package.is_empty() { dir.clone() } else { dir.join(package) };
                let entries = match fs::read_dir(&pkg_dir) {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
                    Err(e) => return Err(e),
                };
                for entry in entries {
                    let entry = entry?;
                    let file_name = entry.file_name();
                    if let Some(stem) = file_name.to_str().and_then(|n| n.strip_suffix(".class")) {
                        out.push(stem.to_string());
                    }
                }
            }
            ClassRoot::Jar(jar) => {
                let prefix = if package.is_empty() { String::new() } else { format!("{package}/") };
                jar_cache.with(jar, |archive| {
                    for name in archive.file_names() {
                        let Some(rest) = name.strip_prefix(prefix.as_str()) else { continue };
                        if rest.contains('/') {
                            continue;
                        }
                        if let Some(stem) = rest.strip_suffix(".class") {
                            out.push(stem.to_string());
                        }
                    }
                    Ok(())
                })?;
            }
        }
        Ok(out)
    }
}

/// A jar opened on first use and kept open, so its central directory is
/// read once per loader. Changes to the file afterwards are not seen.
#[derive(Default)]
struct JarCache(Mutex<Option<ZipArchive<File>>>);

impl JarCache {
    fn with<T>(&self, path: &Path, f: impl FnOnce(&mut ZipArchive<File>) -> io::Result<T>) -> io::Result<T> {
        let mut slot = self.0.lock();
        let mut archive = match slot.take() {
            Some(archive) => archive,
            None => open_archive(path)?,
        };
        let result = f(&mut archive);
        *slot = Some(archive);
        result
    }
}

impl std::fmt::Debug for JarCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self.0.try_lock().map(|slot| slot.is_some());
        f.debug_struct("JarCache").field("open", &open).finish()
    }
}

fn open_archive(path: &Path) -> io::Result<ZipArchive<File>> {
    ZipArchive::new(File::open(path)?).map_err(zip_to_io)
}

fn zip_to_io(err: ZipError) -> io::Error {
    match err {
        ZipError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Loads classes from a list of [`ClassRoot`]s, asking `parent` first.
#[derive(Debug)]
pub struct ArchiveClassLoader {
    id: LoaderId,
    roots: Vec<ClassRoot>,
    // One per root, same order; unused for directories.
    jars: Vec<JarCache>,
    parent: Option<Arc<dyn ClassLoader>>,
    this: Weak<ArchiveClassLoader>,
}

impl ArchiveClassLoader {
    pub fn new(roots: Vec<ClassRoot>) -> Arc<Self> {
        Self::with_parent(roots, None)
    }

    pub fn with_parent(roots: Vec<ClassRoot>, parent: Option<Arc<dyn ClassLoader>>) -> Arc<Self> {
        let jars = roots.iter().map(|_| JarCache::default()).collect();
        Arc::new_cyclic(|this| ArchiveClassLoader {
            id: NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed),
            roots,
            jars,
            parent,
            this: this.clone(),
        })
    }

    pub fn roots(&self) -> &[ClassRoot] {
        &self.roots
    }

    fn read_resource(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        for (root, jar) in self.roots.iter().zip(&self.jars) {
            if let Some(bytes) = root.open(jar, path)? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    fn member_names(&self, outer: &str) -> io::Result<Vec<String>> {
        let internal = names::to_internal_name(outer);
        let (package, simple) = match internal.rsplit_once('/') {
            Some((package, simple)) => (package.to_string(), simple.to_string()),
            None => (String::new(), internal.clone()),
        };
        let prefix = format!("{simple}$");
        let mut members = Vec::new();
        for (root, jar) in self.roots.iter().zip(&self.jars) {
            for candidate in root.list_package(jar, &package)? {
                let Some(rest) = candidate.strip_prefix(prefix.as_str()) else { continue };
                let direct = !rest.is_empty()
                    && !rest.contains('$')
                    && !rest.starts_with(|c: char| c.is_ascii_digit());
                if direct {
                    let name = format!("{outer}${rest}");
                    if !members.contains(&name) {
                        members.push(name);
                    }
                }
            }
        }
        Ok(members)
    }
}

impl ClassLoader for ArchiveClassLoader {
    fn id(&self) -> LoaderId {
        self.id
    }

    fn open_resource(&self, path: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        if let Some(parent) = &self.parent {
            if let Some(stream) = parent.open_resource(path)? {
                return Ok(Some(stream));
            }
        }
        Ok(self
            .read_resource(path)?
            .map(|bytes| Box::new(Cursor::new(bytes)) as Box<dyn Read + Send>))
    }

    fn load_class(&self, name: &str) -> Result<Option<ClassRef>> {
        if let Some(parent) = &self.parent {
            if let Some(class) = parent.load_class(name)? {
                return Ok(Some(class));
            }
        }
        if name.starts_with('[') {
            return Ok(None);
        }
        let resource = names::resource_path(name);
        let Some(bytes) = self
            .read_resource(&resource)
            .map_err(|e| Error::resource_read(resource.clone(), e))?
        else {
            return Ok(None);
        };
        let defined = classfile::resolve_qualified_name(&bytes)?;
        if defined != name {
            tracing::debug!(requested = name, defined = %defined, "class file defines a different class");
            return Ok(None);
        }
        let Some(loader) = self.this.upgrade() else {
            return Ok(None);
        };
        Ok(Some(ClassRef::new(ArchiveClass {
            kind: ClassKind::from_binary_name(name),
            name: defined,
            loader,
        })))
    }
}

/// A class defined by an [`ArchiveClassLoader`].
#[derive(Debug)]
pub struct ArchiveClass {
    name: String,
    kind: ClassKind,
    loader: Arc<ArchiveClassLoader>,
}

impl JavaClass for ArchiveClass {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ClassKind {
        self.kind
    }

    fn loader(&self) -> Option<Arc<dyn ClassLoader>> {
        Some(self.loader.clone())
    }

    fn declared_classes(&self) -> Result<Vec<ClassRef>> {
        let names = self
            .loader
            .member_names(&self.name)
            .map_err(|e| Error::resource_read(names::to_internal_name(&self.name), e))?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(class) = self.loader.load_class(&name)? {
                out.push(class);
            }
        }
        Ok(out)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
