use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Once;

use parking_lot::Mutex;
use walkdir::WalkDir;

use crate::class::{ClassBytes, ClassRef};
use crate::collector::{ByteCollector, CollectorContext};
use crate::config::CollectorOptions;
use crate::error::{Error, Result};
use crate::names;

/// The JVM debug flags that make it write generated classes under
/// `DUMP_CLASS_FILES`. Both must be set for the dump directory to be used.
pub const DUMP_PROPERTIES: [&str; 2] = [
    "jdk.internal.lambda.dumpProxyClasses",
    "java.lang.invoke.MethodHandle.DUMP_CLASS_FILES",
];

static CLEANUP_HOOK: Once = Once::new();
static CLEANUP_DIRS: Mutex<Vec<PathBuf>> = parking_lot::const_mutex(Vec::new());

/// Reads classes the JVM dumped for lambdas and method handles.
pub struct DumperCollector {
    settings: CollectorOptions,
    directory: PathBuf,
    active: bool,
}

impl DumperCollector {
    pub fn new(ctx: &CollectorContext) -> Self {
        let missing: Vec<&str> = DUMP_PROPERTIES
            .iter()
            .copied()
            .filter(|key| !is_truthy(ctx.properties.get(key).as_deref()))
            .collect();
        let active = missing.is_empty();
        let directory = ctx.options.dump_directory.clone();

        if ctx.options.dumper.enabled {
            if active {
                register_cleanup(&directory);
            } else {
                tracing::debug!(missing = ?missing, "class dump properties not set; dump directory ignored");
            }
        }

        Self {
            settings: ctx.options.dumper,
            directory,
            active,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl ByteCollector for DumperCollector {
    fn name(&self) -> &'static str {
        "dumper"
    }

    fn priority(&self) -> i32 {
        self.settings.priority
    }

    fn is_enabled(&self) -> bool {
        self.settings.enabled && self.active
    }

    fn try_get_bytes(&self, class: &ClassRef) -> Result<Option<ClassBytes>> {
        let resource = names::resource_path(class.name());
        let path = self.directory.join(&resource);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes.into())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::resource_read(path.display().to_string(), e)),
        }
    }
}

fn is_truthy(value: Option<&str>) -> bool {
    match value {
        None => false,
        Some(v) => {
            let v = v.trim();
            !v.is_empty() && !v.eq_ignore_ascii_case("false")
        }
    }
}

fn register_cleanup(directory: &Path) {
    {
        let mut dirs = CLEANUP_DIRS.lock();
        if !dirs.iter().any(|d| d == directory) {
            dirs.push(directory.to_path_buf());
        }
    }
    CLEANUP_HOOK.call_once(|| {
        // SAFETY: `cleanup_at_exit` is a plain extern "C" fn with no captured state.
        let rc = unsafe { libc::atexit(cleanup_at_exit) };
        if rc != 0 {
            tracing::warn!("could not register exit hook for class dump cleanup");
        }
    });
}

extern "C" fn cleanup_at_exit() {
    let dirs = std::mem::take(&mut *CLEANUP_DIRS.lock());
    for dir in dirs {
        if let Err(e) = remove_dump_tree(&dir) {
            tracing::warn!(path = %dir.display(), error = %e, "failed to remove class dump directory");
        }
    }
}

/// Deletes `root` and everything under it, children first.
///
/// Entries that cannot be removed for lack of permission are skipped and
/// logged; any other failure stops the walk. A missing `root` is not an error.
pub fn remove_dump_tree(root: &Path) -> io::Result<()> {
    if !root.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf);
                let io_err = io::Error::from(e);
                if io_err.kind() == io::ErrorKind::PermissionDenied {
                    tracing::debug!(path = ?path, "skipping unreadable dump entry");
                    continue;
                }
                return Err(io_err);
            }
        };
        let path = entry.path();
        let removed = if entry.file_type().is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        match removed {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                tracing::debug!(path = %path.display(), "permission denied removing dump entry");
            }
            // A denied child leaves its directory non-empty.
            Err(_) if entry.file_type().is_dir() && fs::read_dir(path).map_or(false, |mut d| d.next().is_some()) => {
                tracing::debug!(path = %path.display(), "dump directory not empty after cleanup");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!is_truthy(None));
        assert!(!is_truthy(Some("")));
        assert!(!is_truthy(Some("FALSE")));
        assert!(is_truthy(Some("true")));
        assert!(is_truthy(Some("DUMP_CLASS_FILES")));
    }

    #[test]
    fn removes_nested_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("DUMP_CLASS_FILES");
        fs::create_dir_all(root.join("java/lang/invoke")).unwrap();
        fs::write(root.join("java/lang/invoke/LambdaForm$MH.class"), b"x").unwrap();
        fs::write(root.join("Top.class"), b"y").unwrap();

        remove_dump_tree(&root).unwrap();
        assert!(!root.exists());
        remove_dump_tree(&root).unwrap();
    }
}
