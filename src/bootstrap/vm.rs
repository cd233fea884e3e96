//! Finding the JVM this code is running in.

use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, OnceLock};

use crate::bootstrap::AgentRuntime;
use crate::class::ClassLoader;
use crate::config::Options;
use crate::env::JavaVm;
use crate::error::{Error, Result};
use crate::instrument::{Instrumentation, JvmtiInstrumentation};
use crate::runtime::JniRuntime;
use crate::sys::jni;

static HANDED_OFF: OnceLock<JavaVm> = OnceLock::new();

/// Records the VM given to a native agent entry point (`Agent_OnLoad`,
/// `Agent_OnAttach`, or `JNI_OnLoad` when a Java agent loads the library).
///
/// The first non-null VM wins; the JVM never hands out a second one.
pub fn hand_off(vm: *mut jni::JavaVM) {
    if vm.is_null() {
        return;
    }
    // SAFETY: entry points receive a VM that outlives the agent.
    let vm = unsafe { JavaVm::from_raw(vm) };
    if HANDED_OFF.set(vm).is_ok() {
        tracing::debug!("JavaVM handed off by agent entry point");
    }
}

pub fn handed_off() -> Option<JavaVm> {
    HANDED_OFF.get().copied()
}

pub(crate) fn libjvm_filename() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "jvm.dll"
    }
    #[cfg(target_os = "macos")]
    {
        "libjvm.dylib"
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        "libjvm.so"
    }
}

fn candidates_from_java_home(java_home: &Path) -> Vec<PathBuf> {
    let filename = libjvm_filename();
    let arch = std::env::consts::ARCH;
    [
        format!("lib/server/{filename}"),
        format!("jre/lib/server/{filename}"),
        format!("lib/{arch}/server/{filename}"),
        format!("jre/lib/{arch}/server/{filename}"),
        format!("bin/server/{filename}"),
    ]
    .into_iter()
    .map(|r| java_home.join(r))
    .collect()
}

/// Places `libjvm` may live, most specific first: `tools.path` (a file or
/// a Java home), `JVM_LIB_PATH`, then `JAVA_HOME`.
pub fn libjvm_candidates(options: &Options) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(tools) = &options.tools_path {
        if tools.is_file() {
            out.push(tools.clone());
        } else {
            out.extend(candidates_from_java_home(tools));
        }
    }
    if let Some(path) = std::env::var_os("JVM_LIB_PATH") {
        out.push(PathBuf::from(path));
    }
    if let Some(java_home) = std::env::var_os("JAVA_HOME") {
        out.extend(candidates_from_java_home(Path::new(&java_home)));
    }
    out
}

fn first_created_vm(get_created: jni::JNI_GetCreatedJavaVMs) -> Option<JavaVm> {
    let mut vm: *mut jni::JavaVM = ptr::null_mut();
    let mut count: jni::jsize = 0;
    // SAFETY: one-slot buffer, as the JNI spec allows.
    let res = unsafe { get_created(&mut vm, 1, &mut count) };
    if res != jni::JNI_OK || count < 1 || vm.is_null() {
        return None;
    }
    Some(unsafe { JavaVm::from_raw(vm) })
}

#[cfg(unix)]
fn created_vm_in_process() -> Option<JavaVm> {
    let this = libloading::os::unix::Library::this();
    let get_created = unsafe {
        this.get::<jni::JNI_GetCreatedJavaVMs>(b"JNI_GetCreatedJavaVMs\0")
            .ok()?
    };
    first_created_vm(*get_created)
}

#[cfg(not(unix))]
fn created_vm_in_process() -> Option<JavaVm> {
    None
}

fn created_vm_in_library(path: &Path) -> Result<Option<JavaVm>> {
    let lib = unsafe { libloading::Library::new(path) }
        .map_err(|e| Error::AttachFailure(format!("cannot load {}: {e}", path.display())))?;
    let vm = {
        let get_created: libloading::Symbol<jni::JNI_GetCreatedJavaVMs> = unsafe {
            lib.get(b"JNI_GetCreatedJavaVMs\0")
                .map_err(|e| Error::AttachFailure(format!("{}: {e}", path.display())))?
        };
        first_created_vm(*get_created)
    };
    if vm.is_some() {
        // The VM lives in this library; keep it mapped for good.
        std::mem::forget(lib);
    }
    Ok(vm)
}

/// The running JVM: a handed-off VM first, then the one exported by the
/// process image, then any `libjvm` from [`libjvm_candidates`].
pub fn locate_vm(options: &Options) -> Result<JavaVm> {
    if let Some(vm) = handed_off() {
        return Ok(vm);
    }
    if let Some(vm) = created_vm_in_process() {
        tracing::debug!("found JavaVM in process image");
        return Ok(vm);
    }
    for candidate in libjvm_candidates(options) {
        if !candidate.exists() {
            continue;
        }
        match created_vm_in_library(&candidate) {
            Ok(Some(vm)) => {
                tracing::debug!(library = %candidate.display(), "found JavaVM");
                return Ok(vm);
            }
            Ok(None) => tracing::debug!(library = %candidate.display(), "no JavaVM created by library"),
            Err(e) => tracing::debug!(error = %e, "skipping libjvm candidate"),
        }
    }
    Err(Error::AttachFailure(format!(
        "no running JavaVM found; set tools.path, JVM_LIB_PATH or JAVA_HOME to locate {}",
        libjvm_filename()
    )))
}

/// [`AgentRuntime`] over the JVM hosting this process.
#[derive(Debug, Clone)]
pub struct JvmRuntime {
    jni: Arc<JniRuntime>,
}

impl JvmRuntime {
    pub fn new(vm: JavaVm) -> Self {
        Self { jni: JniRuntime::new(vm) }
    }

    pub fn locate(options: &Options) -> Result<Self> {
        locate_vm(options).map(Self::new)
    }

    pub fn jni(&self) -> &Arc<JniRuntime> {
        &self.jni
    }
}

impl AgentRuntime for JvmRuntime {
    fn boot_loader(&self) -> Arc<dyn ClassLoader> {
        self.jni.boot_loader()
    }

    fn system_loader(&self) -> Result<Arc<dyn ClassLoader>> {
        self.jni.system_loader()
    }

    fn instrumentation(&self) -> Result<Arc<dyn Instrumentation>> {
        let inst = JvmtiInstrumentation::install(self.jni.vm(), self.jni.clone())?;
        Ok(inst as Arc<dyn Instrumentation>)
    }

    fn delivered_instrumentation(&self) -> Result<Option<Arc<dyn Instrumentation>>> {
        let Some(vm) = handed_off() else {
            return Ok(None);
        };
        let inst = JvmtiInstrumentation::install(vm, self.jni.clone())?;
        Ok(Some(inst as Arc<dyn Instrumentation>))
    }
}
