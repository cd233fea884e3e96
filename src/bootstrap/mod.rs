//! Getting hold of the live instrumentation capability.
//!
//! An agent is attached to this very process and hands the capability back
//! from its entry point. Two kinds of agent are supported:
//!
//! - a native library (`agent.library`) exported with [`export_agent!`],
//!   whose `Agent_OnAttach` calls [`hand_off`] with the `JavaVM`;
//! - an agent jar built from `agent.class` and its companions, whose agent
//!   class is expected to `System.load` such a library, which hands off the
//!   VM from `JNI_OnLoad`.
//!
//! With neither configured the in-process JVMTI environment is used as is.
//!
//! ```text
//! Options ──> AgentBootstrap ── build jar ──> attach(pid) ──> delete jar (default policy)
//!                   │                             │
//!                   │                  Agent_OnAttach / JNI_OnLoad ──> hand_off(vm)
//!                   │                                                     │
//!                   └──── AgentRuntime::delivered_instrumentation() <─────┘ ──> AgentHandle
//! ```
//!
//! [`export_agent!`]: crate::export_agent

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::class::{ClassBytes, ClassLoader, ClassRef};
use crate::collector::{ByteCollector, ClasspathCollector, CollectorContext};
use crate::config::{ArtifactPolicy, Options};
use crate::env::Jvmti;
use crate::error::{Error, Result};
use crate::instrument::{Instrumentation, InstrumentationSource};
use crate::names;
use crate::runtime::JvmtiProperties;

pub mod attach;
pub mod vm;

pub use attach::{AttachCommand, AttachProvider, HotSpotAttach};
pub use vm::{hand_off, locate_vm, JvmRuntime};

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

// Manifest lines are limited to 72 bytes, continuation lines start with a space.
const MANIFEST_LINE_LIMIT: usize = 72;

/// The host a bootstrap runs in.
pub trait AgentRuntime: Send + Sync {
    /// Resolves resources for classes that report no loader.
    fn boot_loader(&self) -> Arc<dyn ClassLoader>;

    /// Where the agent class and its companions are looked up by name.
    fn system_loader(&self) -> Result<Arc<dyn ClassLoader>>;

    /// The capability available without attaching anything.
    fn instrumentation(&self) -> Result<Arc<dyn Instrumentation>>;

    /// The capability handed over by an attached agent, if one has.
    fn delivered_instrumentation(&self) -> Result<Option<Arc<dyn Instrumentation>>>;
}

fn push_attribute(out: &mut String, name: &str, value: &str) {
    let line = format!("{name}: {value}");
    let mut rest = line.as_str();
    let mut limit = MANIFEST_LINE_LIMIT;
    loop {
        let mut cut = rest.len().min(limit);
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        out.push_str(&rest[..cut]);
        out.push_str("\r\n");
        rest = &rest[cut..];
        if rest.is_empty() {
            break;
        }
        out.push(' ');
        limit = MANIFEST_LINE_LIMIT - 1;
    }
}

/// Manifest text for an agent jar whose entry point is `agent_class`.
///
/// `extra` attributes follow the standard ones in the order given.
pub fn agent_manifest(agent_class: &str, extra: &[(String, String)]) -> String {
    let mut out = String::new();
    push_attribute(&mut out, "Manifest-Version", "1.0");
    push_attribute(&mut out, "Created-By", concat!("jvmti-classbytes ", env!("CARGO_PKG_VERSION")));
    push_attribute(&mut out, "Agent-Class", agent_class);
    push_attribute(&mut out, "Premain-Class", agent_class);
    push_attribute(&mut out, "Can-Retransform-Classes", "true");
    push_attribute(&mut out, "Can-Redefine-Classes", "true");
    for (name, value) in extra {
        push_attribute(&mut out, name, value);
    }
    out.push_str("\r\n");
    out
}

/// Writes an agent jar: the manifest first, then one entry per class.
///
/// `classes` pairs a resource path (`a/b/C.class`) with its bytes.
pub fn write_agent_jar(
    path: &Path,
    agent_class: &str,
    classes: &[(String, ClassBytes)],
    extra: &[(String, String)],
) -> Result<()> {
    let build_err = |e: &dyn std::fmt::Display| Error::ArtifactBuildFailure(format!("{}: {e}", path.display()));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| build_err(&e))?;
    }
    let file = File::create(path).map_err(|e| build_err(&e))?;
    let mut jar = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    jar.start_file(MANIFEST_PATH, options).map_err(|e| build_err(&e))?;
    jar.write_all(agent_manifest(agent_class, extra).as_bytes())
        .map_err(|e| build_err(&e))?;
    for (resource, bytes) in classes {
        jar.start_file(resource.as_str(), options).map_err(|e| build_err(&e))?;
        jar.write_all(bytes.as_slice()).map_err(|e| build_err(&e))?;
    }
    jar.finish().map_err(|e| build_err(&e))?;
    Ok(())
}

/// Builds, attaches and cleans up the agent artifact, then hands out the
/// instrumentation capability.
pub struct AgentBootstrap {
    options: Arc<Options>,
    attach: Arc<dyn AttachProvider>,
    runtime: Arc<dyn AgentRuntime>,
    attached: Mutex<bool>,
}

impl AgentBootstrap {
    pub fn new(options: Arc<Options>, attach: Arc<dyn AttachProvider>, runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            options,
            attach,
            runtime,
            attached: Mutex::new(false),
        }
    }

    /// A bootstrap for the JVM hosting this process, attaching through HotSpot.
    pub fn for_current_jvm(options: Arc<Options>) -> Result<Self> {
        let runtime = Arc::new(JvmRuntime::locate(&options)?);
        let attach = Arc::new(HotSpotAttach::new(&options));
        Ok(Self::new(options, attach, runtime))
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Packages `agent` and `extra` into the configured artifact path.
    ///
    /// Bytes come from the classpath only; live instrumentation is what this
    /// artifact is for.
    pub fn build_agent_artifact(
        &self,
        agent: &ClassRef,
        extra: &[ClassRef],
        manifest_attributes: &[(String, String)],
    ) -> Result<PathBuf> {
        let collector = ClasspathCollector::with_boot_loader(self.runtime.boot_loader());
        let mut entries = Vec::with_capacity(extra.len() + 1);
        for class in std::iter::once(agent).chain(extra) {
            let bytes = collector
                .try_get_bytes(class)
                .map_err(|e| Error::ArtifactBuildFailure(format!("{class}: {e}")))?
                .ok_or_else(|| Error::ArtifactBuildFailure(format!("bytes of {class} not found on the classpath")))?;
            entries.push((names::resource_path(class.name()), bytes));
        }

        let path = self.options.artifact_path();
        write_agent_jar(&path, agent.name(), &entries, manifest_attributes)?;
        tracing::info!(path = %path.display(), classes = entries.len(), "built agent artifact");
        Ok(path)
    }

    /// Loads the agent jar at `artifact` into this process.
    pub fn attach_to_current_process(&self, artifact: &Path, args: &str) -> Result<()> {
        let jar = existing(artifact)?;
        self.attach.attach(std::process::id(), &AttachCommand::JavaAgent {
            jar,
            args: args.to_string(),
        })?;
        tracing::info!(path = %artifact.display(), "agent attached");
        Ok(())
    }

    /// Loads the native agent `library` into this process.
    pub fn attach_native_agent(&self, library: &Path, args: &str) -> Result<()> {
        let library = existing(library)?;
        self.attach.attach(std::process::id(), &AttachCommand::NativeAgent {
            library: library.clone(),
            args: args.to_string(),
        })?;
        tracing::info!(library = %library.display(), "native agent attached");
        Ok(())
    }

    fn agent_configured(&self) -> bool {
        self.options.agent.library.is_some() || self.options.agent.agent_class.is_some()
    }

    /// Attaches the configured agent, once: the native library when one is
    /// set, otherwise the jar built (or reused) for `agent.class`.
    ///
    /// Does nothing when no agent is configured.
    pub fn ensure_agent_attached(&self) -> Result<()> {
        if !self.agent_configured() {
            return Ok(());
        }
        let mut attached = self.attached.lock();
        if *attached {
            return Ok(());
        }
        let agent = &self.options.agent;
        match (&agent.library, &agent.agent_class) {
            (Some(library), _) => self.attach_native_agent(library, &agent.args)?,
            (None, Some(agent_class)) => self.attach_agent_jar(agent_class)?,
            (None, None) => return Ok(()),
        }
        *attached = true;
        Ok(())
    }

    fn attach_agent_jar(&self, agent_class: &str) -> Result<()> {
        let policy = self.options.agent.cache;
        let path = self.options.artifact_path();
        if policy == ArtifactPolicy::ReuseCached && path.is_file() {
            tracing::debug!(path = %path.display(), "reusing cached agent artifact");
        } else {
            let loader = self.runtime.system_loader()?;
            let agent = lookup(&*loader, agent_class)?;
            let companions = self
                .options
                .agent
                .companions
                .iter()
                .map(|name| lookup(&*loader, name))
                .collect::<Result<Vec<_>>>()?;
            self.build_agent_artifact(&agent, &companions, &[])?;
        }

        let result = self.attach_to_current_process(&path, &self.options.agent.args);
        if policy == ArtifactPolicy::BuildAttachDelete {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "could not delete agent artifact");
            }
        }
        result
    }
}

fn existing(path: &Path) -> Result<PathBuf> {
    if !path.is_file() {
        return Err(Error::ArtifactNotFound(path.to_path_buf()));
    }
    Ok(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()))
}

fn lookup(loader: &dyn ClassLoader, name: &str) -> Result<ClassRef> {
    loader
        .load_class(name)
        .map_err(|e| Error::ArtifactBuildFailure(format!("{name}: {e}")))?
        .ok_or_else(|| Error::ArtifactBuildFailure(format!("class {name} not found")))
}

impl InstrumentationSource for AgentBootstrap {
    fn acquire(&self) -> Result<Arc<dyn Instrumentation>> {
        if !self.agent_configured() {
            return self.runtime.instrumentation();
        }
        self.ensure_agent_attached()?;
        self.runtime.delivered_instrumentation()?.ok_or_else(|| {
            Error::AttachFailure("agent attached but never handed over the JavaVM (see bootstrap::hand_off)".into())
        })
    }
}

// One JVMTI environment for system properties, shared by every context.
static PROPERTIES_ENV: OnceLock<Jvmti> = OnceLock::new();

/// The value in `slot`, creating it on first use. When two threads race,
/// the loser's value is passed to `discard`.
fn shared<T: Copy>(slot: &OnceLock<T>, create: impl FnOnce() -> Result<T>, discard: impl FnOnce(T)) -> Result<T> {
    if let Some(value) = slot.get() {
        return Ok(*value);
    }
    let value = create()?;
    match slot.set(value) {
        Ok(()) => Ok(value),
        Err(ours) => {
            discard(ours);
            slot.get().copied().ok_or_else(|| Error::Jni("shared environment vanished".into()))
        }
    }
}

/// A collector context for the JVM hosting this process.
///
/// Nothing is attached until the instrumentation collector first needs it.
/// Contexts share one JVMTI environment for property reads, so building one
/// per lookup does not leak environments.
pub fn in_process_context(options: Arc<Options>) -> Result<CollectorContext> {
    let runtime = JvmRuntime::locate(&options)?;
    let vm = runtime.jni().vm();
    let jvmti = shared(
        &PROPERTIES_ENV,
        || Jvmti::new(vm).map_err(|code| Error::Jni(format!("GetEnv(JVMTI) failed: {code}"))),
        |env| {
            if let Err(e) = env.dispose_environment() {
                tracing::debug!(error = %e, "could not dispose surplus JVMTI environment");
            }
        },
    )?;
    let boot_loader = runtime.boot_loader();
    let attach = Arc::new(HotSpotAttach::new(&options));
    let bootstrap = AgentBootstrap::new(options.clone(), attach, Arc::new(runtime));
    Ok(CollectorContext::new(
        options,
        boot_loader,
        Arc::new(JvmtiProperties(jvmti)),
        Arc::new(bootstrap),
    ))
}
