//! # jvmti-classbytes
//!
//! Recover the class-file bytes of classes loaded in a running JVM, from Rust
//! code living inside that JVM (a native agent or a JNI library).
//!
//! Bytes come from whichever source has them first:
//!
//! 1. the defining loader's `.class` resource ([`collector::ClasspathCollector`])
//! 2. the JVM's debug dump directory for lambda and method-handle classes
//!    ([`collector::DumperCollector`])
//! 3. live retransformation through JVMTI ([`collector::InstrumentationCollector`])
//!
//! On top of that the crate parses constant pools ([`classfile`]), finds
//! nested classes ([`discovery`]) and hands everything to a decompiler of
//! your choice ([`source`]).
//!
//! ## Quick Start
//!
//! **1. Build a native agent:**
//! ```toml
//! [lib]
//! crate-type = ["cdylib"]
//!
//! [dependencies]
//! jvmti-classbytes = "0.3"
//! ```
//!
//! **2. Collect bytes once the VM is up:**
//! ```rust,ignore
//! use std::sync::{Arc, OnceLock};
//! use jvmti_classbytes::prelude::*;
//!
//! #[derive(Default)]
//! struct Dumper;
//!
//! impl Agent for Dumper {
//!     fn on_load(&self, _vm: *mut jni::JavaVM, options: &str) -> jni::jint {
//!         match Options::parse(options) {
//!             Ok(_) => jni::JNI_OK,
//!             Err(_) => jni::JNI_ERR,
//!         }
//!     }
//! }
//!
//! export_agent!(Dumper);
//!
//! static CHAIN: OnceLock<CollectorChain> = OnceLock::new();
//!
//! fn bytes_of(class: &ClassRef) -> jvmti_classbytes::Result<Option<ClassBytes>> {
//!     let chain = match CHAIN.get() {
//!         Some(chain) => chain,
//!         None => {
//!             let ctx = in_process_context(Arc::new(Options::from_env()?))?;
//!             CHAIN.get_or_init(|| CollectorChain::standard(&ctx))
//!         }
//!     };
//!     chain.get_bytes(Some(class))
//! }
//! ```
//!
//! **3. Run:**
//! ```bash
//! java -agentpath:./target/release/libmy_agent.so=probe.max=50 MyApp
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │      ClassSourceParser ──> Decompiler (yours)            │
//! ├─────────────────────────────────────────────────────────┤
//! │  CollectorChain          InnerClassDiscovery             │
//! │  classpath / dumper / instrumentation                    │
//! ├─────────────────────────────────────────────────────────┤
//! │  AgentHandle + InstrumentationGateway   AgentBootstrap   │
//! ├─────────────────────────────────────────────────────────┤
//! │  runtime (JNI class model)   instrument::jvmti (hook)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  env::Jvmti, env::JniEnv       sys::jni, sys::jvmti      │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything above the `runtime` layer works against the traits in
//! [`class`] and [`instrument`], so it runs without a JVM as well;
//! [`loader::ArchiveClassLoader`] serves classes from directories and jars.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`classfile`] | Constant-pool parser: own name and referenced classes |
//! | [`collector`] | Byte collectors and the priority chain |
//! | [`discovery`] | Member, anonymous and local class discovery |
//! | [`instrument`] | Instrumentation traits, gateway, JVMTI backend |
//! | [`bootstrap`] | Agent jar, dynamic attach, VM location |
//! | [`config`] | [`Options`] from agent options and environment |
//! | [`env`] | JNI and JVMTI wrappers |

pub mod sys;
pub mod env;

// Implementation modules (use `env` module for the public API)
#[doc(hidden)]
pub mod jvmti_wrapper;
#[doc(hidden)]
pub mod jni_wrapper;

pub mod bootstrap;
pub mod class;
pub mod classfile;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod error;
pub mod instrument;
pub mod loader;
pub mod names;
pub mod prelude;
pub mod runtime;
pub mod source;

use std::sync::OnceLock;

pub use crate::sys::jni;

pub use crate::bootstrap::{in_process_context, AgentBootstrap};
pub use crate::class::{ClassBytes, ClassKind, ClassLoader, ClassRef, JavaClass};
pub use crate::classfile::{enumerate_class_references, resolve_qualified_name};
pub use crate::collector::{ByteCollector, CollectorChain, CollectorContext, CollectorRegistry};
pub use crate::config::Options;
pub use crate::discovery::InnerClassDiscovery;
pub use crate::error::{Error, Result};
pub use crate::instrument::{AgentHandle, Instrumentation, InstrumentationGateway};
pub use crate::source::{ClassSourceParser, Decompiler};

/// A native agent hosting this crate.
///
/// Implement it and use [`export_agent!`] to produce the JVM entry points.
/// The entry points hand the `JavaVM` to [`bootstrap::hand_off`] before your
/// code runs, so the collectors find the VM without probing for `libjvm`.
///
/// # Thread Safety
///
/// The agent is stored in a process-wide `OnceLock` and may be called from
/// any JVM thread.
pub trait Agent: Sync + Send {
    /// Called from `Agent_OnLoad` (`-agentpath` at startup).
    ///
    /// Return `JNI_OK` (0) on success, or `JNI_ERR` (-1) on failure.
    fn on_load(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint;

    /// Called from `Agent_OnAttach` when the library is loaded into a
    /// running VM. Defaults to [`Agent::on_load`].
    fn on_attach(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint {
        self.on_load(vm, options)
    }

    /// Called when the agent is unloaded (JVM shutdown).
    fn on_unload(&self) {}
}

// Holds the user's Agent instance so the exported C functions can find it.
pub static GLOBAL_AGENT: OnceLock<Box<dyn Agent>> = OnceLock::new();

/// Helper to initialize the global agent (called by the macro)
pub fn set_global_agent(agent: Box<dyn Agent>) -> std::result::Result<(), ()> {
    GLOBAL_AGENT.set(agent).map_err(|_| ())
}

#[doc(hidden)]
pub unsafe fn agent_options<'a>(options: *const std::ffi::c_char) -> &'a str {
    if options.is_null() {
        ""
    } else {
        std::ffi::CStr::from_ptr(options).to_str().unwrap_or("")
    }
}

/// Exports your agent type as a loadable JVM agent library.
///
/// Generates `Agent_OnLoad`, `Agent_OnAttach` and `Agent_OnUnload`. The
/// type must implement [`Agent`] and [`Default`].
///
/// ```rust,ignore
/// use jvmti_classbytes::{Agent, export_agent, jni};
///
/// #[derive(Default)]
/// struct MyAgent;
///
/// impl Agent for MyAgent {
///     fn on_load(&self, _vm: *mut jni::JavaVM, _options: &str) -> jni::jint {
///         jni::JNI_OK
///     }
/// }
///
/// export_agent!(MyAgent);
/// ```
///
/// The crate must be built as a `cdylib`. Load it at startup with
/// `java -agentpath:./libmyagent.so=options MyApp`, or into a running VM
/// with [`bootstrap::AttachCommand::NativeAgent`].
///
/// Besides the agent entry points the macro exports `JNI_OnLoad`. All three
/// loading paths hand the `JavaVM` to [`bootstrap::hand_off`], which is where
/// an [`AgentBootstrap`] picks up the capability after attaching.
#[macro_export]
macro_rules! export_agent {
    ($agent_type:ty) => {
        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnLoad(
            vm: *mut $crate::sys::jni::JavaVM,
            options: *mut std::ffi::c_char,
            _reserved: *mut std::ffi::c_void,
        ) -> $crate::sys::jni::jint {
            $crate::bootstrap::hand_off(vm);
            let agent = Box::new(<$agent_type>::default());
            if $crate::set_global_agent(agent).is_err() {
                return $crate::sys::jni::JNI_ERR;
            }
            match $crate::GLOBAL_AGENT.get() {
                Some(agent) => agent.on_load(vm, $crate::agent_options(options)),
                None => $crate::sys::jni::JNI_ERR,
            }
        }

        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnAttach(
            vm: *mut $crate::sys::jni::JavaVM,
            options: *mut std::ffi::c_char,
            _reserved: *mut std::ffi::c_void,
        ) -> $crate::sys::jni::jint {
            $crate::bootstrap::hand_off(vm);
            // A second attach of the same library reuses the first instance.
            let _ = $crate::set_global_agent(Box::new(<$agent_type>::default()));
            match $crate::GLOBAL_AGENT.get() {
                Some(agent) => agent.on_attach(vm, $crate::agent_options(options)),
                None => $crate::sys::jni::JNI_ERR,
            }
        }

        // Reached when a Java agent `System.load`s this library after attach.
        #[no_mangle]
        pub unsafe extern "system" fn JNI_OnLoad(
            vm: *mut $crate::sys::jni::JavaVM,
            _reserved: *mut std::ffi::c_void,
        ) -> $crate::sys::jni::jint {
            $crate::bootstrap::hand_off(vm);
            $crate::sys::jni::JNI_VERSION_1_8
        }

        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnUnload(_vm: *mut $crate::sys::jni::JavaVM) {
            if let Some(agent) = $crate::GLOBAL_AGENT.get() {
                agent.on_unload();
            }
        }
    };
}
