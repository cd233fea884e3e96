//! Common imports for agents that collect class bytes.
//!
//! This prelude is intentionally small. It covers what most agents touch
//! while avoiding over-broad re-exports.

pub use crate::bootstrap::in_process_context;
pub use crate::class::{ClassBytes, ClassKind, ClassRef};
pub use crate::collector::{CollectorChain, CollectorContext};
pub use crate::config::Options;
pub use crate::discovery::InnerClassDiscovery;
pub use crate::env::{JniEnv, Jvmti};
pub use crate::export_agent;
pub use crate::sys::{jni, jvmti};
pub use crate::Agent;
