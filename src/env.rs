//! High-level environment wrappers for JVMTI and JNI.
//!
//! ```rust,ignore
//! use jvmti_classbytes::env::{JavaVm, Jvmti};
//!
//! let vm = unsafe { JavaVm::from_raw(raw_vm) };
//! let jvmti = Jvmti::new(vm).expect("no JVMTI");
//! let caps = jvmti.get_potential_capabilities()?;
//! println!("can retransform: {}", caps.can_retransform_classes());
//! ```
//!
//! - [`JavaVm`]: the process-wide VM handle; yields a [`JniEnv`] per thread
//! - [`Jvmti`]: capabilities, events, class retransformation, system properties
//! - [`LocalRef`] / [`GlobalRef`]: RAII reference guards

pub use crate::jni_wrapper::{GlobalRef, JavaVm, JniEnv, LocalRef};
pub use crate::jvmti_wrapper::Jvmti;
