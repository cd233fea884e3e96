//! [`Instrumentation`] on top of a JVMTI environment.
//!
//! Transformers are driven from the `ClassFileLoadHook` event. The event
//! fires on the thread that loads or retransforms the class, so a
//! `retransform_classes` call sees its transformers run before it returns.

use std::ffi::CStr;
use std::os::raw::{c_char, c_uchar};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use crate::class::{ClassLoader, ClassRef};
use crate::env::{JavaVm, JniEnv, Jvmti, LocalRef};
use crate::error::{Error, Result};
use crate::instrument::{ClassFileTransformer, Instrumentation, TransformerQueue};
use crate::runtime::{JniClass, JniRuntime};
use crate::sys::{jni, jvmti};

// The hook is a bare function pointer; this is where it finds its receiver.
static HOOK_TARGET: OnceLock<Arc<JvmtiInstrumentation>> = OnceLock::new();

/// The process's class-transformation capability, backed by JVMTI.
pub struct JvmtiInstrumentation {
    jvmti: Jvmti,
    runtime: Arc<JniRuntime>,
    transformers: TransformerQueue,
    can_retransform: bool,
    can_redefine: bool,
}

impl JvmtiInstrumentation {
    /// Creates the JVMTI environment, requests the retransform and redefine
    /// capabilities the VM offers and enables the class file load hook.
    ///
    /// Only one instance exists per process; later calls return it.
    pub fn install(vm: JavaVm, runtime: Arc<JniRuntime>) -> Result<Arc<Self>> {
        if let Some(existing) = HOOK_TARGET.get() {
            return Ok(existing.clone());
        }

        let jvmti = Jvmti::new(vm).map_err(|code| Error::Jni(format!("GetEnv(JVMTI) failed: {code}")))?;

        let potential = jvmti.get_potential_capabilities()?;
        let mut wanted = jvmti::jvmtiCapabilities::default();
        wanted.set_can_retransform_classes(potential.can_retransform_classes());
        wanted.set_can_redefine_classes(potential.can_redefine_classes());
        jvmti.add_capabilities(&wanted)?;
        let granted = jvmti.get_capabilities()?;

        let this = Arc::new(Self {
            jvmti,
            runtime,
            transformers: TransformerQueue::new(),
            can_retransform: granted.can_retransform_classes(),
            can_redefine: granted.can_redefine_classes(),
        });
        let target = HOOK_TARGET.get_or_init(|| this.clone()).clone();
        if !Arc::ptr_eq(&target, &this) {
            // Lost the race; nobody hooked the spare environment yet.
            let _ = this.jvmti.dispose_environment();
            return Ok(target);
        }

        let mut callbacks = jvmti::jvmtiEventCallbacks::default();
        callbacks.ClassFileLoadHook = Some(class_file_load_hook);
        this.jvmti.set_event_callbacks(callbacks)?;
        this.jvmti
            .set_event_notification_mode(true, jvmti::JVMTI_EVENT_CLASS_FILE_LOAD_HOOK)?;

        tracing::info!(
            retransform = this.can_retransform,
            redefine = this.can_redefine,
            "JVMTI instrumentation installed"
        );
        Ok(this)
    }

    pub fn runtime(&self) -> &Arc<JniRuntime> {
        &self.runtime
    }

    fn raw_class(class: &ClassRef) -> Result<jni::jclass> {
        class
            .downcast_ref::<JniClass>()
            .map(JniClass::raw)
            .ok_or_else(|| Error::Jni(format!("{class} is not a class of this JVM")))
    }

    /// Runs the transformers over one class and returns the replacement, if any.
    fn transform(
        &self,
        env: &JniEnv,
        class_being_redefined: jni::jclass,
        loader: jni::jobject,
        name: Option<&str>,
        bytes: &[u8],
    ) -> Option<Vec<u8>> {
        let registrations = self.transformers.snapshot();
        let retransforming = !class_being_redefined.is_null();
        if registrations.is_empty() {
            return None;
        }

        let loader: Option<Arc<dyn ClassLoader>> = match self.runtime.loader_for(env, loader) {
            Ok(loader) => loader,
            Err(e) => {
                tracing::debug!(class = ?name, error = %e, "cannot resolve defining loader");
                None
            }
        };
        let redefined = if retransforming {
            match self.runtime.class_from_local(env, class_being_redefined) {
                Ok(class) => Some(class),
                Err(e) => {
                    tracing::debug!(class = ?name, error = %e, "cannot resolve class being redefined");
                    None
                }
            }
        } else {
            None
        };

        let mut current: Option<Vec<u8>> = None;
        for reg in registrations.iter() {
            // Transformers registered without retransform support only see initial loads.
            if retransforming && !reg.can_retransform {
                continue;
            }
            let input = current.as_deref().unwrap_or(bytes);
            if let Some(out) = reg
                .transformer
                .transform(loader.as_ref(), name, redefined.as_ref(), input)
            {
                current = Some(out);
            }
        }
        current.filter(|out| out.as_slice() != bytes)
    }
}

impl Instrumentation for JvmtiInstrumentation {
    fn add_transformer(&self, transformer: Arc<dyn ClassFileTransformer>, can_retransform: bool) {
        self.transformers.push(transformer, can_retransform);
    }

    fn remove_transformer(&self, transformer: &Arc<dyn ClassFileTransformer>) -> bool {
        self.transformers.remove(transformer)
    }

    fn retransform_classes(&self, classes: &[ClassRef]) -> Result<()> {
        if !self.can_retransform {
            return Err(Error::Jvmti(jvmti::jvmtiError::MUST_POSSESS_CAPABILITY));
        }
        let raw = classes.iter().map(Self::raw_class).collect::<Result<Vec<_>>>()?;
        self.jvmti.retransform_classes(&raw)?;
        Ok(())
    }

    fn redefine_class(&self, class: &ClassRef, bytes: &[u8]) -> Result<()> {
        if !self.can_redefine {
            return Err(Error::Jvmti(jvmti::jvmtiError::MUST_POSSESS_CAPABILITY));
        }
        let definition = jvmti::jvmtiClassDefinition {
            klass: Self::raw_class(class)?,
            class_byte_count: bytes.len() as jni::jint,
            class_bytes: bytes.as_ptr(),
        };
        self.jvmti.redefine_classes(std::slice::from_ref(&definition))?;
        Ok(())
    }

    fn is_modifiable_class(&self, class: &ClassRef) -> Result<bool> {
        Ok(self.jvmti.is_modifiable_class(Self::raw_class(class)?)?)
    }

    fn is_retransform_classes_supported(&self) -> bool {
        self.can_retransform
    }

    fn is_redefine_classes_supported(&self) -> bool {
        self.can_redefine
    }

    fn all_loaded_classes(&self) -> Result<Vec<ClassRef>> {
        let env = self.runtime.vm().env()?;
        let locals = self.jvmti.get_loaded_classes()?;
        let mut out = Vec::with_capacity(locals.len());
        for cls in locals {
            let cls = LocalRef::new(&env, cls);
            match self.runtime.class_from_local(&env, cls.get()) {
                Ok(class) => out.push(class),
                Err(e) => tracing::trace!(error = %e, "skipping loaded class"),
            }
        }
        Ok(out)
    }
}

unsafe extern "system" fn class_file_load_hook(
    jvmti_env: *mut jvmti::jvmtiEnv,
    jni_env: *mut jni::JNIEnv,
    class_being_redefined: jni::jclass,
    loader: jni::jobject,
    name: *const c_char,
    _protection_domain: jni::jobject,
    class_data_len: jni::jint,
    class_data: *const c_uchar,
    new_class_data_len: *mut jni::jint,
    new_class_data: *mut *mut c_uchar,
) {
    let Some(target) = HOOK_TARGET.get() else {
        return;
    };
    if class_data.is_null() || class_data_len < 0 {
        return;
    }
    let env = JniEnv::from_raw(jni_env);
    let name = if name.is_null() { None } else { CStr::from_ptr(name).to_str().ok() };
    let bytes = std::slice::from_raw_parts(class_data, class_data_len as usize);

    // A panic must not unwind into the VM.
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        target.transform(&env, class_being_redefined, loader, name, bytes)
    }));
    let replacement = match result {
        Ok(Some(replacement)) => replacement,
        Ok(None) => return,
        Err(_) => {
            tracing::error!(class = ?name, "class file transformer panicked");
            return;
        }
    };

    let hook_env = Jvmti::from_raw(jvmti_env);
    match hook_env.allocate(replacement.len() as jni::jlong) {
        Ok(mem) => {
            std::ptr::copy_nonoverlapping(replacement.as_ptr(), mem, replacement.len());
            *new_class_data_len = replacement.len() as jni::jint;
            *new_class_data = mem;
        }
        Err(e) => tracing::error!(class = ?name, error = %e, "cannot allocate transformed class bytes"),
    }
}
