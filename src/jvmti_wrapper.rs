use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use crate::jni_wrapper::JavaVm;
use crate::sys::jni;
use crate::sys::jvmti;

// Looks a function up in the JVMTI table. A null slot is reported as
// NOT_AVAILABLE instead of panicking.
macro_rules! jvmti_fn {
    ($env:expr, $name:ident) => {
        (*(*$env).functions).$name.ok_or(jvmti::jvmtiError::NOT_AVAILABLE)?
    };
}

fn check(err: jvmti::jvmtiError) -> Result<(), jvmti::jvmtiError> {
    if err == jvmti::jvmtiError::NONE { Ok(()) } else { Err(err) }
}

/// A safe wrapper around the raw JVMTI environment pointer.
///
/// JVMTI environments, unlike JNI ones, may be used from any thread.
#[derive(Debug, Clone, Copy)]
pub struct Jvmti {
    env: *mut jvmti::jvmtiEnv,
}

// SAFETY: JVMTI functions are callable from any live thread.
unsafe impl Send for Jvmti {}
unsafe impl Sync for Jvmti {}

impl Jvmti {
    /// Obtains a fresh JVMTI environment from the VM.
    pub fn new(vm: JavaVm) -> Result<Self, jni::jint> {
        let mut env_ptr: *mut std::ffi::c_void = ptr::null_mut();
        unsafe {
            let raw = vm.raw();
            let get_env_fn = (**raw).GetEnv;
            let mut res = get_env_fn(raw, &mut env_ptr, jvmti::JVMTI_VERSION_1_2);
            if res == jni::JNI_EVERSION {
                res = get_env_fn(raw, &mut env_ptr, jvmti::JVMTI_VERSION_1_0);
            }
            if res != jni::JNI_OK {
                return Err(res);
            }
        }
        Ok(Jvmti {
            env: env_ptr as *mut jvmti::jvmtiEnv,
        })
    }

    /// # Safety
    /// The caller must ensure the pointer is valid for the duration of use.
    pub unsafe fn from_raw(env: *mut jvmti::jvmtiEnv) -> Self {
        Jvmti { env }
    }

    pub fn raw(&self) -> *mut jvmti::jvmtiEnv {
        self.env
    }

    // =========================================================================
    // Capabilities
    // =========================================================================

    pub fn get_capabilities(&self) -> Result<jvmti::jvmtiCapabilities, jvmti::jvmtiError> {
        let mut caps = jvmti::jvmtiCapabilities::default();
        unsafe {
            let f = jvmti_fn!(self.env, GetCapabilities);
            check(f(self.env, &mut caps))?;
        }
        Ok(caps)
    }

    pub fn get_potential_capabilities(&self) -> Result<jvmti::jvmtiCapabilities, jvmti::jvmtiError> {
        let mut caps = jvmti::jvmtiCapabilities::default();
        unsafe {
            let f = jvmti_fn!(self.env, GetPotentialCapabilities);
            check(f(self.env, &mut caps))?;
        }
        Ok(caps)
    }

    pub fn add_capabilities(&self, caps: &jvmti::jvmtiCapabilities) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let f = jvmti_fn!(self.env, AddCapabilities);
            check(f(self.env, caps))
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn set_event_callbacks(&self, callbacks: jvmti::jvmtiEventCallbacks) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let f = jvmti_fn!(self.env, SetEventCallbacks);
            let size = std::mem::size_of::<jvmti::jvmtiEventCallbacks>() as jni::jint;
            check(f(self.env, &callbacks, size))
        }
    }

    /// Enables or disables `event_type` for all threads.
    pub fn set_event_notification_mode(&self, enable: bool, event_type: u32) -> Result<(), jvmti::jvmtiError> {
        let mode = if enable { jvmti::JVMTI_ENABLE } else { jvmti::JVMTI_DISABLE };
        unsafe {
            let f = jvmti_fn!(self.env, SetEventNotificationMode);
            check(f(self.env, mode, event_type, ptr::null_mut()))
        }
    }

    // =========================================================================
    // Memory
    // =========================================================================

    /// Memory owned by the VM; hand it back with [`Jvmti::deallocate`] or
    /// give it to the VM (e.g. as `new_class_data`).
    pub fn allocate(&self, size: jni::jlong) -> Result<*mut u8, jvmti::jvmtiError> {
        let mut mem_ptr: *mut u8 = ptr::null_mut();
        unsafe {
            let f = jvmti_fn!(self.env, Allocate);
            check(f(self.env, size, &mut mem_ptr))?;
        }
        Ok(mem_ptr)
    }

    pub fn deallocate(&self, mem: *mut u8) -> Result<(), jvmti::jvmtiError> {
        if mem.is_null() {
            return Ok(());
        }
        unsafe {
            let f = jvmti_fn!(self.env, Deallocate);
            check(f(self.env, mem))
        }
    }

    /// Copies a VM-allocated C string and frees it.
    unsafe fn take_string(&self, p: *mut c_char) -> Result<String, jvmti::jvmtiError> {
        let bytes = CStr::from_ptr(p).to_bytes();
        let value = cesu8::from_java_cesu8(bytes)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned());
        self.deallocate(p as *mut u8)?;
        Ok(value)
    }

    // =========================================================================
    // Classes
    // =========================================================================

    /// Local references to every loaded class.
    pub fn get_loaded_classes(&self) -> Result<Vec<jni::jclass>, jvmti::jvmtiError> {
        let mut class_count: jni::jint = 0;
        let mut classes_ptr: *mut jni::jclass = ptr::null_mut();
        unsafe {
            let f = jvmti_fn!(self.env, GetLoadedClasses);
            check(f(self.env, &mut class_count, &mut classes_ptr))?;
            let classes = std::slice::from_raw_parts(classes_ptr, class_count as usize).to_vec();
            self.deallocate(classes_ptr as *mut u8)?;
            Ok(classes)
        }
    }

    pub fn is_modifiable_class(&self, klass: jni::jclass) -> Result<bool, jvmti::jvmtiError> {
        let mut res: jni::jboolean = 0;
        unsafe {
            let f = jvmti_fn!(self.env, IsModifiableClass);
            check(f(self.env, klass, &mut res))?;
        }
        Ok(res != 0)
    }

    pub fn retransform_classes(&self, classes: &[jni::jclass]) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let f = jvmti_fn!(self.env, RetransformClasses);
            check(f(self.env, classes.len() as jni::jint, classes.as_ptr()))
        }
    }

    pub fn redefine_classes(&self, definitions: &[jvmti::jvmtiClassDefinition]) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let f = jvmti_fn!(self.env, RedefineClasses);
            check(f(self.env, definitions.len() as jni::jint, definitions.as_ptr()))
        }
    }

    // =========================================================================
    // System properties
    // =========================================================================

    /// `Ok(None)` when the property is not set.
    pub fn get_system_property(&self, property: &str) -> Result<Option<String>, jvmti::jvmtiError> {
        let c_property = CString::new(property).map_err(|_| jvmti::jvmtiError::NULL_POINTER)?;
        let mut value_ptr: *mut c_char = ptr::null_mut();
        unsafe {
            let f = jvmti_fn!(self.env, GetSystemProperty);
            match f(self.env, c_property.as_ptr(), &mut value_ptr) {
                jvmti::jvmtiError::NONE => {}
                jvmti::jvmtiError::NOT_AVAILABLE => return Ok(None),
                err => return Err(err),
            }
            if value_ptr.is_null() {
                return Ok(None);
            }
            self.take_string(value_ptr).map(Some)
        }
    }

    pub fn dispose_environment(&self) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let f = jvmti_fn!(self.env, DisposeEnvironment);
            check(f(self.env))
        }
    }
}
