//! Safe wrappers around the JNI invocation and native interfaces.
//!
//! Only the calls the class model needs are wrapped: class lookup, method
//! invocation, strings, byte arrays and reference management.
//!
//! # Example
//!
//! ```rust,ignore
//! use jvmti_classbytes::env::{JavaVm, JniEnv};
//!
//! fn class_name(vm: JavaVm, cls: jni::jclass) -> Option<String> {
//!     let env = vm.env().ok()?;
//!     let class_class = env.find_class("java/lang/Class")?;
//!     let get_name = env.get_method_id(class_class, "getName", "()Ljava/lang/String;")?;
//!     let name = env.call_object_method(cls, get_name, &[]);
//!     env.get_string_utf(name)
//! }
//! ```

use std::ffi::{c_void, CStr, CString};
use std::ptr;

use crate::error::{Error, Result};
use crate::sys::jni;

/// A process-wide handle to the running JVM.
///
/// Unlike [`JniEnv`], this may be shared between threads; each thread
/// asks it for its own environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JavaVm {
    vm: *mut jni::JavaVM,
}

// SAFETY: the invocation interface is documented as callable from any thread.
unsafe impl Send for JavaVm {}
unsafe impl Sync for JavaVm {}

impl JavaVm {
    /// # Safety
    ///
    /// `vm` must point to a live `JavaVM` for as long as the handle is used.
    pub unsafe fn from_raw(vm: *mut jni::JavaVM) -> Self {
        JavaVm { vm }
    }

    pub fn raw(&self) -> *mut jni::JavaVM {
        self.vm
    }

    /// The JNI environment of the calling thread, attaching it as a daemon
    /// thread if the VM does not know it yet.
    pub fn env(&self) -> Result<JniEnv> {
        let mut env_ptr: *mut c_void = ptr::null_mut();
        unsafe {
            let res = ((**self.vm).GetEnv)(self.vm, &mut env_ptr, jni::JNI_VERSION_1_8);
            match res {
                jni::JNI_OK => {}
                jni::JNI_EDETACHED => {
                    let res = ((**self.vm).AttachCurrentThreadAsDaemon)(self.vm, &mut env_ptr, ptr::null_mut());
                    if res != jni::JNI_OK {
                        return Err(Error::Jni(format!("AttachCurrentThreadAsDaemon failed: {res}")));
                    }
                    tracing::debug!("attached native thread to the JVM");
                }
                other => return Err(Error::Jni(format!("GetEnv failed: {other}"))),
            }
            Ok(JniEnv::from_raw(env_ptr as *mut jni::JNIEnv))
        }
    }
}

/// Safe wrapper around a JNI environment pointer.
///
/// # Thread Safety
///
/// A `JniEnv` is tied to the thread it was obtained on and must not be
/// moved to another one.
pub struct JniEnv {
    env: *mut jni::JNIEnv,
}

impl JniEnv {
    /// Creates a JniEnv wrapper from a raw pointer.
    ///
    /// # Safety
    ///
    /// The caller must ensure the pointer is valid and comes from the current thread.
    pub unsafe fn from_raw(env: *mut jni::JNIEnv) -> Self {
        JniEnv { env }
    }

    pub fn raw(&self) -> *mut jni::JNIEnv {
        self.env
    }

    // =========================================================================
    // Classes
    // =========================================================================

    /// Finds a class by internal name (`java/lang/String`).
    pub fn find_class(&self, name: &str) -> Option<jni::jclass> {
        let c_name = CString::new(name).ok()?;
        unsafe {
            let vtable = *self.env;
            let cls = ((*vtable).FindClass)(self.env, c_name.as_ptr());
            if cls.is_null() { None } else { Some(cls) }
        }
    }

    pub fn get_object_class(&self, obj: jni::jobject) -> jni::jclass {
        unsafe {
            let vtable = *self.env;
            ((*vtable).GetObjectClass)(self.env, obj)
        }
    }

    pub fn is_instance_of(&self, obj: jni::jobject, cls: jni::jclass) -> bool {
        unsafe {
            let vtable = *self.env;
            ((*vtable).IsInstanceOf)(self.env, obj, cls) != 0
        }
    }

    pub fn is_same_object(&self, a: jni::jobject, b: jni::jobject) -> bool {
        unsafe {
            let vtable = *self.env;
            ((*vtable).IsSameObject)(self.env, a, b) != 0
        }
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    pub fn exception_check(&self) -> bool {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionCheck)(self.env) != 0
        }
    }

    pub fn exception_clear(&self) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).ExceptionClear)(self.env);
        }
    }

    pub fn exception_occurred(&self) -> Option<jni::jthrowable> {
        unsafe {
            let vtable = *self.env;
            let exc = ((*vtable).ExceptionOccurred)(self.env);
            if exc.is_null() { None } else { Some(exc) }
        }
    }

    /// Clears the pending exception, if any, and hands it back.
    pub fn take_exception(&self) -> Option<jni::jthrowable> {
        let exc = self.exception_occurred()?;
        self.exception_clear();
        Some(exc)
    }

    /// True when `throwable` is an instance of the class named `internal_name`.
    pub fn throwable_is(&self, throwable: jni::jthrowable, internal_name: &str) -> bool {
        match self.find_class(internal_name) {
            Some(cls) => {
                let is = self.is_instance_of(throwable, cls);
                self.delete_local_ref(cls);
                is
            }
            None => {
                self.exception_clear();
                false
            }
        }
    }

    /// `throwable.toString()`, for diagnostics.
    pub fn describe_throwable(&self, throwable: jni::jthrowable) -> String {
        let cls = self.get_object_class(throwable);
        let text = self
            .get_method_id(cls, "toString", "()Ljava/lang/String;")
            .and_then(|to_string| {
                let s = self.call_object_method(throwable, to_string, &[]);
                let text = self.get_string_utf(s);
                self.delete_local_ref(s);
                text
            });
        self.delete_local_ref(cls);
        if self.exception_check() {
            self.exception_clear();
        }
        text.unwrap_or_else(|| "<unprintable exception>".to_string())
    }

    /// Turns a pending exception into an [`Error::Jni`] naming `context`.
    pub fn check(&self, context: &str) -> Result<()> {
        match self.take_exception() {
            None => Ok(()),
            Some(exc) => {
                let text = self.describe_throwable(exc);
                self.delete_local_ref(exc);
                Err(Error::Jni(format!("{context}: {text}")))
            }
        }
    }

    // =========================================================================
    // Strings
    // =========================================================================

    pub fn new_string_utf(&self, s: &str) -> Option<jni::jstring> {
        let c_str = CString::new(s).ok()?;
        unsafe {
            let vtable = *self.env;
            let jstr = ((*vtable).NewStringUTF)(self.env, c_str.as_ptr());
            if jstr.is_null() { None } else { Some(jstr) }
        }
    }

    /// Gets a Rust string from a Java string.
    ///
    /// Returns `None` for a null string. Modified UTF-8 is decoded leniently.
    pub fn get_string_utf(&self, s: jni::jstring) -> Option<String> {
        if s.is_null() {
            return None;
        }
        unsafe {
            let vtable = *self.env;
            let chars = ((*vtable).GetStringUTFChars)(self.env, s, ptr::null_mut());
            if chars.is_null() {
                return None;
            }
            let bytes = CStr::from_ptr(chars).to_bytes();
            let result = cesu8::from_java_cesu8(bytes)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned());
            ((*vtable).ReleaseStringUTFChars)(self.env, s, chars);
            Some(result)
        }
    }

    // =========================================================================
    // Methods
    // =========================================================================

    pub fn get_method_id(&self, cls: jni::jclass, name: &str, sig: &str) -> Option<jni::jmethodID> {
        let c_name = CString::new(name).ok()?;
        let c_sig = CString::new(sig).ok()?;
        unsafe {
            let vtable = *self.env;
            let id = ((*vtable).GetMethodID)(self.env, cls, c_name.as_ptr(), c_sig.as_ptr());
            if id.is_null() { None } else { Some(id) }
        }
    }

    pub fn get_static_method_id(&self, cls: jni::jclass, name: &str, sig: &str) -> Option<jni::jmethodID> {
        let c_name = CString::new(name).ok()?;
        let c_sig = CString::new(sig).ok()?;
        unsafe {
            let vtable = *self.env;
            let id = ((*vtable).GetStaticMethodID)(self.env, cls, c_name.as_ptr(), c_sig.as_ptr());
            if id.is_null() { None } else { Some(id) }
        }
    }

    pub fn call_object_method(&self, obj: jni::jobject, method_id: jni::jmethodID, args: &[jni::jvalue]) -> jni::jobject {
        unsafe {
            let vtable = *self.env;
            ((*vtable).CallObjectMethodA)(self.env, obj, method_id, args.as_ptr())
        }
    }

    pub fn call_boolean_method(&self, obj: jni::jobject, method_id: jni::jmethodID, args: &[jni::jvalue]) -> bool {
        unsafe {
            let vtable = *self.env;
            ((*vtable).CallBooleanMethodA)(self.env, obj, method_id, args.as_ptr()) != 0
        }
    }

    pub fn call_int_method(&self, obj: jni::jobject, method_id: jni::jmethodID, args: &[jni::jvalue]) -> jni::jint {
        unsafe {
            let vtable = *self.env;
            ((*vtable).CallIntMethodA)(self.env, obj, method_id, args.as_ptr())
        }
    }

    pub fn call_void_method(&self, obj: jni::jobject, method_id: jni::jmethodID, args: &[jni::jvalue]) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).CallVoidMethodA)(self.env, obj, method_id, args.as_ptr())
        }
    }

    pub fn call_static_object_method(&self, cls: jni::jclass, method_id: jni::jmethodID, args: &[jni::jvalue]) -> jni::jobject {
        unsafe {
            let vtable = *self.env;
            ((*vtable).CallStaticObjectMethodA)(self.env, cls, method_id, args.as_ptr())
        }
    }

    // =========================================================================
    // References
    // =========================================================================

    pub fn new_global_ref(&self, obj: jni::jobject) -> jni::jobject {
        unsafe {
            let vtable = *self.env;
            ((*vtable).NewGlobalRef)(self.env, obj)
        }
    }

    pub fn delete_global_ref(&self, obj: jni::jobject) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).DeleteGlobalRef)(self.env, obj)
        }
    }

    pub fn delete_local_ref(&self, obj: jni::jobject) {
        if obj.is_null() {
            return;
        }
        unsafe {
            let vtable = *self.env;
            ((*vtable).DeleteLocalRef)(self.env, obj)
        }
    }

    // =========================================================================
    // Arrays
    // =========================================================================

    pub fn get_array_length(&self, array: jni::jarray) -> jni::jsize {
        unsafe {
            let vtable = *self.env;
            ((*vtable).GetArrayLength)(self.env, array)
        }
    }

    pub fn get_object_array_element(&self, array: jni::jobjectArray, index: jni::jsize) -> jni::jobject {
        unsafe {
            let vtable = *self.env;
            ((*vtable).GetObjectArrayElement)(self.env, array, index)
        }
    }

    pub fn new_byte_array(&self, length: jni::jsize) -> Option<jni::jbyteArray> {
        unsafe {
            let vtable = *self.env;
            let arr = ((*vtable).NewByteArray)(self.env, length);
            if arr.is_null() { None } else { Some(arr) }
        }
    }

    pub fn get_byte_array_region(&self, array: jni::jbyteArray, start: jni::jsize, buf: &mut [u8]) {
        unsafe {
            let vtable = *self.env;
            ((*vtable).GetByteArrayRegion)(
                self.env,
                array,
                start,
                buf.len() as jni::jsize,
                buf.as_mut_ptr() as *mut jni::jbyte,
            )
        }
    }
}

// =========================================================================
// Reference Guards (RAII wrappers)
// =========================================================================

/// Deletes a local reference when dropped.
pub struct LocalRef<'a> {
    env: &'a JniEnv,
    obj: jni::jobject,
}

impl<'a> LocalRef<'a> {
    pub fn new(env: &'a JniEnv, obj: jni::jobject) -> Self {
        LocalRef { env, obj }
    }

    pub fn get(&self) -> jni::jobject {
        self.obj
    }

    pub fn is_null(&self) -> bool {
        self.obj.is_null()
    }
}

impl<'a> Drop for LocalRef<'a> {
    fn drop(&mut self) {
        self.env.delete_local_ref(self.obj);
    }
}

/// A global reference, deleted on drop from whichever thread drops it.
///
/// Holds the VM rather than an environment so it can move between threads.
pub struct GlobalRef {
    vm: JavaVm,
    obj: jni::jobject,
}

// SAFETY: global references are valid on every thread attached to the VM.
unsafe impl Send for GlobalRef {}
unsafe impl Sync for GlobalRef {}

impl GlobalRef {
    /// Promotes `local_obj` to a global reference. `None` for null.
    pub fn new(vm: JavaVm, env: &JniEnv, local_obj: jni::jobject) -> Option<Self> {
        if local_obj.is_null() {
            return None;
        }
        let obj = env.new_global_ref(local_obj);
        if obj.is_null() {
            return None;
        }
        Some(GlobalRef { vm, obj })
    }

    pub fn get(&self) -> jni::jobject {
        self.obj
    }

    pub fn vm(&self) -> JavaVm {
        self.vm
    }
}

impl Drop for GlobalRef {
    fn drop(&mut self) {
        match self.vm.env() {
            Ok(env) => env.delete_global_ref(self.obj),
            Err(e) => tracing::debug!(error = %e, "leaking global reference"),
        }
    }
}

impl std::fmt::Debug for GlobalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GlobalRef({:p})", self.obj)
    }
}
