// jvmti-classbytes/src/sys/jvmti.rs
//
// JVMTI bindings for the class-transformation subset of jvmtiInterface_1_.
//
// Function numbers in the comments are the 1-based positions from jvmti.h.
// Every slot this crate does not call is opaque padding so the table stays
// layout-compatible with JDK 8 through current releases.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::fmt;
use std::os::raw::{c_char, c_uchar, c_void};

use crate::sys::jni::{jboolean, jclass, jint, jlong, jobject, jthread, JNIEnv};

// --- Constants ---
pub const JVMTI_VERSION_1_0: jint = 0x30010000;
pub const JVMTI_VERSION_1_2: jint = 0x30010200;
pub const JVMTI_VERSION_9: jint = 0x30090000;

pub const JVMTI_EVENT_CLASS_FILE_LOAD_HOOK: u32 = 54;

pub const JVMTI_ENABLE: jint = 1;
pub const JVMTI_DISABLE: jint = 0;

// --- Error Codes ---

/// A JVMTI error code.
///
/// Kept as a transparent integer rather than an enum: the VM may report
/// codes newer than this table.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct jvmtiError(pub u32);

impl jvmtiError {
    pub const NONE: jvmtiError = jvmtiError(0);
    pub const INVALID_THREAD: jvmtiError = jvmtiError(10);
    pub const INVALID_CLASS: jvmtiError = jvmtiError(21);
    pub const INVALID_CLASS_FORMAT: jvmtiError = jvmtiError(60);
    pub const FAILS_VERIFICATION: jvmtiError = jvmtiError(62);
    pub const UNSUPPORTED_VERSION: jvmtiError = jvmtiError(68);
    pub const UNMODIFIABLE_CLASS: jvmtiError = jvmtiError(79);
    pub const NOT_AVAILABLE: jvmtiError = jvmtiError(98);
    pub const MUST_POSSESS_CAPABILITY: jvmtiError = jvmtiError(99);
    pub const NULL_POINTER: jvmtiError = jvmtiError(100);
    pub const ABSENT_INFORMATION: jvmtiError = jvmtiError(101);
    pub const INVALID_EVENT_TYPE: jvmtiError = jvmtiError(102);
    pub const WRONG_PHASE: jvmtiError = jvmtiError(112);
    pub const INTERNAL: jvmtiError = jvmtiError(113);

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::NONE => "NONE",
            Self::INVALID_THREAD => "INVALID_THREAD",
            Self::INVALID_CLASS => "INVALID_CLASS",
            Self::INVALID_CLASS_FORMAT => "INVALID_CLASS_FORMAT",
            Self::FAILS_VERIFICATION => "FAILS_VERIFICATION",
            Self::UNSUPPORTED_VERSION => "UNSUPPORTED_VERSION",
            Self::UNMODIFIABLE_CLASS => "UNMODIFIABLE_CLASS",
            Self::NOT_AVAILABLE => "NOT_AVAILABLE",
            Self::MUST_POSSESS_CAPABILITY => "MUST_POSSESS_CAPABILITY",
            Self::NULL_POINTER => "NULL_POINTER",
            Self::ABSENT_INFORMATION => "ABSENT_INFORMATION",
            Self::INVALID_EVENT_TYPE => "INVALID_EVENT_TYPE",
            Self::WRONG_PHASE => "WRONG_PHASE",
            Self::INTERNAL => "INTERNAL",
            _ => return None,
        })
    }
}

impl fmt::Debug for jvmtiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "JVMTI_ERROR_{name}"),
            None => write!(f, "JVMTI_ERROR({})", self.0),
        }
    }
}

impl fmt::Display for jvmtiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct jvmtiClassDefinition {
    pub klass: jclass,
    pub class_byte_count: jint,
    pub class_bytes: *const c_uchar,
}

// --- Capabilities ---
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct jvmtiCapabilities {
    bits: [u32; 4],
}

impl jvmtiCapabilities {
    fn set_bit(&mut self, bit_offset: usize, value: bool) {
        let word_index = bit_offset / 32;
        let bit_index = bit_offset % 32;
        if value {
            self.bits[word_index] |= 1 << bit_index;
        } else {
            self.bits[word_index] &= !(1 << bit_index);
        }
    }

    fn get_bit(&self, bit_offset: usize) -> bool {
        let word_index = bit_offset / 32;
        let bit_index = bit_offset % 32;
        (self.bits[word_index] & (1 << bit_index)) != 0
    }

    pub fn set_can_redefine_classes(&mut self, v: bool) { self.set_bit(9, v); }
    pub fn can_redefine_classes(&self) -> bool { self.get_bit(9) }

    pub fn set_can_redefine_any_class(&mut self, v: bool) { self.set_bit(21, v); }
    pub fn can_redefine_any_class(&self) -> bool { self.get_bit(21) }

    pub fn set_can_retransform_classes(&mut self, v: bool) { self.set_bit(37, v); }
    pub fn can_retransform_classes(&self) -> bool { self.get_bit(37) }

    pub fn set_can_retransform_any_class(&mut self, v: bool) { self.set_bit(38, v); }
    pub fn can_retransform_any_class(&self) -> bool { self.get_bit(38) }
}

// --- Function typedefs ---
pub type JvmtiSetEventNotificationModeFn = unsafe extern "system" fn(env: *mut jvmtiEnv, mode: jint, event_type: u32, event_thread: jthread) -> jvmtiError;
pub type JvmtiIsModifiableClassFn = unsafe extern "system" fn(env: *mut jvmtiEnv, klass: jclass, is_modifiable_class_ptr: *mut jboolean) -> jvmtiError;
pub type JvmtiAllocateFn = unsafe extern "system" fn(env: *mut jvmtiEnv, size: jlong, mem_ptr: *mut *mut c_uchar) -> jvmtiError;
pub type JvmtiDeallocateFn = unsafe extern "system" fn(env: *mut jvmtiEnv, mem: *mut c_uchar) -> jvmtiError;
pub type JvmtiGetClassSignatureFn = unsafe extern "system" fn(env: *mut jvmtiEnv, klass: jclass, signature_ptr: *mut *mut c_char, generic_ptr: *mut *mut c_char) -> jvmtiError;
pub type JvmtiGetLoadedClassesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, class_count_ptr: *mut jint, classes_ptr: *mut *mut jclass) -> jvmtiError;
pub type JvmtiRedefineClassesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, class_count: jint, class_definitions: *const jvmtiClassDefinition) -> jvmtiError;
pub type JvmtiGetCapabilitiesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, capabilities_ptr: *mut jvmtiCapabilities) -> jvmtiError;
pub type JvmtiSetEventCallbacksFn = unsafe extern "system" fn(env: *mut jvmtiEnv, callbacks: *const jvmtiEventCallbacks, size_of_callbacks: jint) -> jvmtiError;
pub type JvmtiDisposeEnvironmentFn = unsafe extern "system" fn(env: *mut jvmtiEnv) -> jvmtiError;
pub type JvmtiGetSystemPropertyFn = unsafe extern "system" fn(env: *mut jvmtiEnv, property: *const c_char, value_ptr: *mut *mut c_char) -> jvmtiError;
pub type JvmtiGetPotentialCapabilitiesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, capabilities_ptr: *mut jvmtiCapabilities) -> jvmtiError;
pub type JvmtiAddCapabilitiesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, capabilities_ptr: *const jvmtiCapabilities) -> jvmtiError;
pub type JvmtiRetransformClassesFn = unsafe extern "system" fn(env: *mut jvmtiEnv, class_count: jint, classes: *const jclass) -> jvmtiError;

// --- Event callback typedefs ---
pub type JvmtiVMInitFn = unsafe extern "system" fn(jvmti_env: *mut jvmtiEnv, jni_env: *mut JNIEnv, thread: jthread);
pub type JvmtiVMDeathFn = unsafe extern "system" fn(jvmti_env: *mut jvmtiEnv, jni_env: *mut JNIEnv);
pub type JvmtiThreadStartFn = unsafe extern "system" fn(jvmti_env: *mut jvmtiEnv, jni_env: *mut JNIEnv, thread: jthread);
pub type JvmtiThreadEndFn = unsafe extern "system" fn(jvmti_env: *mut jvmtiEnv, jni_env: *mut JNIEnv, thread: jthread);
pub type JvmtiClassFileLoadHookFn = unsafe extern "system" fn(
    jvmti_env: *mut jvmtiEnv,
    jni_env: *mut JNIEnv,
    class_being_redefined: jclass,
    loader: jobject,
    name: *const c_char,
    protection_domain: jobject,
    class_data_len: jint,
    class_data: *const c_uchar,
    new_class_data_len: *mut jint,
    new_class_data: *mut *mut c_uchar,
);

type Pad<const N: usize> = [*mut c_void; N];

// =========================================================================
// jvmtiInterface_1_ (function table)
// =========================================================================

#[repr(C)]
pub struct jvmtiInterface_1_ {
    _r1: Pad<1>,
    // 2
    pub SetEventNotificationMode: Option<JvmtiSetEventNotificationModeFn>,
    _p3: Pad<42>,
    // 45-48
    pub IsModifiableClass: Option<JvmtiIsModifiableClassFn>,
    pub Allocate: Option<JvmtiAllocateFn>,
    pub Deallocate: Option<JvmtiDeallocateFn>,
    pub GetClassSignature: Option<JvmtiGetClassSignatureFn>,
    _p49: Pad<29>,
    // 78
    pub GetLoadedClasses: Option<JvmtiGetLoadedClassesFn>,
    _p79: Pad<8>,
    // 87
    pub RedefineClasses: Option<JvmtiRedefineClassesFn>,
    _p88: Pad<1>,
    // 89
    pub GetCapabilities: Option<JvmtiGetCapabilitiesFn>,
    _p90: Pad<32>,
    // 122
    pub SetEventCallbacks: Option<JvmtiSetEventCallbacksFn>,
    _p123: Pad<4>,
    // 127
    pub DisposeEnvironment: Option<JvmtiDisposeEnvironmentFn>,
    _p128: Pad<3>,
    // 131
    pub GetSystemProperty: Option<JvmtiGetSystemPropertyFn>,
    _p132: Pad<8>,
    // 140
    pub GetPotentialCapabilities: Option<JvmtiGetPotentialCapabilitiesFn>,
    _p141: Pad<1>,
    // 142
    pub AddCapabilities: Option<JvmtiAddCapabilitiesFn>,
    _p143: Pad<9>,
    // 152
    pub RetransformClasses: Option<JvmtiRetransformClassesFn>,
}

#[repr(C)]
pub struct jvmtiEnv {
    pub functions: *const jvmtiInterface_1_,
}

/// Event callback table.
///
/// Only the leading entries are named; the remaining 27 event slots stay
/// null so the VM never dispatches them to this environment.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct jvmtiEventCallbacks {
    pub VMInit: Option<JvmtiVMInitFn>,
    pub VMDeath: Option<JvmtiVMDeathFn>,
    pub ThreadStart: Option<JvmtiThreadStartFn>,
    pub ThreadEnd: Option<JvmtiThreadEndFn>,
    pub ClassFileLoadHook: Option<JvmtiClassFileLoadHookFn>,
    _rest: Pad<27>,
}

impl Default for jvmtiEventCallbacks {
    fn default() -> Self {
        Self {
            VMInit: None,
            VMDeath: None,
            ThreadStart: None,
            ThreadEnd: None,
            ClassFileLoadHook: None,
            _rest: [std::ptr::null_mut(); 27],
        }
    }
}
