//! Raw JNI and JVMTI FFI declarations.

pub mod jni;
pub mod jvmti;
