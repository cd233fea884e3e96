//! The class model over a live JVM.
//!
//! [`JniRuntime`] turns `jclass` and `ClassLoader` references into
//! [`JavaClass`] and [`ClassLoader`] values by calling back into Java through
//! JNI. Every call goes through the calling thread's own environment, so the
//! values may be used from any thread.

use std::any::Any;
use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::class::{ClassKind, ClassLoader, ClassRef, JavaClass, LoaderId, BOOT_LOADER};
use crate::collector::SystemProperties;
use crate::env::{GlobalRef, JavaVm, JniEnv, Jvmti, LocalRef};
use crate::error::{Error, Result};
use crate::sys::jni;

const CLASS: &str = "java/lang/Class";
const CLASS_LOADER: &str = "java/lang/ClassLoader";
const INPUT_STREAM: &str = "java/io/InputStream";

// Largest chunk copied per InputStream.read call.
const READ_CHUNK: usize = 16 * 1024;

fn find_class<'a>(env: &'a JniEnv, name: &str) -> Result<LocalRef<'a>> {
    match env.find_class(name) {
        Some(cls) => Ok(LocalRef::new(env, cls)),
        None => {
            env.check(name)?;
            Err(Error::Jni(format!("class {name} not found")))
        }
    }
}

fn instance_method(env: &JniEnv, class: &str, name: &str, sig: &str) -> Result<jni::jmethodID> {
    let cls = find_class(env, class)?;
    let id = env.get_method_id(cls.get(), name, sig);
    env.check(name)?;
    id.ok_or_else(|| Error::Jni(format!("method {class}.{name}{sig} not found")))
}

fn call_bool(env: &JniEnv, obj: jni::jobject, name: &str) -> Result<bool> {
    let id = instance_method(env, CLASS, name, "()Z")?;
    let value = env.call_boolean_method(obj, id, &[]);
    env.check(name)?;
    Ok(value)
}

fn java_string<'a>(env: &'a JniEnv, s: &str) -> Result<LocalRef<'a>> {
    match env.new_string_utf(s) {
        Some(js) => Ok(LocalRef::new(env, js)),
        None => {
            env.check("NewStringUTF")?;
            Err(Error::Jni(format!("cannot create Java string for {s:?}")))
        }
    }
}

fn to_io(e: Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// Bridges one JVM into the class model.
pub struct JniRuntime {
    vm: JavaVm,
    boot: Arc<JniClassLoader>,
    loaders: Mutex<Vec<Arc<JniClassLoader>>>,
    next_loader_id: AtomicU64,
}

impl JniRuntime {
    pub fn new(vm: JavaVm) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<JniRuntime>| JniRuntime {
            vm,
            boot: Arc::new(JniClassLoader {
                id: BOOT_LOADER,
                object: None,
                vm,
                runtime: this.clone(),
            }),
            loaders: Mutex::new(Vec::new()),
            next_loader_id: AtomicU64::new(BOOT_LOADER + 1),
        })
    }

    pub fn vm(&self) -> JavaVm {
        self.vm
    }

    /// Resolves resources and classes the way classes without a loader see them.
    pub fn boot_loader(&self) -> Arc<dyn ClassLoader> {
        self.boot.clone()
    }

    /// `ClassLoader.getSystemClassLoader()`.
    pub fn system_loader(self: &Arc<Self>) -> Result<Arc<dyn ClassLoader>> {
        let env = self.vm.env()?;
        let cls = find_class(&env, CLASS_LOADER)?;
        let id = env
            .get_static_method_id(cls.get(), "getSystemClassLoader", "()Ljava/lang/ClassLoader;")
            .ok_or_else(|| Error::Jni("ClassLoader.getSystemClassLoader not found".into()))?;
        let loader = LocalRef::new(&env, env.call_static_object_method(cls.get(), id, &[]));
        env.check("ClassLoader.getSystemClassLoader")?;
        Ok(match self.loader_for(&env, loader.get())? {
            Some(loader) => loader,
            None => self.boot_loader(),
        })
    }

    /// Wraps a local class reference. The reference itself stays owned by the caller.
    pub fn class_from_local(self: &Arc<Self>, env: &JniEnv, cls: jni::jclass) -> Result<ClassRef> {
        if cls.is_null() {
            return Err(Error::NullInputClass);
        }
        let get_name = instance_method(env, CLASS, "getName", "()Ljava/lang/String;")?;
        let jname = LocalRef::new(env, env.call_object_method(cls, get_name, &[]));
        env.check("Class.getName")?;
        let name = env
            .get_string_utf(jname.get())
            .ok_or_else(|| Error::Jni("Class.getName returned null".into()))?;

        let kind = class_kind(env, cls)?;

        let get_loader = instance_method(env, CLASS, "getClassLoader", "()Ljava/lang/ClassLoader;")?;
        let loader_obj = LocalRef::new(env, env.call_object_method(cls, get_loader, &[]));
        env.check("Class.getClassLoader")?;
        let loader = self.loader_for(env, loader_obj.get())?;

        let class = GlobalRef::new(self.vm, env, cls)
            .ok_or_else(|| Error::Jni(format!("cannot pin class {name}")))?;
        Ok(ClassRef::new(JniClass {
            name,
            kind,
            loader,
            class,
            runtime: self.clone(),
        }))
    }

    /// The loader for a `java.lang.ClassLoader` reference; `None` for null (boot).
    ///
    /// The same Java loader always maps to the same [`LoaderId`].
    pub(crate) fn loader_for(&self, env: &JniEnv, obj: jni::jobject) -> Result<Option<Arc<dyn ClassLoader>>> {
        if obj.is_null() {
            return Ok(None);
        }
        let mut loaders = self.loaders.lock();
        for loader in loaders.iter() {
            if let Some(known) = &loader.object {
                if env.is_same_object(known.get(), obj) {
                    return Ok(Some(loader.clone() as Arc<dyn ClassLoader>));
                }
            }
        }
        let object = GlobalRef::new(self.vm, env, obj).ok_or_else(|| Error::Jni("cannot pin class loader".into()))?;
        let loader = Arc::new(JniClassLoader {
            id: self.next_loader_id.fetch_add(1, Ordering::Relaxed),
            object: Some(object),
            vm: self.vm,
            runtime: self.boot.runtime.clone(),
        });
        tracing::trace!(loader = loader.id, "registered class loader");
        loaders.push(loader.clone());
        Ok(Some(loader as Arc<dyn ClassLoader>))
    }
}

impl fmt::Debug for JniRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JniRuntime")
            .field("loaders", &self.loaders.lock().len())
            .finish()
    }
}

fn class_kind(env: &JniEnv, cls: jni::jclass) -> Result<ClassKind> {
    Ok(if call_bool(env, cls, "isPrimitive")? {
        ClassKind::Primitive
    } else if call_bool(env, cls, "isArray")? {
        ClassKind::Array
    } else if call_bool(env, cls, "isAnonymousClass")? {
        ClassKind::Anonymous
    } else if call_bool(env, cls, "isLocalClass")? {
        ClassKind::Local
    } else if call_bool(env, cls, "isMemberClass")? {
        ClassKind::Member
    } else {
        ClassKind::TopLevel
    })
}

/// A class living in the JVM, pinned by a global reference.
pub struct JniClass {
    name: String,
    kind: ClassKind,
    loader: Option<Arc<dyn ClassLoader>>,
    class: GlobalRef,
    runtime: Arc<JniRuntime>,
}

impl JniClass {
    /// The pinned `jclass`, valid on any attached thread.
    pub fn raw(&self) -> jni::jclass {
        self.class.get()
    }
}

impl JavaClass for JniClass {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ClassKind {
        self.kind
    }

    fn loader(&self) -> Option<Arc<dyn ClassLoader>> {
        self.loader.clone()
    }

    fn declared_classes(&self) -> Result<Vec<ClassRef>> {
        let env = self.runtime.vm.env()?;
        let id = instance_method(&env, CLASS, "getDeclaredClasses", "()[Ljava/lang/Class;")?;
        let array = LocalRef::new(&env, env.call_object_method(self.raw(), id, &[]));
        env.check("Class.getDeclaredClasses")?;
        if array.is_null() {
            return Ok(Vec::new());
        }
        let len = env.get_array_length(array.get());
        let mut out = Vec::with_capacity(len.max(0) as usize);
        for i in 0..len {
            let member = LocalRef::new(&env, env.get_object_array_element(array.get(), i));
            env.check("GetObjectArrayElement")?;
            out.push(self.runtime.class_from_local(&env, member.get())?);
        }
        Ok(out)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for JniClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JniClass")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A `java.lang.ClassLoader`, or the boot loader when `object` is `None`.
pub struct JniClassLoader {
    id: LoaderId,
    object: Option<GlobalRef>,
    vm: JavaVm,
    runtime: Weak<JniRuntime>,
}

impl JniClassLoader {
    fn loader_arg(&self) -> jni::jobject {
        self.object.as_ref().map_or(std::ptr::null_mut(), GlobalRef::get)
    }

    fn resource_stream(&self, env: &JniEnv, path: &str) -> Result<jni::jobject> {
        let jpath = java_string(env, path)?;
        let args = [jni::jvalue { l: jpath.get() }];
        let stream = match &self.object {
            Some(loader) => {
                let id = instance_method(env, CLASS_LOADER, "getResourceAsStream", "(Ljava/lang/String;)Ljava/io/InputStream;")?;
                env.call_object_method(loader.get(), id, &args)
            }
            None => {
                let cls = find_class(env, CLASS_LOADER)?;
                let id = env
                    .get_static_method_id(cls.get(), "getSystemResourceAsStream", "(Ljava/lang/String;)Ljava/io/InputStream;")
                    .ok_or_else(|| Error::Jni("ClassLoader.getSystemResourceAsStream not found".into()))?;
                env.call_static_object_method(cls.get(), id, &args)
            }
        };
        env.check("getResourceAsStream")?;
        Ok(stream)
    }
}

impl ClassLoader for JniClassLoader {
    fn id(&self) -> LoaderId {
        self.id
    }

    fn open_resource(&self, path: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        let env = self.vm.env().map_err(to_io)?;
        let stream = LocalRef::new(&env, self.resource_stream(&env, path).map_err(to_io)?);
        if stream.is_null() {
            return Ok(None);
        }
        let stream = GlobalRef::new(self.vm, &env, stream.get())
            .ok_or_else(|| to_io(Error::Jni("cannot pin input stream".into())))?;
        Ok(Some(Box::new(JavaInputStream { stream, eof: false })))
    }

    fn load_class(&self, name: &str) -> Result<Option<ClassRef>> {
        let runtime = self
            .runtime
            .upgrade()
            .ok_or_else(|| Error::Jni("JVM runtime already released".into()))?;
        let env = self.vm.env()?;
        let cls = find_class(&env, CLASS)?;
        let for_name = env
            .get_static_method_id(cls.get(), "forName", "(Ljava/lang/String;ZLjava/lang/ClassLoader;)Ljava/lang/Class;")
            .ok_or_else(|| Error::Jni("Class.forName not found".into()))?;
        let jname = java_string(&env, name)?;
        let args = [
            jni::jvalue { l: jname.get() },
            jni::jvalue { z: jni::JNI_FALSE },
            jni::jvalue { l: self.loader_arg() },
        ];
        let found = LocalRef::new(&env, env.call_static_object_method(cls.get(), for_name, &args));

        if let Some(exc) = env.take_exception() {
            let exc = LocalRef::new(&env, exc);
            if env.throwable_is(exc.get(), "java/lang/ClassNotFoundException")
                || env.throwable_is(exc.get(), "java/lang/LinkageError")
            {
                tracing::trace!(class = name, loader = self.id, "class not loadable");
                return Ok(None);
            }
            return Err(Error::Jni(format!("Class.forName({name}): {}", env.describe_throwable(exc.get()))));
        }
        if found.is_null() {
            return Ok(None);
        }
        runtime.class_from_local(&env, found.get()).map(Some)
    }
}

impl fmt::Debug for JniClassLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JniClassLoader({})", self.id)
    }
}

/// A `java.io.InputStream` read from Rust. Closed on drop.
struct JavaInputStream {
    stream: GlobalRef,
    eof: bool,
}

impl Read for JavaInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.eof {
            return Ok(0);
        }
        let env = self.stream.vm().env().map_err(to_io)?;
        let len = buf.len().min(READ_CHUNK) as jni::jsize;
        let array = match env.new_byte_array(len) {
            Some(array) => LocalRef::new(&env, array),
            None => {
                env.check("NewByteArray").map_err(to_io)?;
                return Err(io::Error::new(io::ErrorKind::OutOfMemory, "NewByteArray failed"));
            }
        };
        let read = instance_method(&env, INPUT_STREAM, "read", "([BII)I").map_err(to_io)?;
        let args = [
            jni::jvalue { l: array.get() },
            jni::jvalue { i: 0 },
            jni::jvalue { i: len },
        ];
        let n = env.call_int_method(self.stream.get(), read, &args);
        env.check("InputStream.read").map_err(to_io)?;
        if n < 0 {
            self.eof = true;
            return Ok(0);
        }
        let n = n as usize;
        env.get_byte_array_region(array.get(), 0, &mut buf[..n]);
        Ok(n)
    }
}

impl Drop for JavaInputStream {
    fn drop(&mut self) {
        let Ok(env) = self.stream.vm().env() else {
            return;
        };
        if let Ok(close) = instance_method(&env, INPUT_STREAM, "close", "()V") {
            env.call_void_method(self.stream.get(), close, &[]);
        }
        if env.exception_check() {
            env.exception_clear();
        }
    }
}

/// System properties read through JVMTI.
#[derive(Debug, Clone, Copy)]
pub struct JvmtiProperties(pub Jvmti);

impl SystemProperties for JvmtiProperties {
    fn get(&self, key: &str) -> Option<String> {
        match self.0.get_system_property(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(key, error = %e, "GetSystemProperty failed");
                None
            }
        }
    }
}
