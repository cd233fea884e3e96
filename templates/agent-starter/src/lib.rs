//! Native agent exposing `com.example.agent.ClassBytes.dump(Class, String)`.
//!
//! ```bash
//! JVMTI_CLASSBYTES_LOG=debug java -agentpath:./libclassbytes_agent.so=probe.max=50 MyApp
//! ```

use std::sync::{Arc, OnceLock};

use jvmti_classbytes::bootstrap::handed_off;
use jvmti_classbytes::prelude::*;
use jvmti_classbytes::runtime::JniRuntime;
use jvmti_classbytes::Error;
use tracing_subscriber::EnvFilter;

static OPTIONS: OnceLock<Arc<Options>> = OnceLock::new();
static COLLECTORS: OnceLock<(Arc<JniRuntime>, CollectorChain)> = OnceLock::new();

#[derive(Default)]
struct ClassBytesAgent;

impl Agent for ClassBytesAgent {
    fn on_load(&self, _vm: *mut jni::JavaVM, options: &str) -> jni::jint {
        let filter = EnvFilter::try_from_env("JVMTI_CLASSBYTES_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();

        let parsed = Options::parse(options).and_then(|mut o| o.apply_env().map(|()| o));
        match parsed {
            Ok(parsed) => {
                let _ = OPTIONS.set(Arc::new(parsed));
                jni::JNI_OK
            }
            Err(e) => {
                tracing::error!(error = %e, "invalid agent options");
                jni::JNI_ERR
            }
        }
    }
}

export_agent!(ClassBytesAgent);

fn collectors() -> jvmti_classbytes::Result<&'static (Arc<JniRuntime>, CollectorChain)> {
    if let Some(collectors) = COLLECTORS.get() {
        return Ok(collectors);
    }
    let options = OPTIONS.get().cloned().unwrap_or_default();
    let vm = handed_off().ok_or_else(|| Error::Jni("agent was not loaded through Agent_OnLoad".into()))?;
    let ctx = in_process_context(options)?;
    Ok(COLLECTORS.get_or_init(|| (JniRuntime::new(vm), CollectorChain::standard(&ctx))))
}

#[no_mangle]
pub unsafe extern "system" fn Java_com_example_agent_ClassBytes_dump(
    env: *mut jni::JNIEnv,
    _cls: jni::jclass,
    target: jni::jclass,
    path: jni::jstring,
) -> jni::jboolean {
    let env = JniEnv::from_raw(env);
    let Some(path) = env.get_string_utf(path) else {
        return jni::JNI_FALSE;
    };
    let bytes = collectors().and_then(|(runtime, chain)| {
        let class = runtime.class_from_local(&env, target)?;
        chain.get_bytes(Some(&class))
    });
    match bytes {
        Ok(Some(bytes)) => match bytes.write_to(&path) {
            Ok(()) => jni::JNI_TRUE,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "cannot write class bytes");
                jni::JNI_FALSE
            }
        },
        Ok(None) => jni::JNI_FALSE,
        Err(e) => {
            tracing::warn!(error = %e, "class byte collection failed");
            jni::JNI_FALSE
        }
    }
}
