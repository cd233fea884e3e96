mod common;

use std::path::Path;
use std::sync::Arc;

use common::{read_jar, write_classes, Delivery, FakeInstrumentation, FakeRuntime, RecordingAttach};
use jvmti_classbytes::bootstrap::{AgentBootstrap, AttachCommand};
use jvmti_classbytes::config::ArtifactPolicy;
use jvmti_classbytes::instrument::{Instrumentation, InstrumentationSource};
use jvmti_classbytes::loader::{ArchiveClassLoader, ClassRoot};
use jvmti_classbytes::{ClassLoader, Error, Options};
use pretty_assertions::assert_eq;

const AGENT: &str = "com.example.agent.CaptureAgent";
const HELPER: &str = "com.example.agent.Helper";

fn classes_dir(root: &Path) -> Arc<ArchiveClassLoader> {
    let classes = root.join("classes");
    write_classes(&classes, &[(AGENT, &[HELPER]), (HELPER, &[])]);
    ArchiveClassLoader::new(vec![ClassRoot::Directory(classes)])
}

fn bootstrap(options: Options, loader: Arc<ArchiveClassLoader>, attach: Arc<RecordingAttach>) -> AgentBootstrap {
    bootstrap_over(options, loader, attach, Delivery::default())
}

fn bootstrap_over(
    options: Options,
    loader: Arc<ArchiveClassLoader>,
    attach: Arc<RecordingAttach>,
    delivered: Delivery,
) -> AgentBootstrap {
    let runtime = FakeRuntime {
        loader,
        instrumentation: FakeInstrumentation::new(),
        delivered,
    };
    AgentBootstrap::new(Arc::new(options), attach, Arc::new(runtime))
}

/// A bootstrap whose attach hands over `agent_inst`.
fn delivering(
    options: Options,
    loader: Arc<ArchiveClassLoader>,
) -> (AgentBootstrap, Arc<RecordingAttach>, Arc<FakeInstrumentation>) {
    let slot = Delivery::default();
    let agent_inst = FakeInstrumentation::new();
    let attach = Arc::new(RecordingAttach::delivering(slot.clone(), agent_inst.clone()));
    (bootstrap_over(options, loader, attach.clone(), slot), attach, agent_inst)
}

fn same(a: &Arc<dyn Instrumentation>, b: &Arc<FakeInstrumentation>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[test]
fn artifact_holds_manifest_and_classes() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = classes_dir(tmp.path());
    let options = Options::default().with_agent_directory(tmp.path().join("out"));
    let boot = bootstrap(options, loader.clone(), Arc::new(RecordingAttach::default()));

    let agent = loader.load_class(AGENT).unwrap().unwrap();
    let helper = loader.load_class(HELPER).unwrap().unwrap();
    let extra = [("Boot-Class-Path".to_string(), "extra.jar".to_string())];
    let path = boot.build_agent_artifact(&agent, &[helper], &extra).unwrap();
    assert_eq!(path, tmp.path().join("out").join("agent.jar"));

    let (entries, manifest) = read_jar(&path);
    assert_eq!(
        entries,
        vec![
            "META-INF/MANIFEST.MF".to_string(),
            "com/example/agent/CaptureAgent.class".to_string(),
            "com/example/agent/Helper.class".to_string(),
        ]
    );
    for line in [
        "Manifest-Version: 1.0",
        "Can-Retransform-Classes: true",
        "Can-Redefine-Classes: true",
        "Agent-Class: com.example.agent.CaptureAgent",
        "Premain-Class: com.example.agent.CaptureAgent",
        "Boot-Class-Path: extra.jar",
    ] {
        assert!(manifest.lines().any(|l| l == line), "missing `{line}` in:\n{manifest}");
    }
}

#[test]
fn missing_class_bytes_fail_the_build() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = classes_dir(tmp.path());
    let options = Options::default()
        .with_agent_directory(tmp.path())
        .with_agent_class("com.example.agent.Missing");
    let attach = Arc::new(RecordingAttach::default());
    let boot = bootstrap(options, loader, attach.clone());

    let err = boot.ensure_agent_attached().unwrap_err();
    assert!(matches!(err, Error::ArtifactBuildFailure(_)), "{err}");
    assert_eq!(attach.count(), 0);
}

#[test]
fn default_policy_attaches_then_deletes() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = classes_dir(tmp.path());
    let mut options = Options::default()
        .with_agent_directory(tmp.path())
        .with_agent_class(AGENT);
    options.agent.companions = vec![HELPER.to_string()];
    options.agent.args = "mode=capture".to_string();
    let artifact = options.artifact_path();
    let attach = Arc::new(RecordingAttach::default());
    let boot = bootstrap(options, loader, attach.clone());

    boot.ensure_agent_attached().unwrap();
    boot.ensure_agent_attached().unwrap();

    let records = attach.records.lock();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.pid, std::process::id());
    match &record.command {
        AttachCommand::JavaAgent { jar, args } => {
            assert_eq!(jar.file_name(), artifact.file_name());
            assert_eq!(args, "mode=capture");
        }
        other => panic!("unexpected command {other:?}"),
    }
    assert_eq!(record.jar_entries.len(), 3);
    assert!(!artifact.exists(), "artifact should be deleted after attach");
}

#[test]
fn failed_attach_still_deletes_and_reports() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = classes_dir(tmp.path());
    let options = Options::default()
        .with_agent_directory(tmp.path())
        .with_agent_class(AGENT);
    let artifact = options.artifact_path();
    let attach = Arc::new(RecordingAttach::failing());
    let boot = bootstrap(options, loader, attach.clone());

    let err = boot.ensure_agent_attached().unwrap_err();
    assert!(matches!(err, Error::AttachFailure(_)), "{err}");
    assert!(err.is_bootstrap_failure());
    assert!(!artifact.exists());

    // Not marked attached, so the next call tries again.
    assert!(boot.ensure_agent_attached().is_err());
    assert_eq!(attach.count(), 2);
}

#[test]
fn reuse_policy_keeps_and_reuses_the_artifact() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = classes_dir(tmp.path());
    let options = Options::default()
        .with_agent_directory(tmp.path())
        .with_agent_class(AGENT)
        .with_artifact_policy(ArtifactPolicy::ReuseCached);
    let artifact = options.artifact_path();

    let attach = Arc::new(RecordingAttach::default());
    bootstrap(options.clone(), loader, attach.clone())
        .ensure_agent_attached()
        .unwrap();
    assert!(artifact.is_file());
    let built = std::fs::read(&artifact).unwrap();

    // A loader without the agent class: only a reused jar can satisfy this.
    let empty = ArchiveClassLoader::new(Vec::new());
    bootstrap(options, empty, attach.clone())
        .ensure_agent_attached()
        .unwrap();
    assert_eq!(attach.count(), 2);
    assert_eq!(std::fs::read(&artifact).unwrap(), built);
}

#[test]
fn attaching_a_missing_artifact_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let attach = Arc::new(RecordingAttach::default());
    let boot = bootstrap(Options::default(), ArchiveClassLoader::new(Vec::new()), attach.clone());

    let missing = tmp.path().join("nope.jar");
    let err = boot.attach_to_current_process(&missing, "").unwrap_err();
    assert!(matches!(err, Error::ArtifactNotFound(ref p) if p == &missing), "{err}");
    assert_eq!(attach.count(), 0);
}

#[test]
fn without_agent_class_acquire_skips_attach() {
    let attach = Arc::new(RecordingAttach::default());
    let boot = bootstrap(Options::default(), ArchiveClassLoader::new(Vec::new()), attach.clone());

    let inst = boot.acquire().unwrap();
    assert!(inst.is_retransform_classes_supported());
    assert_eq!(attach.count(), 0);
}

#[test]
fn acquire_attaches_configured_agent_first() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = classes_dir(tmp.path());
    let options = Options::default()
        .with_agent_directory(tmp.path())
        .with_agent_class(AGENT);
    let (boot, attach, _) = delivering(options, loader);

    boot.acquire().unwrap();
    boot.acquire().unwrap();
    assert_eq!(attach.count(), 1);
}

#[test]
fn acquire_returns_what_the_attached_agent_handed_over() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = classes_dir(tmp.path());
    let options = Options::default()
        .with_agent_directory(tmp.path())
        .with_agent_class(AGENT);
    let (boot, _, agent_inst) = delivering(options, loader);

    let inst = boot.acquire().unwrap();
    assert!(same(&inst, &agent_inst), "acquire must use the delivered capability");
}

#[test]
fn agent_that_hands_nothing_over_is_an_attach_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = classes_dir(tmp.path());
    let options = Options::default()
        .with_agent_directory(tmp.path())
        .with_agent_class(AGENT);
    let attach = Arc::new(RecordingAttach::default());
    let boot = bootstrap(options, loader, attach.clone());

    let err = boot.acquire().err().unwrap();
    assert!(matches!(err, Error::AttachFailure(_)), "{err}");
    assert_eq!(attach.count(), 1);
}

#[test]
fn native_library_attaches_without_building_a_jar() {
    let tmp = tempfile::tempdir().unwrap();
    let library = tmp.path().join("libcapture.so");
    std::fs::write(&library, b"\x7fELF").unwrap();
    let mut options = Options::default()
        .with_agent_directory(tmp.path().join("out"))
        .with_agent_library(&library);
    options.agent.args = "probe.max=5".to_string();
    let artifact = options.artifact_path();
    let (boot, attach, agent_inst) = delivering(options, ArchiveClassLoader::new(Vec::new()));

    let inst = boot.acquire().unwrap();
    assert!(same(&inst, &agent_inst));

    let records = attach.records.lock();
    assert_eq!(records.len(), 1);
    match &records[0].command {
        AttachCommand::NativeAgent { library: attached, args } => {
            assert_eq!(attached, &library.canonicalize().unwrap());
            assert_eq!(args, "probe.max=5");
        }
        other => panic!("unexpected command {other:?}"),
    }
    assert!(!artifact.exists());
}

#[test]
fn missing_native_library_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let library = tmp.path().join("libmissing.so");
    let (boot, attach, _) = delivering(
        Options::default().with_agent_library(&library),
        ArchiveClassLoader::new(Vec::new()),
    );

    let err = boot.acquire().err().unwrap();
    assert!(matches!(err, Error::ArtifactNotFound(ref p) if p == &library), "{err}");
    assert_eq!(attach.count(), 0);
}
