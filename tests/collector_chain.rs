mod common;

use std::sync::Arc;

use common::{class_file, write_classes, CountingCollector, FakeClass, FakeInstrumentation};
use jvmti_classbytes::collector::{
    ByteCollector, ClasspathCollector, CollectorChain, CollectorContext, CollectorRegistry, StaticProperties,
    DUMP_PROPERTIES,
};
use jvmti_classbytes::instrument::{AgentHandle, FixedInstrumentation, Unavailable};
use jvmti_classbytes::loader::{ArchiveClassLoader, ClassRoot};
use jvmti_classbytes::{ClassBytes, ClassLoader, Error, Options};
use pretty_assertions::assert_eq;

fn leaked_handle() -> &'static AgentHandle {
    Box::leak(Box::new(AgentHandle::new()))
}

fn dump_properties() -> StaticProperties {
    StaticProperties::new()
        .with(DUMP_PROPERTIES[0], "true")
        .with(DUMP_PROPERTIES[1], "true")
}

#[test]
fn stops_at_first_collector_with_bytes() {
    let low = CountingCollector::new("low", 0, None);
    let mid = CountingCollector::new("mid", 500, Some(vec![1, 2, 3]));
    let high = CountingCollector::new("high", 1000, Some(vec![9]));
    let chain = CollectorChain::from_collectors(vec![high.clone(), low.clone(), mid.clone()]);

    let class = FakeClass::top_level("a.B");
    let bytes = chain.get_bytes(Some(&class)).unwrap().unwrap();
    assert_eq!(bytes.as_slice(), &[1, 2, 3]);
    assert_eq!((low.calls(), mid.calls(), high.calls()), (1, 1, 0));
}

#[test]
fn every_collector_missing_is_none() {
    let a = CountingCollector::new("a", 0, None);
    let b = CountingCollector::new("b", 1, None);
    let chain = CollectorChain::from_collectors(vec![a.clone(), b.clone()]);

    assert!(chain.get_bytes(Some(&FakeClass::top_level("a.B"))).unwrap().is_none());
    assert_eq!((a.calls(), b.calls()), (1, 1));
}

#[test]
fn null_class_is_none_without_asking() {
    let a = CountingCollector::new("a", 0, Some(vec![1]));
    let chain = CollectorChain::from_collectors(vec![a.clone()]);
    assert!(chain.get_bytes(None).unwrap().is_none());
    assert_eq!(a.calls(), 0);
}

#[test]
fn disabled_collectors_are_dropped_and_rest_sorted() {
    let off = CountingCollector::disabled("off", -5, Some(vec![0]));
    let late = CountingCollector::new("late", 10, Some(vec![10]));
    let early = CountingCollector::new("early", 1, None);
    let tie = CountingCollector::new("tie", 10, Some(vec![11]));
    let chain = CollectorChain::from_collectors(vec![off.clone(), late.clone(), early, tie]);

    assert_eq!(chain.collector_names(), vec!["early", "late", "tie"]);
    let bytes = chain.get_bytes(Some(&FakeClass::top_level("x.Y"))).unwrap().unwrap();
    assert_eq!(bytes.as_slice(), &[10]);
    assert_eq!(off.calls(), 0);
}

#[test]
fn collector_failure_propagates() {
    let broken = CountingCollector::failing("broken", 0);
    let after = CountingCollector::new("after", 1, Some(vec![1]));
    let chain = CollectorChain::from_collectors(vec![broken, after.clone()]);

    let err = chain.get_bytes(Some(&FakeClass::top_level("a.B"))).unwrap_err();
    assert!(matches!(err, Error::ResourceReadFailure { .. }), "{err}");
    assert_eq!(after.calls(), 0);
}

#[test]
fn standard_registry_skips_inactive_dumper() {
    let tmp = tempfile::tempdir().unwrap();
    let loader = ArchiveClassLoader::new(vec![ClassRoot::Directory(tmp.path().to_path_buf())]);
    let ctx = CollectorContext::new(
        Arc::new(Options::default()),
        loader,
        Arc::new(StaticProperties::new()),
        Arc::new(Unavailable("offline".into())),
    )
    .with_handle(leaked_handle());
    let chain = CollectorChain::new(&CollectorRegistry::standard(), &ctx);
    assert_eq!(chain.collector_names(), vec!["classpath", "instrumentation"]);

    let ctx = CollectorContext {
        properties: Arc::new(dump_properties()),
        options: Arc::new(Options::default().with_dump_directory(tmp.path().join("dump"))),
        ..ctx
    };
    let chain = CollectorChain::standard(&ctx);
    assert_eq!(chain.collector_names(), vec!["classpath", "dumper", "instrumentation"]);
}

#[test]
fn custom_collectors_join_the_registry() {
    let mut registry = CollectorRegistry::empty();
    registry.register(|_| CountingCollector::new("custom", 7, Some(vec![7])) as Arc<dyn ByteCollector>);
    registry.register(|ctx| Arc::new(ClasspathCollector::new(ctx)) as Arc<dyn ByteCollector>);
    assert_eq!(registry.len(), 2);

    let tmp = tempfile::tempdir().unwrap();
    let ctx = CollectorContext::new(
        Arc::new(Options::default()),
        ArchiveClassLoader::new(vec![ClassRoot::Directory(tmp.path().to_path_buf())]),
        Arc::new(StaticProperties::new()),
        Arc::new(Unavailable("offline".into())),
    );
    let chain = CollectorChain::new(&registry, &ctx);
    assert_eq!(chain.collector_names(), vec!["classpath", "custom"]);
    let bytes = chain.get_bytes(Some(&FakeClass::top_level("not.There"))).unwrap();
    assert_eq!(bytes.map(|b| b.to_vec()), Some(vec![7]));
}

#[test]
fn classpath_reads_through_defining_loader() {
    let tmp = tempfile::tempdir().unwrap();
    write_classes(tmp.path(), &[("com.example.Foo", &[])]);
    let loader = ArchiveClassLoader::new(vec![ClassRoot::Directory(tmp.path().to_path_buf())]);
    let collector = ClasspathCollector::with_boot_loader(ArchiveClassLoader::new(Vec::new()));

    let class = loader.load_class("com.example.Foo").unwrap().unwrap();
    let bytes = collector.try_get_bytes(&class).unwrap().unwrap();
    assert_eq!(bytes.qualified_name().unwrap(), "com.example.Foo");
    assert_eq!(bytes.to_vec(), class_file("com.example.Foo", &[]));
}

#[test]
fn classpath_uses_boot_loader_for_loaderless_classes() {
    let tmp = tempfile::tempdir().unwrap();
    write_classes(tmp.path(), &[("java.lang.Thing", &[])]);
    let boot = ArchiveClassLoader::new(vec![ClassRoot::Directory(tmp.path().to_path_buf())]);
    let collector = ClasspathCollector::with_boot_loader(boot);

    let found = collector.try_get_bytes(&FakeClass::top_level("java.lang.Thing")).unwrap();
    assert!(found.is_some());
    let missing = collector.try_get_bytes(&FakeClass::top_level("java.lang.Nope")).unwrap();
    assert!(missing.is_none());
}

#[test]
fn classpath_reads_from_jars() {
    let tmp = tempfile::tempdir().unwrap();
    let jar = tmp.path().join("lib.jar");
    let bytes = ClassBytes::from(class_file("p.InJar", &[]));
    jvmti_classbytes::bootstrap::write_agent_jar(&jar, "p.InJar", &[("p/InJar.class".into(), bytes.clone())], &[])
        .unwrap();

    let loader = ArchiveClassLoader::new(vec![ClassRoot::from_path(&jar)]);
    let class = loader.load_class("p.InJar").unwrap().unwrap();
    let collector = ClasspathCollector::with_boot_loader(loader.clone());
    assert_eq!(collector.try_get_bytes(&class).unwrap(), Some(bytes));
}

#[cfg(unix)]
#[test]
fn jar_stays_open_between_reads() {
    let tmp = tempfile::tempdir().unwrap();
    let jar = tmp.path().join("lib.jar");
    let entries: Vec<(String, ClassBytes)> = ["p.First", "p.Second"]
        .iter()
        .map(|name| (jvmti_classbytes::names::resource_path(name), ClassBytes::from(class_file(name, &[]))))
        .collect();
    jvmti_classbytes::bootstrap::write_agent_jar(&jar, "p.First", &entries, &[]).unwrap();

    let loader = ArchiveClassLoader::new(vec![ClassRoot::from_path(&jar)]);
    assert!(loader.load_class("p.First").unwrap().is_some());
    // The open handle outlives the directory entry.
    std::fs::remove_file(&jar).unwrap();
    let second = loader.load_class("p.Second").unwrap().unwrap();
    let bytes = ClasspathCollector::with_boot_loader(loader.clone()).try_get_bytes(&second).unwrap();
    assert_eq!(bytes.map(|b| b.to_vec()), Some(class_file("p.Second", &[])));
}

#[test]
fn dumper_reads_dump_directory_when_properties_set() {
    let tmp = tempfile::tempdir().unwrap();
    let dump = tmp.path().join("DUMP_CLASS_FILES");
    let name = "java.lang.invoke.LambdaForm$MH";
    write_classes(&dump, &[(name, &[])]);

    let ctx = CollectorContext::new(
        Arc::new(Options::default().with_classpath(false).with_dump_directory(&dump)),
        ArchiveClassLoader::new(Vec::new()),
        Arc::new(dump_properties()),
        Arc::new(Unavailable("offline".into())),
    )
    .with_handle(leaked_handle());
    let chain = CollectorChain::standard(&ctx);
    let bytes = chain.get_bytes(Some(&FakeClass::top_level(name))).unwrap().unwrap();
    assert_eq!(bytes.qualified_name().unwrap(), name);
}

#[test]
fn instrumentation_is_the_last_resort() {
    let inst = FakeInstrumentation::new();
    inst.define("gen.Proxy$1", class_file("gen.Proxy$1", &[]));
    let ctx = CollectorContext::new(
        Arc::new(Options::default()),
        ArchiveClassLoader::new(Vec::new()),
        Arc::new(StaticProperties::new()),
        Arc::new(FixedInstrumentation(inst.clone())),
    )
    .with_handle(leaked_handle());
    let chain = CollectorChain::standard(&ctx);

    let bytes = chain.get_bytes(Some(&FakeClass::top_level("gen.Proxy$1"))).unwrap().unwrap();
    assert_eq!(bytes.qualified_name().unwrap(), "gen.Proxy$1");
    assert_eq!(inst.retransform_count(), 1);
    // The bytes the JVM holds are left as they were.
    assert_eq!(inst.current_bytes("gen.Proxy$1"), Some(bytes.to_vec()));
}

#[test]
fn bootstrap_failure_is_soft_unless_instrumentation_is_alone() {
    let class = FakeClass::top_level("a.Missing");
    let ctx = |options: Options| {
        CollectorContext::new(
            Arc::new(options),
            ArchiveClassLoader::new(Vec::new()),
            Arc::new(StaticProperties::new()),
            Arc::new(Unavailable("no attach".into())),
        )
        .with_handle(leaked_handle())
    };

    let chain = CollectorChain::standard(&ctx(Options::default()));
    assert!(chain.get_bytes(Some(&class)).unwrap().is_none());

    let alone = Options::default().with_classpath(false).with_dumper(false);
    let chain = CollectorChain::standard(&ctx(alone));
    let err = chain.get_bytes(Some(&class)).unwrap_err();
    assert!(matches!(err, Error::AttachFailure(_)), "{err}");
}

#[test]
fn inactive_dumper_leaves_instrumentation_alone() {
    // The dumper is switched on but its properties are not set, so nothing
    // else can stand in for the failed attach.
    let ctx = CollectorContext::new(
        Arc::new(Options::default().with_classpath(false)),
        ArchiveClassLoader::new(Vec::new()),
        Arc::new(StaticProperties::new()),
        Arc::new(Unavailable("no attach".into())),
    )
    .with_handle(leaked_handle());
    let chain = CollectorChain::standard(&ctx);
    assert_eq!(chain.collector_names(), vec!["instrumentation"]);

    let err = chain.get_bytes(Some(&FakeClass::top_level("a.Missing"))).unwrap_err();
    assert!(matches!(err, Error::AttachFailure(_)), "{err}");
}

#[test]
fn later_collectors_are_asked_after_a_failed_attach() {
    let custom = CountingCollector::new("custom", 2000, Some(vec![7]));
    let mut registry = CollectorRegistry::standard();
    let registered = custom.clone();
    registry.register(move |_| registered.clone() as Arc<dyn ByteCollector>);

    let ctx = CollectorContext::new(
        Arc::new(Options::default().with_classpath(false).with_dumper(false)),
        ArchiveClassLoader::new(Vec::new()),
        Arc::new(StaticProperties::new()),
        Arc::new(Unavailable("no attach".into())),
    )
    .with_handle(leaked_handle());
    let chain = CollectorChain::new(&registry, &ctx);
    assert_eq!(chain.collector_names(), vec!["instrumentation", "custom"]);

    let bytes = chain.get_bytes(Some(&FakeClass::top_level("a.Generated"))).unwrap();
    assert_eq!(bytes.map(|b| b.to_vec()), Some(vec![7]));
    assert_eq!(custom.calls(), 1);
}
