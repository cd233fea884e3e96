mod common;

use common::{assemble, class_file, CpBuilder};
use jvmti_classbytes::classfile::{
    enumerate_class_references, enumerate_class_references_as, resolve_name, resolve_qualified_name, ConstantPool,
};
use jvmti_classbytes::names::ClassNameForm;
use jvmti_classbytes::Error;
use pretty_assertions::assert_eq;

// CA FE BA BE, version 52, pool of 3: #1 Utf8 "com/example/Foo", #2 Class -> #1, this_class = 2.
fn worked_example() -> Vec<u8> {
    let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0x00, 0x00, 0x00, 0x34, 0x00, 0x03];
    bytes.push(0x01);
    bytes.extend_from_slice(&15u16.to_be_bytes());
    bytes.extend_from_slice(b"com/example/Foo");
    bytes.extend_from_slice(&[0x07, 0x00, 0x01]);
    bytes.extend_from_slice(&[0x00, 0x21]); // access_flags
    bytes.extend_from_slice(&[0x00, 0x02]); // this_class
    bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    bytes
}

#[test]
fn resolves_worked_example() {
    let bytes = worked_example();
    assert_eq!(resolve_qualified_name(&bytes).unwrap(), "com.example.Foo");
    assert_eq!(resolve_name(&bytes, ClassNameForm::Internal).unwrap(), "com/example/Foo");

    let pool = ConstantPool::parse(&bytes).unwrap();
    assert_eq!(pool.count(), 3);
    assert_eq!(pool.utf8(1), Some("com/example/Foo"));
    assert_eq!(pool.class_name(2).unwrap(), "com/example/Foo");
}

#[test]
fn name_round_trips_through_the_class_file() {
    for name in ["Top", "a.b.C", "a.b.Outer$Inner", "a.b.Outer$1", "a.b.Outer$1Local", "\u{e9}t\u{e9}.Caf\u{e9}"] {
        let bytes = class_file(name, &[]);
        assert_eq!(resolve_qualified_name(&bytes).unwrap(), name);
    }
}

#[test]
fn wide_entries_take_two_slots() {
    let mut cp = CpBuilder::new();
    cp.long(1 << 40);
    let this = cp.class_named("p/AfterLong");
    assert_eq!(this, 4);
    let bytes = assemble(&cp, this);
    assert_eq!(resolve_qualified_name(&bytes).unwrap(), "p.AfterLong");
}

#[test]
fn skips_non_class_entries() {
    let mut cp = CpBuilder::new();
    let this = cp.class_named("p/Main");
    let text = cp.utf8("hello");
    cp.string(text);
    cp.integer(42);
    let other = cp.class_named("java/util/List");
    let method = cp.utf8("size");
    let desc = cp.utf8("()I");
    let nat = cp.name_and_type(method, desc);
    let mref = cp.methodref(other, nat);
    cp.method_handle(5, mref);
    let bytes = assemble(&cp, this);

    let refs: Vec<String> = enumerate_class_references(&bytes).collect::<Result<_, _>>().unwrap();
    assert_eq!(refs, vec!["p.Main".to_string(), "java.util.List".to_string()]);
}

#[test]
fn enumeration_is_repeatable() {
    let bytes = class_file("p.Outer", &["p.Outer$1Helper", "java.lang.Object", "p.Outer$Inner"]);
    let first: Vec<String> = enumerate_class_references(&bytes).map(Result::unwrap).collect();
    let second: Vec<String> = enumerate_class_references(&bytes).map(Result::unwrap).collect();
    assert_eq!(first, second);
    assert_eq!(
        first,
        vec!["p.Outer", "p.Outer$1Helper", "java.lang.Object", "p.Outer$Inner"]
    );

    let internal: Vec<String> = enumerate_class_references_as(&bytes, ClassNameForm::Internal)
        .map(Result::unwrap)
        .collect();
    assert_eq!(internal[2], "java/lang/Object");
}

#[test]
fn enumeration_is_lazy() {
    // Nothing is parsed until the iterator is driven.
    let refs = enumerate_class_references(&[0xDE, 0xAD]);
    let collected: Vec<_> = refs.collect();
    assert_eq!(collected.len(), 1);
    assert!(matches!(collected[0], Err(Error::MalformedClassData { .. })));
}

#[test]
fn truncated_pool_is_malformed() {
    let bytes = class_file("p.Truncated", &["p.Other"]);
    for cut in [9, 12, 20, bytes.len() - 13] {
        let err = resolve_qualified_name(&bytes[..cut]).unwrap_err();
        match err {
            Error::MalformedClassData { offset, .. } => assert!(offset <= cut, "offset {offset} past cut {cut}"),
            other => panic!("unexpected error: {other}"),
        }
    }
}

#[test]
fn unknown_tag_is_malformed() {
    let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 52, 0, 2, 99, 0, 0];
    bytes.extend_from_slice(&[0, 0, 0, 1]);
    let err = resolve_qualified_name(&bytes).unwrap_err();
    assert!(matches!(err, Error::MalformedClassData { offset: 10, .. }), "{err}");
}

#[test]
fn this_class_must_name_a_class_entry() {
    let mut cp = CpBuilder::new();
    let utf8 = cp.utf8("p/NotAClass");
    let bytes = assemble(&cp, utf8);
    assert!(matches!(
        resolve_qualified_name(&bytes),
        Err(Error::MalformedClassData { .. })
    ));

    let mut cp = CpBuilder::new();
    let dangling = cp.class(9);
    let bytes = assemble(&cp, dangling);
    assert!(matches!(
        resolve_qualified_name(&bytes),
        Err(Error::MalformedClassData { .. })
    ));
}
