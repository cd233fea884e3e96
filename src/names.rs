//! Conversions between the two spellings of a JVM class name.
//!
//! The *qualified* (source) form separates packages with `.`
//! (`com.example.Foo$Bar`), the *internal* form used inside class files uses
//! `/` (`com/example/Foo$Bar`). Nested-class `$` separators are left alone in
//! both directions, so converting back and forth is lossless.

/// Which spelling a name-returning operation should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassNameForm {
    /// `com.example.Foo`
    #[default]
    Qualified,
    /// `com/example/Foo`
    Internal,
}

impl ClassNameForm {
    /// Renders an internal name in this form.
    pub fn render(self, internal: &str) -> String {
        match self {
            ClassNameForm::Qualified => to_qualified_name(internal),
            ClassNameForm::Internal => internal.to_string(),
        }
    }
}

/// `com.example.Foo` -> `com/example/Foo`
pub fn to_internal_name(name: &str) -> String {
    name.replace('.', "/")
}

/// `com/example/Foo` -> `com.example.Foo`
pub fn to_qualified_name(name: &str) -> String {
    name.replace('/', ".")
}

/// Path of the `.class` resource for a class name in either form.
pub fn resource_path(name: &str) -> String {
    let mut path = to_internal_name(name);
    path.push_str(".class");
    path
}

/// The name with its package stripped (`a.b.Outer$Inner` -> `Outer$Inner`).
pub fn simple_binary_name(name: &str) -> &str {
    match name.rfind(|c| c == '.' || c == '/') {
        Some(i) => &name[i + 1..],
        None => name,
    }
}
