//! Constant-pool scanner for `.class` files.
//!
//! Only the entries needed to name classes are materialized: `Utf8` strings
//! and `Class` references. Every other tag is skipped by its width. The pool
//! is 1-indexed and `Long`/`Double` entries occupy two slots, so indices
//! recorded here line up with the ones the rest of the class file uses.
//!
//! ```rust,ignore
//! use jvmti_classbytes::classfile::{resolve_qualified_name, enumerate_class_references};
//!
//! let name = resolve_qualified_name(&bytes)?;          // "com.example.Foo"
//! for referenced in enumerate_class_references(&bytes) {
//!     println!("{}", referenced?);
//! }
//! ```

use std::iter::FusedIterator;

use crate::error::{Error, Result};
use crate::names::ClassNameForm;

pub const MAGIC: u32 = 0xCAFEBABE;

mod tag {
    pub const UTF8: u8 = 1;
    pub const INTEGER: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const LONG: u8 = 5;
    pub const DOUBLE: u8 = 6;
    pub const CLASS: u8 = 7;
    pub const STRING: u8 = 8;
    pub const FIELDREF: u8 = 9;
    pub const METHODREF: u8 = 10;
    pub const INTERFACE_METHODREF: u8 = 11;
    pub const NAME_AND_TYPE: u8 = 12;
    pub const METHOD_HANDLE: u8 = 15;
    pub const METHOD_TYPE: u8 = 16;
    pub const DYNAMIC: u8 = 17;
    pub const INVOKE_DYNAMIC: u8 = 18;
    pub const MODULE: u8 = 19;
    pub const PACKAGE: u8 = 20;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Unused,
    Utf8(String),
    Class { name_index: u16 },
    Skipped,
}

/// The name-relevant part of a class file's constant pool.
#[derive(Debug, Clone)]
pub struct ConstantPool {
    slots: Vec<Slot>,
    // Byte offset of each entry's tag, for diagnostics.
    offsets: Vec<usize>,
}

impl ConstantPool {
    /// Reads the pool from a complete class file.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        read_header(&mut r)?;
        parse_constant_pool(&mut r)
    }

    /// Number of slots including the unused slot 0 (the class file's `constant_pool_count`).
    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// The string stored at `index`, if that slot is a `Utf8` entry.
    pub fn utf8(&self, index: u16) -> Option<&str> {
        match self.slots.get(index as usize) {
            Some(Slot::Utf8(s)) => Some(s),
            _ => None,
        }
    }

    /// Follows a `Class` entry to the internal name it points at.
    pub fn class_name(&self, index: u16) -> Result<&str> {
        let name_index = match self.slots.get(index as usize) {
            Some(Slot::Class { name_index }) => *name_index,
            _ => {
                return Err(Error::malformed(
                    self.offset_of(index),
                    format!("constant pool #{index} is not a Class entry"),
                ))
            }
        };
        self.utf8(name_index).ok_or_else(|| {
            Error::malformed(
                self.offset_of(index),
                format!("Class entry #{index} points at #{name_index}, which is not a Utf8 entry"),
            )
        })
    }

    /// Indices of every `Class` entry, in pool order.
    pub fn class_indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Class { .. } => Some(i as u16),
            _ => None,
        })
    }

    fn offset_of(&self, index: u16) -> usize {
        self.offsets
            .get(index as usize)
            .copied()
            .or_else(|| self.offsets.last().copied())
            .unwrap_or(0)
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn eof(&self, wanted: usize) -> Error {
        Error::malformed(
            self.pos,
            format!("unexpected end of class data (needed {wanted} bytes, {} left)", self.remaining()),
        )
    }

    fn read_u1(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(self.eof(1));
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u2(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u4(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(self.eof(len));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }
}

fn read_header(r: &mut Reader) -> Result<()> {
    let magic = r.read_u4()?;
    if magic != MAGIC {
        return Err(Error::malformed(0, format!("invalid magic {magic:#010x}")));
    }
    // minor_version, major_version
    r.skip(4)
}

fn parse_constant_pool(r: &mut Reader) -> Result<ConstantPool> {
    let count = r.read_u2()? as usize;
    let mut slots = Vec::with_capacity(count.max(1));
    let mut offsets = Vec::with_capacity(count.max(1));
    slots.push(Slot::Unused); // index 0 is unused
    offsets.push(r.pos);

    let mut i = 1;
    while i < count {
        let at = r.pos;
        let t = r.read_u1()?;
        let slot = match t {
            tag::UTF8 => {
                let len = r.read_u2()? as usize;
                let data_at = r.pos;
                let raw = r.read_bytes(len)?;
                let s = cesu8::from_java_cesu8(raw)
                    .map_err(|_| Error::malformed(data_at, "invalid modified UTF-8 in Utf8 entry"))?;
                Slot::Utf8(s.into_owned())
            }
            tag::CLASS => Slot::Class { name_index: r.read_u2()? },
            tag::INTEGER
            | tag::FLOAT
            | tag::FIELDREF
            | tag::METHODREF
            | tag::INTERFACE_METHODREF
            | tag::NAME_AND_TYPE
            | tag::DYNAMIC
            | tag::INVOKE_DYNAMIC => {
                r.skip(4)?;
                Slot::Skipped
            }
            tag::LONG | tag::DOUBLE => {
                r.skip(8)?;
                slots.push(Slot::Skipped);
                offsets.push(at);
                slots.push(Slot::Unused);
                offsets.push(at);
                i += 2;
                continue;
            }
            tag::STRING | tag::METHOD_TYPE | tag::MODULE | tag::PACKAGE => {
                r.skip(2)?;
                Slot::Skipped
            }
            tag::METHOD_HANDLE => {
                r.skip(3)?;
                Slot::Skipped
            }
            other => {
                return Err(Error::malformed(
                    at,
                    format!("unknown constant pool tag {other} at entry #{i}"),
                ))
            }
        };
        slots.push(slot);
        offsets.push(at);
        i += 1;
    }

    Ok(ConstantPool { slots, offsets })
}

/// Reads the class's own name (`this_class`) in source form: `com.example.Foo`.
pub fn resolve_qualified_name(bytes: &[u8]) -> Result<String> {
    resolve_name(bytes, ClassNameForm::Qualified)
}

/// Reads the class's own name in the requested form.
pub fn resolve_name(bytes: &[u8], form: ClassNameForm) -> Result<String> {
    let mut r = Reader::new(bytes);
    read_header(&mut r)?;
    let pool = parse_constant_pool(&mut r)?;
    // access_flags
    r.skip(2)?;
    let at = r.pos;
    let this_class = r.read_u2()?;
    let internal = pool.class_name(this_class).map_err(|e| match e {
        Error::MalformedClassData { reason, .. } => Error::malformed(at, format!("this_class: {reason}")),
        other => other,
    })?;
    Ok(form.render(internal))
}

/// Every class the constant pool references, in source form.
///
/// The sequence is lazy: nothing is parsed until the first `next()`. It is
/// also single-pass; call this again to enumerate a second time. A malformed
/// buffer yields one `Err` and then ends.
pub fn enumerate_class_references(bytes: &[u8]) -> ClassReferences<'_> {
    enumerate_class_references_as(bytes, ClassNameForm::Qualified)
}

/// Like [`enumerate_class_references`] with a chosen name form.
pub fn enumerate_class_references_as(bytes: &[u8], form: ClassNameForm) -> ClassReferences<'_> {
    ClassReferences {
        form,
        state: State::Pending(bytes),
    }
}

/// Iterator returned by [`enumerate_class_references`].
pub struct ClassReferences<'a> {
    form: ClassNameForm,
    state: State<'a>,
}

enum State<'a> {
    Pending(&'a [u8]),
    Scanning { pool: ConstantPool, next: usize },
    Done,
}

impl<'a> Iterator for ClassReferences<'a> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if let State::Pending(bytes) = self.state {
            match ConstantPool::parse(bytes) {
                Ok(pool) => self.state = State::Scanning { pool, next: 1 },
                Err(e) => {
                    self.state = State::Done;
                    return Some(Err(e));
                }
            }
        }

        let State::Scanning { pool, next } = &mut self.state else {
            return None;
        };
        while *next < pool.count() {
            let index = *next as u16;
            *next += 1;
            if !matches!(pool.slots[index as usize], Slot::Class { .. }) {
                continue;
            }
            let resolved = pool.class_name(index).map(|internal| self.form.render(internal));
            if resolved.is_err() {
                self.state = State::Done;
            }
            return Some(resolved);
        }
        self.state = State::Done;
        None
    }
}

impl FusedIterator for ClassReferences<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_header_reports_offset() {
        let err = resolve_qualified_name(&[0xCA, 0xFE, 0xBA, 0xBE, 0, 0]).unwrap_err();
        match err {
            Error::MalformedClassData { offset, .. } => assert_eq!(offset, 4),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bad_magic_is_malformed() {
        let err = resolve_qualified_name(&[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 52, 0, 1]).unwrap_err();
        assert!(matches!(err, Error::MalformedClassData { offset: 0, .. }));
    }
}
