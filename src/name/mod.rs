// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Implementation of the [`Name`] type for domain names, and related
//! types.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use arrayvec::ArrayVec;

mod error;
mod label;
mod wire;

pub use error::Error;
pub use label::Label;

/// The maximum length of a DNS name on the wire, per [RFC 1035 § 3.1].
///
/// [RFC 1035 § 3.1]: https://datatracker.ietf.org/doc/html/rfc1035#section-3.1
pub const MAX_WIRE_LEN: usize = 255;

/// The maximum length of a label on the wire, per [RFC 1035 § 3.1].
///
/// [RFC 1035 § 3.1]: https://datatracker.ietf.org/doc/html/rfc1035#section-3.1
pub const MAX_LABEL_LEN: usize = 63;

/// The maximum number of labels (including the null label) in a DNS
/// name. A name of maximum length consists of 127 one-octet labels
/// (each consuming two octets on the wire) followed by the null label.
pub const MAX_N_LABELS: usize = 128;

////////////////////////////////////////////////////////////////////////
// NAMES                                                              //
////////////////////////////////////////////////////////////////////////

/// A domain name.
///
/// A `Name` owns the uncompressed wire representation of the name,
/// along with a table giving the offset of each label within it. Per
/// [RFC 1034 § 3.1], comparison and hashing are ASCII-case-insensitive,
/// while the stored representation preserves the original case.
///
/// [RFC 1034 § 3.1]: https://tools.ietf.org/html/rfc1034#section-3.1
#[derive(Clone)]
pub struct Name {
    wire: Box<[u8]>,
    offsets: Box<[u8]>,
}

impl Name {
    /// Constructs a `Name` from its parts. The caller must ensure that
    /// `wire` is a valid uncompressed name and that `offsets` gives the
    /// offset of each of its labels.
    fn from_parts(wire: Box<[u8]>, offsets: Box<[u8]>) -> Self {
        Self { wire, offsets }
    }

    /// Returns the root name.
    pub fn root() -> Self {
        Self::from_parts(Box::new([0]), Box::new([0]))
    }

    /// Returns the number of labels in this `Name`, including the null
    /// label. Thus the root has length one, and `example.com.` has
    /// length three.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Returns whether this `Name` is the root.
    pub fn is_root(&self) -> bool {
        self.offsets.len() == 1
    }

    /// Returns the label at index `index`, if it exists. Index zero
    /// corresponds to the first (leftmost) label.
    pub fn label(&self, index: usize) -> Option<&Label> {
        let offset = *self.offsets.get(index)? as usize;
        let len = self.wire[offset] as usize;
        Some(Label::from_unchecked(&self.wire[offset + 1..offset + 1 + len]))
    }

    /// Returns an iterator over the labels of this `Name`, from the
    /// first (leftmost) label through the null label.
    pub fn labels(&self) -> Labels {
        Labels {
            name: self,
            index: 0,
        }
    }

    /// Returns the uncompressed wire representation of this `Name`.
    pub fn wire_repr(&self) -> &[u8] {
        &self.wire
    }

    /// Parses a `Name` from its uncompressed wire representation at the
    /// beginning of `octets`. On success, the `Name` and its length on
    /// the wire are returned.
    pub fn try_from_uncompressed(octets: &[u8]) -> Result<(Self, usize), Error> {
        wire::parse_uncompressed(octets)
    }

    /// Parses a (possibly) compressed `Name` at index `start` of
    /// `octets`, following compression pointers as indices into
    /// `octets`. On success, the `Name` and the number of contiguous
    /// octets read at `start` are returned. See
    /// [`wire::parse_compressed`] for details.
    pub fn try_from_compressed(octets: &[u8], start: usize) -> Result<(Self, usize), Error> {
        wire::parse_compressed(octets, start)
    }
}

impl FromStr for Name {
    type Err = Error;

    /// Parses a `Name` from its textual representation. The final dot
    /// is optional except for the root, which is written `.` alone.
    /// Only ASCII strings are accepted, and escape sequences are not
    /// supported.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.is_empty() {
            return Err(Error::StrEmpty);
        } else if !text.is_ascii() {
            return Err(Error::StrNotAscii);
        } else if text == "." {
            return Ok(Self::root());
        }

        let stripped = text.strip_suffix('.').unwrap_or(text);
        let mut wire = ArrayVec::<u8, MAX_WIRE_LEN>::new();
        let mut offsets = ArrayVec::<u8, MAX_N_LABELS>::new();
        for label in stripped.split('.') {
            if label.is_empty() {
                return Err(Error::NullNonTerminal);
            } else if label.len() > MAX_LABEL_LEN {
                return Err(Error::LabelTooLong);
            } else if wire.len() + label.len() + 2 > MAX_WIRE_LEN || offsets.len() + 1 >= MAX_N_LABELS {
                return Err(Error::NameTooLong);
            }
            offsets.push(wire.len() as u8);
            wire.push(label.len() as u8);
            wire.try_extend_from_slice(label.as_bytes()).unwrap();
        }
        offsets.push(wire.len() as u8);
        wire.push(0);
        Ok(Self::from_parts(
            wire.as_slice().into(),
            offsets.as_slice().into(),
        ))
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.wire.len() == other.wire.len()
            && self.offsets == other.offsets
            && self.wire.eq_ignore_ascii_case(&other.wire)
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for octet in self.wire.iter() {
            state.write_u8(octet.to_ascii_lowercase());
        }
    }
}

/// Displays the `Name` in its textual form, with a trailing dot.
impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            f.write_str(".")
        } else {
            for label in self.labels() {
                if !label.is_null() {
                    write!(f, "{}.", label)?;
                }
            }
            Ok(())
        }
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

////////////////////////////////////////////////////////////////////////
// LABEL ITERATION                                                    //
////////////////////////////////////////////////////////////////////////

/// An iterator over the [`Label`]s of a [`Name`], from the first
/// (leftmost) label through the null label.
#[derive(Clone)]
pub struct Labels<'a> {
    name: &'a Name,
    index: usize,
}

impl<'a> Iterator for Labels<'a> {
    type Item = &'a Label;

    fn next(&mut self) -> Option<Self::Item> {
        let label = self.name.label(self.index)?;
        self.index += 1;
        Some(label)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.name.len() - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Labels<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_str_accepts_optional_trailing_dot() {
        let with: Name = "example.test.".parse().unwrap();
        let without: Name = "example.test".parse().unwrap();
        assert_eq!(with, without);
        assert_eq!(with.wire_repr(), b"\x07example\x04test\x00");
    }

    #[test]
    fn from_str_parses_the_root() {
        let root: Name = ".".parse().unwrap();
        assert!(root.is_root());
        assert_eq!(root.len(), 1);
        assert_eq!(root.wire_repr(), b"\x00");
    }

    #[test]
    fn from_str_rejects_invalid_input() {
        assert_eq!("".parse::<Name>(), Err(Error::StrEmpty));
        assert_eq!("exämple.test.".parse::<Name>(), Err(Error::StrNotAscii));
        assert_eq!("example..test.".parse::<Name>(), Err(Error::NullNonTerminal));
        let long_label = format!("{}.test.", "x".repeat(MAX_LABEL_LEN + 1));
        assert_eq!(long_label.parse::<Name>(), Err(Error::LabelTooLong));
        let long_name = "x.".repeat(130);
        assert_eq!(long_name.parse::<Name>(), Err(Error::NameTooLong));
    }

    #[test]
    fn names_compare_case_insensitively() {
        let upper: Name = "EXAMPLE.TEST.".parse().unwrap();
        let lower: Name = "example.test.".parse().unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn labels_iterates_through_the_null_label() {
        let name: Name = "a.example.test.".parse().unwrap();
        let labels: Vec<String> = name.labels().map(|label| label.to_string()).collect();
        assert_eq!(labels, ["a", "example", "test", ""]);
        assert_eq!(name.len(), 4);
    }

    #[test]
    fn display_includes_the_trailing_dot() {
        let name: Name = "example.test".parse().unwrap();
        assert_eq!(name.to_string(), "example.test.");
        assert_eq!(Name::root().to_string(), ".");
    }
}
