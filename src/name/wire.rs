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

//! Parsing of domain names from their on-the-wire representations.

use arrayvec::ArrayVec;

use super::{Error, Name, MAX_LABEL_LEN, MAX_N_LABELS, MAX_WIRE_LEN};

/// The top two bits of a label length octet, which (when both are set)
/// mark a compression pointer ([RFC 1035 § 4.1.4]).
///
/// [RFC 1035 § 4.1.4]: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.4
const POINTER_MASK: u8 = 0xc0;

/// Parses an uncompressed name at the beginning of `octets`. On
/// success, the parsed [`Name`] and its length in octets are returned.
pub(super) fn parse_uncompressed(octets: &[u8]) -> Result<(Name, usize), Error> {
    let mut wire = ArrayVec::<u8, MAX_WIRE_LEN>::new();
    let mut offsets = ArrayVec::<u8, MAX_N_LABELS>::new();
    let mut cursor = 0;
    loop {
        let len = copy_label(octets, cursor, &mut wire, &mut offsets)?;
        cursor += len + 1;
        if len == 0 {
            let name = Name::from_parts(wire.as_slice().into(), offsets.as_slice().into());
            return Ok((name, cursor));
        }
    }
}

/// Parses a (possibly) compressed name at index `start` of `octets`.
/// Pointers are followed; indices given in pointers are treated as
/// indices into `octets`, so generally one passes an entire DNS message
/// here. Two things are returned on success:
///
/// * the parsed (and decompressed) [`Name`]; and
/// * the number of contiguous octets read at `start`—equivalently, the
///   number of octets to skip after `start` to read the next field of
///   the message. If a pointer label is present at `start`, this value
///   will be 2.
///
/// To guarantee termination, each pointer must point strictly backward
/// in the message. Names violating this are rejected with
/// [`Error::InvalidPointer`].
pub(super) fn parse_compressed(octets: &[u8], start: usize) -> Result<(Name, usize), Error> {
    let mut wire = ArrayVec::<u8, MAX_WIRE_LEN>::new();
    let mut offsets = ArrayVec::<u8, MAX_N_LABELS>::new();
    let mut cursor = start;
    let mut consumed = None;
    loop {
        let first = *octets.get(cursor).ok_or(Error::UnexpectedEom)?;
        if first & POINTER_MASK == POINTER_MASK {
            let second = *octets.get(cursor + 1).ok_or(Error::UnexpectedEom)?;
            let target = ((first & !POINTER_MASK) as usize) << 8 | second as usize;
            if target >= cursor {
                return Err(Error::InvalidPointer);
            }
            consumed = consumed.or(Some(cursor + 2 - start));
            cursor = target;
        } else {
            let len = copy_label(octets, cursor, &mut wire, &mut offsets)?;
            cursor += len + 1;
            if len == 0 {
                // After a pointer has been followed, `cursor` may be
                // less than `start`, so the subtraction must stay
                // behind the `None` check.
                let consumed = consumed.unwrap_or_else(|| cursor - start);
                let name = Name::from_parts(wire.as_slice().into(), offsets.as_slice().into());
                return Ok((name, consumed));
            }
        }
    }
}

/// Copies the label at index `cursor` of `octets` (including its length
/// octet) into `wire`, recording its offset in `offsets`. The length of
/// the label is returned.
fn copy_label(
    octets: &[u8],
    cursor: usize,
    wire: &mut ArrayVec<u8, MAX_WIRE_LEN>,
    offsets: &mut ArrayVec<u8, MAX_N_LABELS>,
) -> Result<usize, Error> {
    let len = *octets.get(cursor).ok_or(Error::UnexpectedEom)? as usize;
    if len > MAX_LABEL_LEN {
        return Err(Error::LabelTooLong);
    }
    let label = octets
        .get(cursor..cursor + len + 1)
        .ok_or(Error::UnexpectedEom)?;
    if wire.len() + label.len() > MAX_WIRE_LEN || offsets.is_full() {
        return Err(Error::NameTooLong);
    }
    offsets.push(wire.len() as u8);
    wire.try_extend_from_slice(label).unwrap();
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_uncompressed_works() {
        let octets = b"\x07example\x04test\x00trailing garbage";
        let (name, consumed) = parse_uncompressed(octets).unwrap();
        assert_eq!(consumed, 14);
        assert_eq!(name, "example.test.".parse().unwrap());
        assert_eq!(name.wire_repr(), b"\x07example\x04test\x00");
    }

    #[test]
    fn parse_compressed_follows_pointers() {
        // A message-like buffer: "test." at offset 0, then
        // "example" + pointer to offset 0 at offset 6.
        let octets = b"\x04test\x00\x07example\xc0\x00";
        let (name, consumed) = parse_compressed(octets, 6).unwrap();
        assert_eq!(consumed, 10);
        assert_eq!(name, "example.test.".parse().unwrap());
        assert_eq!(name.wire_repr(), b"\x07example\x04test\x00");
    }

    #[test]
    fn parse_compressed_handles_names_ending_before_their_start() {
        // A bare pointer label: the name it refers to lies entirely
        // before the parse position, as in a typical response where
        // answer owner names point back at the question.
        let octets = b"\x04test\x00\x00\xc0\x00";
        let (name, consumed) = parse_compressed(octets, 7).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(name, "test.".parse().unwrap());
    }

    #[test]
    fn parse_compressed_rejects_forward_pointers() {
        // A pointer targeting itself would loop forever if followed.
        let octets = b"\x07example\xc0\x08";
        assert_eq!(parse_compressed(octets, 0), Err(Error::InvalidPointer));
    }

    #[test]
    fn parse_compressed_rejects_truncation() {
        assert_eq!(
            parse_compressed(b"\x07exam", 0),
            Err(Error::UnexpectedEom)
        );
    }

    #[test]
    fn parse_uncompressed_rejects_overlong_names() {
        let mut octets = Vec::new();
        for _ in 0..128 {
            octets.extend_from_slice(b"\x01x");
        }
        octets.push(0);
        assert_eq!(
            parse_uncompressed(&octets).map(|(name, _)| name),
            Err(Error::NameTooLong)
        );
    }

    #[test]
    fn parse_compressed_without_pointers_matches_uncompressed() {
        let octets = b"\x03www\x07example\x03com\x00";
        let (compressed, c1) = parse_compressed(octets, 0).unwrap();
        let (uncompressed, c2) = parse_uncompressed(octets).unwrap();
        assert_eq!(compressed, uncompressed);
        assert_eq!(c1, c2);
        assert!(!compressed.is_root());
    }
}
