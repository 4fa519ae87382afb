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

//! Implementation of the [`Writer`] type to write on-the-wire DNS
//! messages.

use std::fmt;

use super::constants::*;
use super::{Opcode, Question, Rcode};
use crate::rr::{Record, RecordData};

////////////////////////////////////////////////////////////////////////
// WRITER                                                             //
////////////////////////////////////////////////////////////////////////

/// A "frame" around a buffer into which a DNS message is written.
///
/// Like its counterpart [`Reader`](super::Reader), a `Writer` allows
/// header fields to be set at any time, while questions and resource
/// records are appended through a cursor and must be added in message
/// order (questions, then answers). Domain names are always written
/// uncompressed.
///
/// A `Writer` enforces a size limit on the message. Operations that
/// would push the message past the limit fail with
/// [`Error::Truncation`] and leave the message unchanged, so the caller
/// can set the TC bit and send what fit.
pub struct Writer<'a> {
    octets: &'a mut [u8],
    cursor: usize,
    limit: usize,
    section: Section,
    qdcount: u16,
    ancount: u16,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Section {
    Question,
    Answer,
}

impl<'a> Writer<'a> {
    /// Creates a new `Writer` from the underlying buffer `octets`. The
    /// message size is limited to `limit` or `octets.len()` (whichever
    /// is smaller). If the smaller limit is too small to hold a full
    /// DNS message header of 12 octets, then this will fail.
    pub fn new(octets: &'a mut [u8], limit: usize) -> Result<Self> {
        let limit = limit.min(octets.len());
        if limit < HEADER_SIZE {
            Err(Error::Truncation)
        } else {
            octets[0..HEADER_SIZE].fill(0);
            Ok(Self {
                octets,
                cursor: HEADER_SIZE,
                limit,
                section: Section::Question,
                qdcount: 0,
                ancount: 0,
            })
        }
    }

    /// Sets the 16-bit ID of the message.
    pub fn set_id(&mut self, id: u16) {
        self.octets[ID_START..ID_END].copy_from_slice(&id.to_be_bytes());
    }

    /// Sets or clears the QR (query response) bit.
    pub fn set_qr(&mut self, qr: bool) {
        if qr {
            self.octets[QR_BYTE] |= QR_MASK;
        } else {
            self.octets[QR_BYTE] &= !QR_MASK;
        }
    }

    /// Sets the message's opcode.
    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.octets[OPCODE_BYTE] &= !OPCODE_MASK;
        self.octets[OPCODE_BYTE] |= u8::from(opcode) << OPCODE_SHIFT;
    }

    /// Sets or clears the TC (truncation) bit.
    pub fn set_tc(&mut self, tc: bool) {
        if tc {
            self.octets[TC_BYTE] |= TC_MASK;
        } else {
            self.octets[TC_BYTE] &= !TC_MASK;
        }
    }

    /// Sets or clears the RD (recursion desired) bit.
    pub fn set_rd(&mut self, rd: bool) {
        if rd {
            self.octets[RD_BYTE] |= RD_MASK;
        } else {
            self.octets[RD_BYTE] &= !RD_MASK;
        }
    }

    /// Sets or clears the RA (recursion available) bit.
    pub fn set_ra(&mut self, ra: bool) {
        if ra {
            self.octets[RA_BYTE] |= RA_MASK;
        } else {
            self.octets[RA_BYTE] &= !RA_MASK;
        }
    }

    /// Sets the RCODE of the message.
    pub fn set_rcode(&mut self, rcode: Rcode) {
        self.octets[RCODE_BYTE] &= !RCODE_MASK;
        self.octets[RCODE_BYTE] |= u8::from(rcode);
    }

    /// Adds a question to the message. This must be used before any
    /// resource records are added.
    pub fn add_question(&mut self, question: &Question) -> Result<()> {
        if self.section != Section::Question {
            return Err(Error::OutOfOrder);
        }
        let new_qdcount = self.qdcount.checked_add(1).ok_or(Error::CountOverflow)?;
        self.with_rollback(|this| {
            this.try_push(question.qname.wire_repr())?;
            this.try_push_u16(question.qtype.into())?;
            this.try_push_u16(question.qclass.into())
        })?;
        self.qdcount = new_qdcount;
        self.write_u16(QDCOUNT_START, self.qdcount);
        Ok(())
    }

    /// Adds a resource record to the answer section of the message.
    /// This must be used after any questions are added.
    pub fn add_answer(&mut self, record: &Record) -> Result<()> {
        let new_ancount = self.ancount.checked_add(1).ok_or(Error::CountOverflow)?;
        self.with_rollback(|this| {
            this.try_push(record.name.wire_repr())?;
            this.try_push_u16(record.rr_type.into())?;
            this.try_push_u16(record.class.into())?;
            this.try_push_u32(record.ttl.into())?;
            this.push_rdata(&record.data)
        })?;
        self.section = Section::Answer;
        self.ancount = new_ancount;
        self.write_u16(ANCOUNT_START, self.ancount);
        Ok(())
    }

    /// Finishes the message, returning its final size.
    pub fn finish(self) -> usize {
        self.cursor
    }

    /// Writes the RDLENGTH and RDATA fields for `data` at the cursor.
    fn push_rdata(&mut self, data: &RecordData) -> Result<()> {
        let rdlength_at = self.cursor;
        self.try_push_u16(0)?;
        let rdata_start = self.cursor;
        match data {
            RecordData::A(addr) => self.try_push(&addr.octets())?,
            RecordData::Aaaa(addr) => self.try_push(&addr.octets())?,
            RecordData::Ns(name) | RecordData::Cname(name) => self.try_push(name.wire_repr())?,
            RecordData::Soa(soa) => {
                self.try_push(soa.mname.wire_repr())?;
                self.try_push(soa.rname.wire_repr())?;
                for field in [soa.serial, soa.refresh, soa.retry, soa.expire, soa.minimum] {
                    self.try_push_u32(field)?;
                }
            }
            RecordData::Other(octets) => self.try_push(octets)?,
        }
        let rdlength = self.cursor - rdata_start;
        if rdlength > u16::MAX as usize {
            return Err(Error::Truncation);
        }
        self.write_u16(rdlength_at, rdlength as u16);
        Ok(())
    }

    /// Runs `writes`, restoring the cursor to its previous position if
    /// any of them fail.
    fn with_rollback(&mut self, writes: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        let saved_cursor = self.cursor;
        writes(self).map_err(|error| {
            self.cursor = saved_cursor;
            error
        })
    }

    fn try_push(&mut self, octets: &[u8]) -> Result<()> {
        if self.cursor + octets.len() > self.limit {
            Err(Error::Truncation)
        } else {
            self.octets[self.cursor..self.cursor + octets.len()].copy_from_slice(octets);
            self.cursor += octets.len();
            Ok(())
        }
    }

    fn try_push_u16(&mut self, value: u16) -> Result<()> {
        self.try_push(&value.to_be_bytes())
    }

    fn try_push_u32(&mut self, value: u32) -> Result<()> {
        self.try_push(&value.to_be_bytes())
    }

    /// Writes `value` at the (already written) position `at`.
    fn write_u16(&mut self, at: usize, value: u16) {
        self.octets[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }
}

impl fmt::Debug for Writer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Writer")
            .field("cursor", &self.cursor)
            .field("limit", &self.limit)
            .field("qdcount", &self.qdcount)
            .field("ancount", &self.ancount)
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error signaling that a [`Writer`] operation could not be
/// completed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// Adding the question or resource record would overflow the
    /// corresponding 16-bit counter in the DNS header.
    CountOverflow,

    /// There is not enough room left in the buffer.
    Truncation,

    /// An attempt was made to serialize a question or resource record
    /// in the wrong place in the message (e.g., adding a question after
    /// an answer resource record has already been serialized).
    OutOfOrder,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::CountOverflow => f.write_str("record count would overflow"),
            Self::Truncation => f.write_str("message would be truncated"),
            Self::OutOfOrder => f.write_str("question or record serialized out of order"),
        }
    }
}

impl std::error::Error for Error {}

/// The type returned by fallible [`Writer`] methods.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::super::{Qclass, Qtype, Reader};
    use super::*;
    use crate::class::Class;
    use crate::name::Name;
    use crate::rr::{Ttl, Type};

    fn a_question() -> Question {
        Question {
            qname: "example.test.".parse().unwrap(),
            qtype: Qtype::from(Type::A),
            qclass: Qclass::from(Class::IN),
        }
    }

    #[test]
    fn written_messages_read_back() {
        let mut buf = [0; 512];
        let mut writer = Writer::new(&mut buf, 512).unwrap();
        writer.set_id(0x1234);
        writer.set_qr(true);
        writer.set_rd(true);
        writer.set_ra(true);
        writer.add_question(&a_question()).unwrap();
        writer
            .add_answer(&Record {
                name: "example.test.".parse().unwrap(),
                rr_type: Type::A,
                class: Class::IN,
                ttl: Ttl::from(300),
                data: RecordData::A([192, 0, 2, 1].into()),
            })
            .unwrap();
        let len = writer.finish();

        let mut reader = Reader::try_from(&buf[..len]).unwrap();
        assert_eq!(reader.id(), 0x1234);
        assert!(reader.qr());
        assert!(reader.rd());
        assert_eq!(reader.qdcount(), 1);
        assert_eq!(reader.ancount(), 1);
        assert_eq!(reader.read_question().unwrap(), a_question());
        let answer = reader.read_rr().unwrap();
        assert_eq!(answer.name, "example.test.".parse::<Name>().unwrap());
        assert_eq!(answer.ttl, Ttl::from(300));
        assert_eq!(answer.data, RecordData::A([192, 0, 2, 1].into()));
        assert!(reader.at_eom());
    }

    #[test]
    fn questions_may_not_follow_answers() {
        let mut buf = [0; 512];
        let mut writer = Writer::new(&mut buf, 512).unwrap();
        writer.add_question(&a_question()).unwrap();
        writer
            .add_answer(&Record {
                name: "example.test.".parse().unwrap(),
                rr_type: Type::A,
                class: Class::IN,
                ttl: Ttl::ZERO,
                data: RecordData::A([192, 0, 2, 1].into()),
            })
            .unwrap();
        assert_eq!(writer.add_question(&a_question()), Err(Error::OutOfOrder));
    }

    #[test]
    fn failed_writes_leave_the_message_unchanged() {
        let mut buf = [0; 512];
        // Room for the header and the question, but not the answer.
        let mut writer = Writer::new(&mut buf, 32).unwrap();
        writer.add_question(&a_question()).unwrap();
        let result = writer.add_answer(&Record {
            name: "example.test.".parse().unwrap(),
            rr_type: Type::A,
            class: Class::IN,
            ttl: Ttl::ZERO,
            data: RecordData::A([192, 0, 2, 1].into()),
        });
        assert_eq!(result, Err(Error::Truncation));
        let len = writer.finish();
        let reader = Reader::try_from(&buf[..len]).unwrap();
        assert_eq!(reader.qdcount(), 1);
        assert_eq!(reader.ancount(), 0);
    }
}
