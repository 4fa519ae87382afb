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

//! Implementation of the [`Response`] type for parsed upstream
//! responses.

use super::{reader, Rcode, Reader};
use crate::rr::{Record, Ttl};

////////////////////////////////////////////////////////////////////////
// RESPONSES                                                          //
////////////////////////////////////////////////////////////////////////

/// A DNS response, parsed into its sections.
///
/// While [`Reader`] gives sequential access to a message in place, the
/// resolution engine needs to scan the sections of an upstream response
/// repeatedly and in arbitrary order, and to keep responses around in
/// its cache after the receive buffer is reused. `Response` is the
/// fully owned form it works with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub rcode: Rcode,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Response {
    /// Parses a full DNS response message.
    pub fn parse(octets: &[u8]) -> Result<Self, reader::Error> {
        let mut reader = Reader::try_from(octets)?;
        let rcode = reader.rcode();
        for _ in 0..reader.qdcount() {
            reader.read_question()?;
        }
        let ancount = reader.ancount();
        let nscount = reader.nscount();
        let arcount = reader.arcount();
        let mut read_section = |count: u16| -> Result<Vec<Record>, reader::Error> {
            (0..count).map(|_| reader.read_rr()).collect()
        };
        let answers = read_section(ancount)?;
        let authorities = read_section(nscount)?;
        let additionals = read_section(arcount)?;
        Ok(Self {
            rcode,
            answers,
            authorities,
            additionals,
        })
    }

    /// Returns an iterator over all records of the response, in message
    /// order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
    }

    /// Returns the smallest TTL of any record in the response, or
    /// `None` if the response contains no records.
    pub fn min_ttl(&self) -> Option<Ttl> {
        self.records().map(|record| record.ttl).min()
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rr::RecordData;

    // A response with one A answer (TTL 300) and one NS authority
    // record (TTL 60) for example.test.
    const MIXED_SECTIONS: &[u8] =
        b"\x00\x2a\x84\x00\x00\x01\x00\x01\x00\x01\x00\x00\x07example\x04test\
          \x00\x00\x01\x00\x01\
          \xc0\x0c\x00\x01\x00\x01\x00\x00\x01\x2c\x00\x04\xc0\x00\x02\x01\
          \xc0\x0c\x00\x02\x00\x01\x00\x00\x00\x3c\x00\x05\x02ns\xc0\x14";

    #[test]
    fn responses_parse_by_section() {
        let response = Response::parse(MIXED_SECTIONS).unwrap();
        assert_eq!(response.rcode, Rcode::NoError);
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.authorities.len(), 1);
        assert!(response.additionals.is_empty());
        assert_eq!(response.answers[0].data, RecordData::A([192, 0, 2, 1].into()));
        assert_eq!(
            response.authorities[0].data,
            RecordData::Ns("ns.test.".parse().unwrap())
        );
    }

    #[test]
    fn min_ttl_takes_all_sections_into_account() {
        let response = Response::parse(MIXED_SECTIONS).unwrap();
        assert_eq!(response.min_ttl(), Some(Ttl::from(60)));
        let empty = Response {
            rcode: Rcode::NxDomain,
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        };
        assert_eq!(empty.min_ttl(), None);
    }
}
