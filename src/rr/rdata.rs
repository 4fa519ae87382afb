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

//! Parsed resource record data.

use std::net::{Ipv4Addr, Ipv6Addr};

use super::Type;
use crate::name::{self, Name};

////////////////////////////////////////////////////////////////////////
// RECORD DATA                                                        //
////////////////////////////////////////////////////////////////////////

/// The RDATA of a resource record, parsed into a structured form for
/// the types the resolution engine acts on.
///
/// Record types other than A, NS, CNAME, SOA, and AAAA are preserved
/// verbatim as [`RecordData::Other`]. Embedded domain names are
/// decompressed at parse time, so a `RecordData` is self-contained even
/// though the wire form may point elsewhere in its message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(Name),
    Cname(Name),
    Soa(Box<Soa>),
    Other(Box<[u8]>),
}

/// The RDATA of an SOA record ([RFC 1035 § 3.3.13]).
///
/// [RFC 1035 § 3.3.13]: https://datatracker.ietf.org/doc/html/rfc1035#section-3.3.13
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Soa {
    pub mname: Name,
    pub rname: Name,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

impl RecordData {
    /// Parses the RDATA of a record of type `rr_type` occupying
    /// `octets[start..start + rdlength]`. `octets` must be the entire
    /// DNS message, since compression pointers in embedded names are
    /// indices into it.
    pub fn parse(
        rr_type: Type,
        octets: &[u8],
        start: usize,
        rdlength: usize,
    ) -> Result<Self, Error> {
        let rdata = octets
            .get(start..start + rdlength)
            .ok_or(Error::UnexpectedEom)?;
        match rr_type {
            Type::A => {
                let fixed: [u8; 4] = rdata.try_into().or(Err(Error::BadRdataLength))?;
                Ok(Self::A(fixed.into()))
            }
            Type::AAAA => {
                let fixed: [u8; 16] = rdata.try_into().or(Err(Error::BadRdataLength))?;
                Ok(Self::Aaaa(fixed.into()))
            }
            Type::NS => {
                let (name, len) = Name::try_from_compressed(octets, start)?;
                if len != rdlength {
                    return Err(Error::BadRdataLength);
                }
                Ok(Self::Ns(name))
            }
            Type::CNAME => {
                let (name, len) = Name::try_from_compressed(octets, start)?;
                if len != rdlength {
                    return Err(Error::BadRdataLength);
                }
                Ok(Self::Cname(name))
            }
            Type::SOA => {
                let (mname, mname_len) = Name::try_from_compressed(octets, start)?;
                let (rname, rname_len) = Name::try_from_compressed(octets, start + mname_len)?;
                let fields_start = start + mname_len + rname_len;
                if fields_start + 20 != start + rdlength {
                    return Err(Error::BadRdataLength);
                }
                let mut fields = [0; 5];
                for (i, field) in fields.iter_mut().enumerate() {
                    let at = fields_start + 4 * i;
                    *field = u32::from_be_bytes(octets[at..at + 4].try_into().unwrap());
                }
                Ok(Self::Soa(Box::new(Soa {
                    mname,
                    rname,
                    serial: fields[0],
                    refresh: fields[1],
                    retry: fields[2],
                    expire: fields[3],
                    minimum: fields[4],
                })))
            }
            _ => Ok(Self::Other(rdata.into())),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error encountered while parsing RDATA.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The RDLENGTH field did not match the actual length of the data.
    BadRdataLength,

    /// An embedded domain name was invalid.
    BadName(name::Error),

    /// The RDATA ran past the end of the message.
    UnexpectedEom,
}

impl From<name::Error> for Error {
    fn from(error: name::Error) -> Self {
        Self::BadName(error)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::BadRdataLength => f.write_str("RDLENGTH does not match the RDATA"),
            Self::BadName(error) => write!(f, "invalid embedded name: {error}"),
            Self::UnexpectedEom => f.write_str("unexpected end of message"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_rdata_parses() {
        let octets = b"\xc0\x00\x02\x01";
        let rdata = RecordData::parse(Type::A, octets, 0, 4).unwrap();
        assert_eq!(rdata, RecordData::A([192, 0, 2, 1].into()));
    }

    #[test]
    fn a_rdata_of_wrong_length_is_rejected() {
        let octets = b"\xc0\x00\x02";
        assert_eq!(
            RecordData::parse(Type::A, octets, 0, 3),
            Err(Error::BadRdataLength)
        );
    }

    #[test]
    fn ns_rdata_decompresses_embedded_names() {
        // "test." at offset 0; the NS RDATA at offset 6 is
        // "ns" + pointer to offset 0.
        let octets = b"\x04test\x00\x02ns\xc0\x00";
        let rdata = RecordData::parse(Type::NS, octets, 6, 5).unwrap();
        assert_eq!(rdata, RecordData::Ns("ns.test.".parse().unwrap()));
    }

    #[test]
    fn soa_rdata_parses() {
        let mut octets = Vec::new();
        octets.extend_from_slice(b"\x02ns\x04test\x00");    // MNAME
        octets.extend_from_slice(b"\x05admin\xc0\x03");     // RNAME
        for field in [2022010100u32, 3600, 900, 1209600, 300] {
            octets.extend_from_slice(&field.to_be_bytes());
        }
        let rdata = RecordData::parse(Type::SOA, &octets, 0, octets.len()).unwrap();
        match rdata {
            RecordData::Soa(soa) => {
                assert_eq!(soa.mname, "ns.test.".parse().unwrap());
                assert_eq!(soa.rname, "admin.test.".parse().unwrap());
                assert_eq!(soa.serial, 2022010100);
                assert_eq!(soa.minimum, 300);
            }
            other => panic!("parsed as {other:?}"),
        }
    }

    #[test]
    fn unknown_types_are_preserved_verbatim() {
        let octets = b"\x05\x00\x01\x02";
        let rdata = RecordData::parse(Type::MX, octets, 0, 4).unwrap();
        assert_eq!(rdata, RecordData::Other(octets[..].into()));
    }
}
