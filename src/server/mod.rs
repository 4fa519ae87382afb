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

//! The DNS server front end.
//!
//! [`Server`] implements the message-handling surface: I/O providers
//! submit raw received messages through [`Server::handle_message`],
//! passing in the [`Resolver`] owned by the calling worker. The
//! `Server` itself holds only cross-worker state, namely the override
//! table loaded from configuration.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, RwLock};

use log::{debug, info, warn};

use crate::class::Class;
use crate::message::{Opcode, Qclass, Qtype, Question, Rcode, Reader, Writer};
use crate::name::Name;
use crate::resolver::{Requester, Resolver};
use crate::rr::{Record, RecordData, Ttl, Type};

/// A table mapping exact domain names to fixed answer addresses,
/// consulted before the resolution engine.
pub type OverrideTable = HashMap<Name, Ipv4Addr>;

////////////////////////////////////////////////////////////////////////
// SERVER                                                             //
////////////////////////////////////////////////////////////////////////

/// A DNS server front end.
pub struct Server {
    overrides: RwLock<Arc<OverrideTable>>,
}

impl Server {
    pub fn new(overrides: Arc<OverrideTable>) -> Self {
        Self {
            overrides: RwLock::new(overrides),
        }
    }

    /// Returns the current override table.
    pub fn overrides(&self) -> Arc<OverrideTable> {
        self.overrides.read().unwrap().clone()
    }

    /// Atomically replaces the override table. Workers pick up the new
    /// table on their next message.
    pub fn set_overrides(&self, overrides: Arc<OverrideTable>) {
        *self.overrides.write().unwrap() = overrides;
    }

    /// Handles a received DNS message. This is the API through which
    /// I/O providers submit messages.
    ///
    /// `received_buf` contains the message received, and
    /// `received_info` provides additional information about it.
    /// `response_buf` is a buffer into which a response message may be
    /// serialized; it must be at least 512 octets for UDP transport and
    /// 65,535 octets for TCP transport, or this method will panic.
    /// `resolver` is the calling worker's resolution engine.
    ///
    /// A [`Response`] is returned, signifying whether a response is to
    /// be sent and, if so, how long the response message written into
    /// `response_buf` is.
    pub fn handle_message<R: Requester>(
        &self,
        received_buf: &[u8],
        received_info: ReceivedInfo,
        response_buf: &mut [u8],
        resolver: &Resolver<R>,
    ) -> Response {
        let response_size_limit = match received_info.transport {
            Transport::Tcp => u16::MAX as usize,
            Transport::Udp => 512,
        };
        if response_buf.len() < response_size_limit {
            panic!("the response buffer is not large enough");
        }

        // Ignore messages that do not contain a full DNS header, and
        // messages that are themselves responses.
        let mut received = match Reader::try_from(received_buf) {
            Ok(reader) => reader,
            Err(_) => return Response::None,
        };
        if received.qr() {
            return Response::None;
        }

        debug!(
            "handling message {} from {} over {}",
            received.id(),
            received_info.source,
            received_info.transport
        );

        // The buffer size was checked above, so Writer::new cannot
        // fail.
        let mut response = Writer::new(response_buf, response_size_limit).unwrap();
        response.set_id(received.id());
        response.set_qr(true);
        response.set_opcode(received.opcode());
        response.set_ra(true);

        if received.opcode() != Opcode::Query {
            response.set_rcode(Rcode::NotImp);
            return Response::Single(response.finish());
        }
        response.set_rd(received.rd());

        // Read the questions and echo them into the response.
        let mut questions = Vec::new();
        for _ in 0..received.qdcount() {
            match received.read_question() {
                Ok(question) => {
                    if response.add_question(&question).is_err() {
                        response.set_rcode(Rcode::ServFail);
                        return Response::Single(response.finish());
                    }
                    questions.push(question);
                }
                Err(_) => {
                    response.set_rcode(Rcode::FormErr);
                    return Response::Single(response.finish());
                }
            }
        }

        // Each question is answered independently; if any of them
        // fails, the whole response is marked REFUSED (but answers
        // already found are still included).
        let overrides = self.overrides();
        let mut failed = false;
        for question in &questions {
            match self.answer_question(question, &overrides, resolver, &mut response) {
                Ok(()) => (),
                Err(AnswerError::Failed) => failed = true,
                Err(AnswerError::Truncated) => {
                    response.set_tc(true);
                    break;
                }
            }
        }
        response.set_rcode(if failed { Rcode::Refused } else { Rcode::NoError });
        Response::Single(response.finish())
    }

    /// Answers a single question, appending any answer record found to
    /// `response`.
    fn answer_question<R: Requester>(
        &self,
        question: &Question,
        overrides: &OverrideTable,
        resolver: &Resolver<R>,
        response: &mut Writer,
    ) -> Result<(), AnswerError> {
        debug!("processing question for {} {}", question.qname, question.qtype);

        if question.qclass != Qclass::from(Class::IN) || question.qtype != Qtype::from(Type::A) {
            info!(
                "refusing question for {} with unsupported type/class {}/{}",
                question.qname, question.qtype, question.qclass
            );
            return Err(AnswerError::Failed);
        }

        if let Some(&addr) = overrides.get(&question.qname) {
            info!("answering {} -> {} from the override table", question.qname, addr);
            return add_answer(response, &question.qname, IpAddr::V4(addr));
        }

        resolver.reset_budget();
        match resolver.resolve_first(&question.qname, question.qtype) {
            Ok(Some(addr)) => add_answer(response, &question.qname, addr),
            Ok(None) => {
                warn!("resolution of {} found no address", question.qname);
                Err(AnswerError::Failed)
            }
            Err(error) => {
                warn!("resolution of {} failed: {}", question.qname, error);
                Err(AnswerError::Failed)
            }
        }
    }
}

/// Appends an answer record for `qname` with address `addr`.
///
/// Answers are written with TTL 0, since a per-worker cache cannot
/// vouch for how long the record has already been held.
fn add_answer(response: &mut Writer, qname: &Name, addr: IpAddr) -> Result<(), AnswerError> {
    let (rr_type, data) = match addr {
        IpAddr::V4(addr) => (Type::A, RecordData::A(addr)),
        IpAddr::V6(addr) => (Type::AAAA, RecordData::Aaaa(addr)),
    };
    let record = Record {
        name: qname.clone(),
        rr_type,
        class: Class::IN,
        ttl: Ttl::ZERO,
        data,
    };
    response.add_answer(&record).map_err(|_| AnswerError::Truncated)
}

enum AnswerError {
    /// The question could not be answered; the response is REFUSED.
    Failed,

    /// The response buffer is full; remaining answers are dropped and
    /// TC is set.
    Truncated,
}

////////////////////////////////////////////////////////////////////////
// RECEIVED MESSAGE METADATA                                          //
////////////////////////////////////////////////////////////////////////

/// Information about a received message, passed to
/// [`Server::handle_message`] along with the message itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReceivedInfo {
    pub source: IpAddr,
    pub transport: Transport,
}

impl ReceivedInfo {
    pub fn new(source: IpAddr, transport: Transport) -> Self {
        Self { source, transport }
    }
}

/// The transport over which a message was received.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

/// The outcome of [`Server::handle_message`]: either a single response
/// message of the given length, or no response at all.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Response {
    Single(usize),
    None,
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use lazy_static::lazy_static;

    use super::*;
    use crate::resolver::testing::{
        a_record, answer_only, ip, name, ns_record, question, referral, MockRequester,
    };
    use crate::resolver::ROOT_SERVERS;

    lazy_static! {
        static ref RECEIVED_INFO: ReceivedInfo =
            ReceivedInfo::new(ip([198, 51, 100, 1]), Transport::Udp);
    }

    fn build_query(id: u16, questions: &[Question]) -> Vec<u8> {
        let mut buf = vec![0; 512];
        let mut writer = Writer::new(&mut buf, 512).unwrap();
        writer.set_id(id);
        writer.set_rd(true);
        for question in questions {
            writer.add_question(question).unwrap();
        }
        let len = writer.finish();
        buf.truncate(len);
        buf
    }

    fn handle(
        server: &Server,
        resolver: &Resolver<MockRequester>,
        query: &[u8],
    ) -> Option<Vec<u8>> {
        let mut response_buf = vec![0; 512];
        match server.handle_message(query, *RECEIVED_INFO, &mut response_buf, resolver) {
            Response::Single(len) => {
                response_buf.truncate(len);
                Some(response_buf)
            }
            Response::None => None,
        }
    }

    #[test]
    fn overridden_names_are_answered_without_resolution() {
        let mut overrides = OverrideTable::new();
        overrides.insert(name("printer.lan."), Ipv4Addr::new(10, 0, 0, 9));
        let server = Server::new(Arc::new(overrides));

        let mock = MockRequester::new();
        let log = mock.log_handle();
        let resolver = Resolver::new(mock);

        let query = build_query(0x1234, &[question("printer.lan.", Type::A)]);
        let response = handle(&server, &resolver, &query).unwrap();

        let mut reader = Reader::try_from(&response[..]).unwrap();
        assert_eq!(reader.id(), 0x1234);
        assert!(reader.qr());
        assert_eq!(reader.rcode(), Rcode::NoError);
        assert_eq!(reader.ancount(), 1);
        reader.read_question().unwrap();
        let answer = reader.read_rr().unwrap();
        assert_eq!(answer.name, name("printer.lan."));
        assert_eq!(answer.ttl, Ttl::ZERO);
        assert_eq!(answer.data, RecordData::A(Ipv4Addr::new(10, 0, 0, 9)));

        // The engine was never consulted.
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn resolved_answers_get_ttl_zero() {
        let server = Server::new(Arc::new(OverrideTable::new()));
        let mut mock = MockRequester::new();
        let delegation = referral(
            vec![ns_record("example.com.", "ns1.example.com.")],
            vec![a_record("ns1.example.com.", [5, 6, 7, 8], 3600)],
        );
        mock.script(
            ROOT_SERVERS[0],
            question("example.com.", Type::NS),
            delegation.clone(),
        );
        mock.script(ip([5, 6, 7, 8]), question("example.com.", Type::NS), delegation);
        mock.script(
            ip([5, 6, 7, 8]),
            question("example.com.", Type::A),
            answer_only(vec![a_record("example.com.", [9, 9, 9, 9], 3600)]),
        );
        let resolver = Resolver::new(mock);

        let query = build_query(7, &[question("example.com.", Type::A)]);
        let response = handle(&server, &resolver, &query).unwrap();

        let mut reader = Reader::try_from(&response[..]).unwrap();
        assert_eq!(reader.rcode(), Rcode::NoError);
        assert_eq!(reader.ancount(), 1);
        reader.read_question().unwrap();
        let answer = reader.read_rr().unwrap();
        assert_eq!(answer.ttl, Ttl::ZERO);
        assert_eq!(answer.data, RecordData::A(Ipv4Addr::new(9, 9, 9, 9)));
    }

    #[test]
    fn unsupported_question_types_are_refused() {
        let server = Server::new(Arc::new(OverrideTable::new()));
        let resolver = Resolver::new(MockRequester::new());

        let query = build_query(7, &[question("example.com.", Type::AAAA)]);
        let response = handle(&server, &resolver, &query).unwrap();

        let reader = Reader::try_from(&response[..]).unwrap();
        assert_eq!(reader.rcode(), Rcode::Refused);
        assert_eq!(reader.ancount(), 0);
    }

    #[test]
    fn failed_resolution_is_refused() {
        let server = Server::new(Arc::new(OverrideTable::new()));
        // Nothing scripted: every upstream query times out and the
        // resolution comes back empty.
        let resolver = Resolver::new(MockRequester::new());

        let query = build_query(7, &[question("example.com.", Type::A)]);
        let response = handle(&server, &resolver, &query).unwrap();

        let reader = Reader::try_from(&response[..]).unwrap();
        assert_eq!(reader.rcode(), Rcode::Refused);
        assert_eq!(reader.ancount(), 0);
    }

    #[test]
    fn partial_failure_keeps_successful_answers() {
        let mut overrides = OverrideTable::new();
        overrides.insert(name("printer.lan."), Ipv4Addr::new(10, 0, 0, 9));
        let server = Server::new(Arc::new(overrides));
        let resolver = Resolver::new(MockRequester::new());

        let query = build_query(
            7,
            &[
                question("printer.lan.", Type::A),
                question("example.com.", Type::AAAA),
            ],
        );
        let response = handle(&server, &resolver, &query).unwrap();

        let reader = Reader::try_from(&response[..]).unwrap();
        assert_eq!(reader.rcode(), Rcode::Refused);
        assert_eq!(reader.qdcount(), 2);
        assert_eq!(reader.ancount(), 1);
    }

    #[test]
    fn responses_are_ignored() {
        let server = Server::new(Arc::new(OverrideTable::new()));
        let resolver = Resolver::new(MockRequester::new());

        let mut query = build_query(7, &[question("example.com.", Type::A)]);
        query[2] |= 0x80; // QR
        let mut response_buf = vec![0; 512];
        let outcome =
            server.handle_message(&query, *RECEIVED_INFO, &mut response_buf, &resolver);
        assert_eq!(outcome, Response::None);
    }

    #[test]
    fn non_query_opcodes_get_notimp() {
        let server = Server::new(Arc::new(OverrideTable::new()));
        let resolver = Resolver::new(MockRequester::new());

        let mut query = build_query(7, &[question("example.com.", Type::A)]);
        query[2] |= 5 << 3; // opcode UPDATE
        let response = handle(&server, &resolver, &query).unwrap();

        let reader = Reader::try_from(&response[..]).unwrap();
        assert_eq!(reader.rcode(), Rcode::NotImp);
        assert_eq!(reader.qdcount(), 0);
    }

    #[test]
    fn override_table_swaps_are_visible() {
        let server = Server::new(Arc::new(OverrideTable::new()));
        let resolver = Resolver::new(MockRequester::new());

        let query = build_query(7, &[question("printer.lan.", Type::A)]);
        let response = handle(&server, &resolver, &query).unwrap();
        let reader = Reader::try_from(&response[..]).unwrap();
        assert_eq!(reader.rcode(), Rcode::Refused);

        let mut overrides = OverrideTable::new();
        overrides.insert(name("printer.lan."), Ipv4Addr::new(10, 0, 0, 9));
        server.set_overrides(Arc::new(overrides));

        let response = handle(&server, &resolver, &query).unwrap();
        let reader = Reader::try_from(&response[..]).unwrap();
        assert_eq!(reader.rcode(), Rcode::NoError);
    }
}
