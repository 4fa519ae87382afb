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

//! Scripted transports and response-building helpers shared by the
//! resolver tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::rc::Rc;

use super::transport::{self, Requester};
use crate::class::Class;
use crate::message::{Qclass, Qtype, Question, Rcode, Response};
use crate::name::Name;
use crate::rr::{Record, RecordData, Soa, Ttl, Type};

/// A [`Requester`] that serves scripted responses and records every
/// transport send it is asked to make. Unscripted (server, question)
/// pairs fail with a timeout.
pub(crate) struct MockRequester {
    responses: HashMap<(IpAddr, Question), Response>,
    log: Rc<RefCell<Vec<(IpAddr, Question)>>>,
}

impl MockRequester {
    pub(crate) fn new() -> Self {
        Self {
            responses: HashMap::new(),
            log: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub(crate) fn script(&mut self, server: IpAddr, question: Question, response: Response) {
        self.responses.insert((server, question), response);
    }

    /// Returns a handle to the send log, usable after the requester has
    /// been moved into a resolver.
    pub(crate) fn log_handle(&self) -> Rc<RefCell<Vec<(IpAddr, Question)>>> {
        self.log.clone()
    }
}

impl Requester for MockRequester {
    fn request(&mut self, server: IpAddr, question: &Question) -> Result<Response, transport::Error> {
        self.log.borrow_mut().push((server, question.clone()));
        self.responses
            .get(&(server, question.clone()))
            .cloned()
            .ok_or(transport::Error::Timeout)
    }
}

pub(crate) fn name(text: &str) -> Name {
    text.parse().unwrap()
}

pub(crate) fn question(qname: &str, rr_type: Type) -> Question {
    Question {
        qname: name(qname),
        qtype: Qtype::from(rr_type),
        qclass: Qclass::from(Class::IN),
    }
}

pub(crate) fn a_record(owner: &str, addr: [u8; 4], ttl: u32) -> Record {
    Record {
        name: name(owner),
        rr_type: Type::A,
        class: Class::IN,
        ttl: Ttl::from(ttl),
        data: RecordData::A(addr.into()),
    }
}

pub(crate) fn ns_record(zone: &str, nameserver: &str) -> Record {
    Record {
        name: name(zone),
        rr_type: Type::NS,
        class: Class::IN,
        ttl: Ttl::from(3600),
        data: RecordData::Ns(name(nameserver)),
    }
}

pub(crate) fn cname_record(owner: &str, canonical: &str) -> Record {
    Record {
        name: name(owner),
        rr_type: Type::CNAME,
        class: Class::IN,
        ttl: Ttl::from(3600),
        data: RecordData::Cname(name(canonical)),
    }
}

pub(crate) fn soa_record(zone: &str, mname: &str) -> Record {
    Record {
        name: name(zone),
        rr_type: Type::SOA,
        class: Class::IN,
        ttl: Ttl::from(3600),
        data: RecordData::Soa(Box::new(Soa {
            mname: name(mname),
            rname: name("hostmaster.invalid."),
            serial: 1,
            refresh: 3600,
            retry: 900,
            expire: 1209600,
            minimum: 300,
        })),
    }
}

pub(crate) fn response(
    rcode: Rcode,
    answers: Vec<Record>,
    authorities: Vec<Record>,
    additionals: Vec<Record>,
) -> Response {
    Response {
        rcode,
        answers,
        authorities,
        additionals,
    }
}

/// A NOERROR response with only an answer section.
pub(crate) fn answer_only(answers: Vec<Record>) -> Response {
    response(Rcode::NoError, answers, Vec::new(), Vec::new())
}

/// A NOERROR referral: NS records in the authority section, glue in the
/// additional section.
pub(crate) fn referral(authorities: Vec<Record>, additionals: Vec<Record>) -> Response {
    response(Rcode::NoError, Vec::new(), authorities, additionals)
}

pub(crate) fn servfail() -> Response {
    response(Rcode::ServFail, Vec::new(), Vec::new(), Vec::new())
}

pub(crate) fn ip(octets: [u8; 4]) -> IpAddr {
    IpAddr::from(octets)
}
