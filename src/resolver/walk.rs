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

//! The referral walker: the single-hop delegation-following logic.
//!
//! Three iterator layers are chained here, all lazy. Network I/O
//! happens only inside `next`, so a consumer that stops pulling stops
//! the exploration:
//!
//! * [`Referrals`] queries each candidate server for NS records of the
//!   target name and turns the response into referral tuples (next
//!   server address, or nameserver name still needing an address
//!   lookup);
//! * [`NextHops`] resolves those tuples into concrete addresses,
//!   querying for the nameserver's A/AAAA records where no glue was
//!   provided;
//! * [`FinalAddresses`] asks the surviving candidates for the target's
//!   address records themselves.
//!
//! Every layer produces [`Found`] items. A CNAME discovered along the
//! way short-circuits the whole walk: the canonical name is resolved
//! from scratch and the result travels up the chain as
//! [`Found::Immediate`], after which each layer fuses.

use std::collections::VecDeque;
use std::iter;
use std::net::IpAddr;

use log::{debug, info, warn};

use super::transport::Requester;
use super::{Addresses, Error, Resolver};
use crate::class::Class;
use crate::message::{Qclass, Qtype, Question, Response};
use crate::name::Name;
use crate::rr::{Record, RecordData, Type};

////////////////////////////////////////////////////////////////////////
// WALK ITEMS                                                         //
////////////////////////////////////////////////////////////////////////

/// One result of a walk step.
pub(super) enum Found {
    /// A candidate server address for the next hop (or, at the final
    /// layer, an address answering the query).
    Address(IpAddr),

    /// An answer obtained by short-circuiting the walk through a CNAME.
    /// The remaining referral work must be abandoned; this is the only
    /// result.
    Immediate(IpAddr),
}

/// A lazy stream of walk results.
pub(super) type Stream<'a> = Box<dyn Iterator<Item = Result<Found, Error>> + 'a>;

fn question(qname: Name, rr_type: Type) -> Question {
    Question {
        qname,
        qtype: Qtype::from(rr_type),
        qclass: Qclass::from(Class::IN),
    }
}

////////////////////////////////////////////////////////////////////////
// RECORD SCANNING HELPERS                                            //
////////////////////////////////////////////////////////////////////////

/// Iterates over the authority and answer sections, in that order.
fn authority_and_answer(response: &Response) -> impl Iterator<Item = &Record> {
    response.authorities.iter().chain(response.answers.iter())
}

fn as_address(record: &Record) -> Option<IpAddr> {
    match &record.data {
        RecordData::A(addr) => Some(IpAddr::V4(*addr)),
        RecordData::Aaaa(addr) => Some(IpAddr::V6(*addr)),
        _ => None,
    }
}

fn as_ns(record: &Record) -> Option<&Name> {
    match &record.data {
        RecordData::Ns(nsdname) => Some(nsdname),
        _ => None,
    }
}

fn as_cname(record: &Record) -> Option<&Name> {
    match &record.data {
        RecordData::Cname(canonical) => Some(canonical),
        _ => None,
    }
}

////////////////////////////////////////////////////////////////////////
// THE REFERRAL LAYER                                                 //
////////////////////////////////////////////////////////////////////////

/// A referral tuple: the next nameserver to try. If `needs_lookup` is
/// set, `name` is a nameserver name whose address is not yet known and
/// `server` is where to ask for it; otherwise `server` is the next
/// hop's address itself.
struct Referral {
    name: Name,
    server: IpAddr,
    needs_lookup: bool,
}

enum ReferralStep {
    Hop(Referral),
    Immediate(IpAddr),
}

/// The work queued up for one candidate after its NS response has been
/// scanned. Tasks that require I/O perform it lazily, when the task is
/// executed.
enum Task {
    /// Resolve a CNAME target from scratch; any address found becomes
    /// an immediate answer.
    ResolveCname(Name),

    /// Yield a glue address for a nameserver.
    YieldGlue(Name, IpAddr),

    /// Yield a nameserver name that still needs an address lookup.
    YieldNsLookup(Name),

    /// Ask the current candidate for the CNAME target's address; any
    /// address found becomes an immediate answer. With `abort_on_empty`
    /// (the CNAME-at-SOA case), an empty probe ends the entire referral
    /// stream.
    ProbeCname { cname: Name, abort_on_empty: bool },

    /// Yield an SOA master name that still needs an address lookup.
    YieldSoaMaster(Name),

    /// Resolve an SOA master name from scratch and yield each of its
    /// addresses as a ready next hop.
    ResolveSoaMaster(Name),
}

struct CandidateState<'a, R: Requester> {
    server: IpAddr,
    tasks: VecDeque<Task>,
    /// An in-progress [`Task::ResolveSoaMaster`] drain.
    drain: Option<(Name, Addresses<'a, R>)>,
    yielded_any: bool,
}

/// The first walk layer. For each candidate server, sends one NS query
/// for the target name and works through the referral content of the
/// response.
struct Referrals<'a, R: Requester> {
    resolver: &'a Resolver<R>,
    candidates: Stream<'a>,
    target: Name,
    current: Option<CandidateState<'a, R>>,
    done: bool,
}

impl<'a, R: Requester> Referrals<'a, R> {
    fn new(resolver: &'a Resolver<R>, candidates: Stream<'a>, target: Name) -> Self {
        Self {
            resolver,
            candidates,
            target,
            current: None,
            done: false,
        }
    }

    /// Scans an NS response into the task agenda for one candidate.
    ///
    /// The agenda preserves the scan order of the sections: CNAMEs
    /// first (possible short-circuit), then nameserver glue, then
    /// nameserver names needing lookup, then SOA handling, then a final
    /// CNAME re-scan. Only the scanning is done here; tasks perform
    /// their own I/O when executed.
    fn scan_response(&self, server: IpAddr, response: &Response) -> CandidateState<'a, R> {
        let mut tasks = VecDeque::new();

        // CNAMEs of the target name short-circuit the walk.
        let target_cnames: Vec<Name> = authority_and_answer(response)
            .filter(|record| record.name == self.target)
            .filter_map(as_cname)
            .cloned()
            .collect();
        // The SOA cases below probe any CNAME present, regardless of
        // its owner.
        let all_cnames: Vec<Name> = authority_and_answer(response)
            .filter_map(as_cname)
            .cloned()
            .collect();

        for canonical in &target_cnames {
            tasks.push_back(Task::ResolveCname(canonical.clone()));
        }

        // Glue: address records in the additional section matching a
        // nameserver name.
        for nsdname in authority_and_answer(response).filter_map(as_ns) {
            for additional in &response.additionals {
                if additional.name == *nsdname {
                    if let Some(addr) = as_address(additional) {
                        debug!("glue for {}: {}", nsdname, addr);
                        tasks.push_back(Task::YieldGlue(nsdname.clone(), addr));
                    }
                }
            }
        }

        // Every nameserver name is also offered for lookup, in case
        // glue was absent or insufficient.
        for nsdname in authority_and_answer(response).filter_map(as_ns) {
            tasks.push_back(Task::YieldNsLookup(nsdname.clone()));
        }

        for record in authority_and_answer(response) {
            let soa = match &record.data {
                RecordData::Soa(soa) => soa,
                _ => continue,
            };
            if soa.mname.is_root() {
                info!("ignoring SOA for {} with root MNAME", record.name);
                continue;
            }
            if soa.mname == self.target {
                // A CNAME alongside an SOA for the target itself means
                // the zone answers for the canonical name only.
                if let Some(canonical) = all_cnames.first() {
                    tasks.push_back(Task::ProbeCname {
                        cname: canonical.clone(),
                        abort_on_empty: true,
                    });
                } else {
                    tasks.push_back(Task::YieldSoaMaster(soa.mname.clone()));
                }
            } else {
                for canonical in &all_cnames {
                    tasks.push_back(Task::ProbeCname {
                        cname: canonical.clone(),
                        abort_on_empty: false,
                    });
                }
                tasks.push_back(Task::YieldSoaMaster(soa.mname.clone()));
                tasks.push_back(Task::ResolveSoaMaster(soa.mname.clone()));
            }
        }

        for canonical in &target_cnames {
            tasks.push_back(Task::ResolveCname(canonical.clone()));
        }

        CandidateState {
            server,
            tasks,
            drain: None,
            yielded_any: false,
        }
    }

    /// Executes one task for the current candidate (at `server`),
    /// returning the item to emit (if any).
    fn run_task(&mut self, server: IpAddr, task: Task) -> Option<Result<ReferralStep, Error>> {
        match task {
            Task::YieldGlue(name, addr) => Some(Ok(ReferralStep::Hop(Referral {
                name,
                server: addr,
                needs_lookup: false,
            }))),
            Task::YieldNsLookup(name) | Task::YieldSoaMaster(name) => {
                Some(Ok(ReferralStep::Hop(Referral {
                    name,
                    server,
                    needs_lookup: true,
                })))
            }
            Task::ResolveCname(canonical) => {
                debug!("following CNAME to {}", canonical);
                let mut resolution = self.resolver.resolve_all(&canonical, Qtype::ANY);
                match resolution.next() {
                    Some(Ok(addr)) => {
                        self.done = true;
                        Some(Ok(ReferralStep::Immediate(addr)))
                    }
                    Some(Err(error)) => {
                        self.done = true;
                        Some(Err(error))
                    }
                    None => None,
                }
            }
            Task::ProbeCname {
                cname,
                abort_on_empty,
            } => {
                debug!("probing {} for CNAME target {}", server, cname);
                let candidates: Stream<'_> = Box::new(iter::once(Ok(Found::Address(server))));
                let mut probe = FinalAddresses::new(
                    self.resolver,
                    candidates,
                    cname.clone(),
                    Qtype::from(Type::A),
                );
                match probe.next() {
                    Some(Ok(Found::Address(addr))) | Some(Ok(Found::Immediate(addr))) => {
                        self.done = true;
                        Some(Ok(ReferralStep::Immediate(addr)))
                    }
                    Some(Err(error)) => {
                        self.done = true;
                        Some(Err(error))
                    }
                    None if abort_on_empty => {
                        warn!("no address records for CNAME target {}", cname);
                        self.done = true;
                        None
                    }
                    None => None,
                }
            }
            Task::ResolveSoaMaster(master) => {
                debug!("resolving SOA master {}", master);
                let resolution = self.resolver.resolve_all(&master, Qtype::ANY);
                if let Some(state) = self.current.as_mut() {
                    state.drain = Some((master, resolution));
                }
                None
            }
        }
    }
}

impl<'a, R: Requester> Iterator for Referrals<'a, R> {
    type Item = Result<ReferralStep, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some(mut state) = self.current.take() {
                // Drain an in-progress SOA master resolution first.
                if let Some((master, mut resolution)) = state.drain.take() {
                    match resolution.next() {
                        Some(Ok(addr)) => {
                            state.yielded_any = true;
                            state.drain = Some((master.clone(), resolution));
                            self.current = Some(state);
                            return Some(Ok(ReferralStep::Hop(Referral {
                                name: master,
                                server: addr,
                                needs_lookup: false,
                            })));
                        }
                        Some(Err(error)) => {
                            self.done = true;
                            return Some(Err(error));
                        }
                        None => {
                            self.current = Some(state);
                            continue;
                        }
                    }
                }

                if let Some(task) = state.tasks.pop_front() {
                    let server = state.server;
                    self.current = Some(state);
                    if let Some(item) = self.run_task(server, task) {
                        if let Some(state) = self.current.as_mut() {
                            state.yielded_any = true;
                        }
                        return Some(item);
                    }
                    continue;
                }

                // Agenda exhausted; move on to the next candidate.
                if !state.yielded_any {
                    info!(
                        "referral response from {} contained nothing usable",
                        state.server
                    );
                }
                continue;
            }

            match self.candidates.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(error)) => {
                    self.done = true;
                    return Some(Err(error));
                }
                Some(Ok(Found::Immediate(addr))) => {
                    self.done = true;
                    return Some(Ok(ReferralStep::Immediate(addr)));
                }
                Some(Ok(Found::Address(server))) => {
                    let q = question(self.target.clone(), Type::NS);
                    match self.resolver.request(server, &q) {
                        Ok(response) => {
                            self.current = Some(self.scan_response(server, &response));
                        }
                        Err(Error::BudgetExceeded) => {
                            self.done = true;
                            return Some(Err(Error::BudgetExceeded));
                        }
                        Err(Error::Transport(error)) => {
                            info!("NS request to {} failed: {}", server, error);
                        }
                    }
                }
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////
// THE NEXT-HOP LAYER                                                 //
////////////////////////////////////////////////////////////////////////

/// The in-flight work for one referral tuple that needs an address
/// lookup.
struct Lookup<'a, R: Requester> {
    name: Name,
    server: IpAddr,
    queued: VecDeque<IpAddr>,
    remaining_types: VecDeque<Type>,
    found_any: bool,
    fallback: Option<Addresses<'a, R>>,
}

/// The second walk layer: turns referral tuples into concrete next-hop
/// addresses. Glue addresses pass straight through; nameserver names
/// without glue are looked up (A, then AAAA) at the server that named
/// them, falling back to a fresh resolution of the nameserver name if
/// neither lookup finds anything.
pub(super) struct NextHops<'a, R: Requester> {
    resolver: &'a Resolver<R>,
    referrals: Referrals<'a, R>,
    lookup: Option<Lookup<'a, R>>,
    done: bool,
}

impl<'a, R: Requester> NextHops<'a, R> {
    pub(super) fn new(resolver: &'a Resolver<R>, candidates: Stream<'a>, target: Name) -> Self {
        Self {
            resolver,
            referrals: Referrals::new(resolver, candidates, target),
            lookup: None,
            done: false,
        }
    }
}

impl<'a, R: Requester> Iterator for NextHops<'a, R> {
    type Item = Result<Found, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some(lookup) = self.lookup.as_mut() {
                if let Some(fallback) = lookup.fallback.as_mut() {
                    match fallback.next() {
                        Some(Ok(addr)) => return Some(Ok(Found::Address(addr))),
                        Some(Err(error)) => {
                            self.done = true;
                            return Some(Err(error));
                        }
                        None => {
                            self.lookup = None;
                        }
                    }
                    continue;
                }
                if let Some(addr) = lookup.queued.pop_front() {
                    lookup.found_any = true;
                    return Some(Ok(Found::Address(addr)));
                }
                if let Some(rr_type) = lookup.remaining_types.pop_front() {
                    let q = question(lookup.name.clone(), rr_type);
                    match self.resolver.request(lookup.server, &q) {
                        Ok(response) => {
                            let matches = response
                                .answers
                                .iter()
                                .chain(response.additionals.iter())
                                .filter(|record| {
                                    record.rr_type == rr_type && record.name == lookup.name
                                })
                                .filter_map(as_address);
                            lookup.queued.extend(matches);
                        }
                        Err(Error::BudgetExceeded) => {
                            self.done = true;
                            return Some(Err(Error::BudgetExceeded));
                        }
                        Err(Error::Transport(error)) => {
                            info!(
                                "{} lookup for {} at {} failed: {}",
                                rr_type, lookup.name, lookup.server, error
                            );
                        }
                    }
                    continue;
                }
                if !lookup.found_any {
                    debug!(
                        "no address records for {}, falling back to full resolution",
                        lookup.name
                    );
                    lookup.fallback = Some(self.resolver.resolve_all(&lookup.name, Qtype::ANY));
                    continue;
                }
                self.lookup = None;
                continue;
            }

            match self.referrals.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(error)) => {
                    self.done = true;
                    return Some(Err(error));
                }
                Some(Ok(ReferralStep::Immediate(addr))) => {
                    self.done = true;
                    return Some(Ok(Found::Immediate(addr)));
                }
                Some(Ok(ReferralStep::Hop(referral))) => {
                    if referral.needs_lookup {
                        self.lookup = Some(Lookup {
                            name: referral.name,
                            server: referral.server,
                            queued: VecDeque::new(),
                            remaining_types: VecDeque::from([Type::A, Type::AAAA]),
                            found_any: false,
                            fallback: None,
                        });
                    } else {
                        return Some(Ok(Found::Address(referral.server)));
                    }
                }
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////
// THE FINAL-ADDRESS LAYER                                            //
////////////////////////////////////////////////////////////////////////

/// The last walk layer: asks the candidates believed authoritative for
/// the target's zone for the target's own address records. Only A
/// queries are performed; any record type other than A or ANY therefore
/// produces no results.
pub(super) struct FinalAddresses<'a, R: Requester> {
    resolver: &'a Resolver<R>,
    candidates: Stream<'a>,
    target: Name,
    qtype: Qtype,
    queued: VecDeque<IpAddr>,
    done: bool,
}

impl<'a, R: Requester> FinalAddresses<'a, R> {
    pub(super) fn new(
        resolver: &'a Resolver<R>,
        candidates: Stream<'a>,
        target: Name,
        qtype: Qtype,
    ) -> Self {
        Self {
            resolver,
            candidates,
            target,
            qtype,
            queued: VecDeque::new(),
            done: false,
        }
    }
}

impl<'a, R: Requester> Iterator for FinalAddresses<'a, R> {
    type Item = Result<Found, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(addr) = self.queued.pop_front() {
                return Some(Ok(Found::Address(addr)));
            }
            match self.candidates.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(error)) => {
                    self.done = true;
                    return Some(Err(error));
                }
                Some(Ok(Found::Immediate(addr))) => {
                    self.done = true;
                    return Some(Ok(Found::Immediate(addr)));
                }
                Some(Ok(Found::Address(server))) => {
                    if self.qtype != Qtype::ANY && Type::from(self.qtype) != Type::A {
                        continue;
                    }
                    let q = question(self.target.clone(), Type::A);
                    match self.resolver.request(server, &q) {
                        Ok(response) => {
                            let matches = response
                                .answers
                                .iter()
                                .filter(|record| record.rr_type == Type::A)
                                .filter_map(as_address);
                            self.queued.extend(matches);
                            if self.queued.is_empty() {
                                info!("no address records for {} at {}", self.target, server);
                            }
                        }
                        Err(Error::BudgetExceeded) => {
                            self.done = true;
                            return Some(Err(Error::BudgetExceeded));
                        }
                        Err(Error::Transport(error)) => {
                            info!(
                                "final address query for {} at {} failed: {}",
                                self.target, server, error
                            );
                        }
                    }
                }
            }
        }
    }
}
