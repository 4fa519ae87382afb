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

//! A TTL cache over the upstream transport, with the per-session
//! request budget.

use std::collections::HashMap;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, error};

use super::transport::Requester;
use super::Error;
use crate::message::{Question, Response};
use crate::rr::Ttl;

/// The ceiling on upstream sends per session. Referral chains
/// discovered on the network may be circular, so resolutions must be
/// cut off rather than trusted to converge.
pub const MAX_REQUESTS: u32 = 1000;

/// The ceiling on total lookups per session, cache hits included.
///
/// Cache hits spend no budget, so [`MAX_REQUESTS`] alone cannot stop a
/// walk whose referral data is entirely cached (a glueless NS record
/// naming its own target, say, keeps recursing without ever touching
/// the network again). This counter can.
pub const MAX_LOOKUPS: u32 = 1000;

////////////////////////////////////////////////////////////////////////
// THE CACHING REQUESTER                                              //
////////////////////////////////////////////////////////////////////////

/// A [`Requester`] wrapper that memoizes responses by (question,
/// server) and enforces the session request budget.
///
/// A cached response stays valid until the smallest TTL found anywhere
/// in it has elapsed; a response with no records at all never expires.
/// Expired entries are evicted lazily, when a lookup lands on them.
/// There is no capacity bound: the cache grows for the lifetime of the
/// worker that owns it.
///
/// The budget counts transport sends only. Cache hits do not spend
/// budget, but once the counter has passed [`MAX_REQUESTS`], every call
/// fails until [`reset_budget`](Self::reset_budget) is invoked. A
/// separate per-session counter caps total lookups at [`MAX_LOOKUPS`],
/// cache hits included.
pub struct CachedRequester<R> {
    inner: R,
    cache: HashMap<(Question, IpAddr), Entry>,
    budget_used: u32,
    lookups: u32,
}

struct Entry {
    response: Rc<Response>,
    inserted: Instant,
    /// `None` means the entry never expires.
    ttl: Option<Duration>,
}

impl<R> CachedRequester<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: HashMap::new(),
            budget_used: 0,
            lookups: 0,
        }
    }

    /// Zeroes the session counters. To be called once per incoming
    /// query, before resolution starts.
    pub fn reset_budget(&mut self) {
        self.budget_used = 0;
        self.lookups = 0;
    }

    /// Returns the number of upstream sends charged to the current
    /// session.
    pub fn budget_used(&self) -> u32 {
        self.budget_used
    }

    #[cfg(test)]
    pub(crate) fn exhaust_budget(&mut self) {
        self.budget_used = MAX_REQUESTS + 1;
    }
}

impl<R: Requester> CachedRequester<R> {
    /// Returns the response for `question` from `server`, consulting
    /// the cache first and delegating to the transport on a miss.
    pub fn request(&mut self, server: IpAddr, question: &Question) -> Result<Rc<Response>, Error> {
        debug!("budget {}/{}", self.budget_used, MAX_REQUESTS);
        if self.budget_used > MAX_REQUESTS {
            error!("request budget exhausted");
            return Err(Error::BudgetExceeded);
        }
        self.lookups += 1;
        if self.lookups > MAX_LOOKUPS {
            error!("session lookup ceiling exceeded");
            return Err(Error::BudgetExceeded);
        }

        let key = (question.clone(), server);
        if let Some(entry) = self.cache.get(&key) {
            let expired = entry
                .ttl
                .map_or(false, |ttl| entry.inserted + ttl <= Instant::now());
            if expired {
                debug!(
                    "cached response for {} {} from {} has expired",
                    question.qname, question.qtype, server
                );
                self.cache.remove(&key);
            } else {
                debug!(
                    "cache hit for {} {} from {}",
                    question.qname, question.qtype, server
                );
                return Ok(entry.response.clone());
            }
        }

        self.budget_used += 1;
        let response = self
            .inner
            .request(server, question)
            .map(Rc::new)
            .map_err(Error::Transport)?;
        let ttl = response.min_ttl().map(Ttl::as_duration);
        debug!(
            "caching response for {} {} from {} with ttl {:?}",
            question.qname, question.qtype, server, ttl
        );
        self.cache.insert(
            key,
            Entry {
                response: response.clone(),
                inserted: Instant::now(),
                ttl,
            },
        );
        Ok(response)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::super::testing::{a_record, answer_only, question, MockRequester};
    use super::*;
    use crate::rr::Type;

    const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

    #[test]
    fn fresh_entries_are_served_from_the_cache() {
        let mut mock = MockRequester::new();
        let q = question("example.test.", Type::A);
        mock.script(
            SERVER,
            q.clone(),
            answer_only(vec![a_record("example.test.", [9, 9, 9, 9], 300)]),
        );
        let log = mock.log_handle();

        let mut requester = CachedRequester::new(mock);
        let first = requester.request(SERVER, &q).unwrap();
        let second = requester.request(SERVER, &q).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn expired_entries_are_refetched_exactly_once() {
        let mut mock = MockRequester::new();
        let q = question("example.test.", Type::A);
        // TTL 0 expires immediately.
        mock.script(
            SERVER,
            q.clone(),
            answer_only(vec![a_record("example.test.", [9, 9, 9, 9], 0)]),
        );
        let log = mock.log_handle();

        let mut requester = CachedRequester::new(mock);
        requester.request(SERVER, &q).unwrap();
        requester.request(SERVER, &q).unwrap();
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn empty_responses_are_cached_forever() {
        let mut mock = MockRequester::new();
        let q = question("example.test.", Type::A);
        mock.script(SERVER, q.clone(), answer_only(vec![]));
        let log = mock.log_handle();

        let mut requester = CachedRequester::new(mock);
        requester.request(SERVER, &q).unwrap();
        requester.request(SERVER, &q).unwrap();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn cache_hits_do_not_spend_budget() {
        let mut mock = MockRequester::new();
        let q = question("example.test.", Type::A);
        mock.script(
            SERVER,
            q.clone(),
            answer_only(vec![a_record("example.test.", [9, 9, 9, 9], 300)]),
        );

        let mut requester = CachedRequester::new(mock);
        requester.request(SERVER, &q).unwrap();
        requester.request(SERVER, &q).unwrap();
        assert_eq!(requester.budget_used(), 1);
    }

    #[test]
    fn cache_hits_still_count_against_the_lookup_ceiling() {
        let mut mock = MockRequester::new();
        let q = question("example.test.", Type::A);
        mock.script(
            SERVER,
            q.clone(),
            answer_only(vec![a_record("example.test.", [9, 9, 9, 9], 300)]),
        );

        let mut requester = CachedRequester::new(mock);
        for _ in 0..MAX_LOOKUPS {
            requester.request(SERVER, &q).unwrap();
        }
        // Only the first lookup was a transport send, yet the ceiling
        // trips anyway.
        assert_eq!(requester.budget_used(), 1);
        assert!(matches!(
            requester.request(SERVER, &q),
            Err(Error::BudgetExceeded)
        ));
        requester.reset_budget();
        assert!(requester.request(SERVER, &q).is_ok());
    }

    #[test]
    fn budget_exhaustion_fails_the_following_call() {
        let mut requester = CachedRequester::new(MockRequester::new());
        requester.budget_used = MAX_REQUESTS;
        // The counter has not yet exceeded the ceiling, so one more
        // send is allowed (and fails at the transport, which is fine).
        let q = question("example.test.", Type::A);
        assert!(matches!(
            requester.request(SERVER, &q),
            Err(Error::Transport(_))
        ));
        assert_eq!(requester.budget_used(), MAX_REQUESTS + 1);
        assert!(matches!(
            requester.request(SERVER, &q),
            Err(Error::BudgetExceeded)
        ));
    }

    #[test]
    fn reset_budget_zeroes_the_counter() {
        let mut requester = CachedRequester::new(MockRequester::new());
        requester.budget_used = MAX_REQUESTS + 1;
        requester.reset_budget();
        assert_eq!(requester.budget_used(), 0);
    }
}
