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

//! The iterative resolution engine.
//!
//! Starting from the IANA root servers, [`Resolver`] walks the DNS
//! delegation hierarchy toward the target name, one referral hop per
//! label. The walking itself lives in the [`walk`](self) submodule's
//! iterator layers; upstream responses pass through a TTL cache
//! ([`CachedRequester`]) that also enforces the per-session request
//! budget, and reach the network through a [`Requester`]
//! implementation.
//!
//! A `Resolver` is single-threaded by design: each server worker owns
//! one, together with its cache and budget. Nothing here is `Sync`.

use std::cell::RefCell;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;

use log::{debug, warn};

use crate::message::{Qtype, Question, Response};
use crate::name::Name;

pub mod cache;
pub mod transport;
mod walk;

pub use cache::{CachedRequester, MAX_LOOKUPS, MAX_REQUESTS};
pub use transport::{Requester, TcpRequester};

use walk::{FinalAddresses, Found, NextHops, Stream};

#[cfg(test)]
pub(crate) mod testing;

/// The IANA root servers, per <https://www.iana.org/domains/root/servers>.
pub const ROOT_SERVERS: [IpAddr; 13] = [
    IpAddr::V4(Ipv4Addr::new(198, 41, 0, 4)),     // a.root-servers.net
    IpAddr::V4(Ipv4Addr::new(199, 9, 14, 201)),   // b.root-servers.net
    IpAddr::V4(Ipv4Addr::new(192, 33, 4, 12)),    // c.root-servers.net
    IpAddr::V4(Ipv4Addr::new(199, 7, 91, 13)),    // d.root-servers.net
    IpAddr::V4(Ipv4Addr::new(192, 203, 230, 10)), // e.root-servers.net
    IpAddr::V4(Ipv4Addr::new(192, 5, 5, 241)),    // f.root-servers.net
    IpAddr::V4(Ipv4Addr::new(192, 112, 36, 4)),   // g.root-servers.net
    IpAddr::V4(Ipv4Addr::new(198, 97, 190, 53)),  // h.root-servers.net
    IpAddr::V4(Ipv4Addr::new(192, 36, 148, 17)),  // i.root-servers.net
    IpAddr::V4(Ipv4Addr::new(192, 58, 128, 30)),  // j.root-servers.net
    IpAddr::V4(Ipv4Addr::new(193, 0, 14, 129)),   // k.root-servers.net
    IpAddr::V4(Ipv4Addr::new(199, 7, 83, 42)),    // l.root-servers.net
    IpAddr::V4(Ipv4Addr::new(202, 12, 27, 33)),   // m.root-servers.net
];

////////////////////////////////////////////////////////////////////////
// THE RESOLVER                                                       //
////////////////////////////////////////////////////////////////////////

/// The resolution engine.
pub struct Resolver<R: Requester> {
    requester: RefCell<CachedRequester<R>>,
}

impl<R: Requester> Resolver<R> {
    pub fn new(requester: R) -> Self {
        Self {
            requester: RefCell::new(CachedRequester::new(requester)),
        }
    }

    /// Resolves `name` to a lazy sequence of addresses.
    ///
    /// The root name resolves to the root server set itself. For any
    /// other name, the referral walk is repeated once per label, always
    /// querying for the full target name; the hop count merely
    /// guarantees enough referral steps for a fully delegated chain.
    /// Exploration is demand-driven: upstream queries are sent only as
    /// the returned sequence is advanced.
    ///
    /// An empty sequence means no address was found; that is a valid
    /// terminal outcome, not an error. [`Error::BudgetExceeded`] is the
    /// only error the sequence can produce, and it ends the sequence.
    pub fn resolve_all(&self, name: &Name, qtype: Qtype) -> Addresses<'_, R> {
        if name.is_root() {
            debug!("resolving the root");
            return Addresses {
                inner: AddressesInner::Roots(ROOT_SERVERS.iter()),
            };
        }

        debug!("resolving {}", name);
        let hops = name.len() - 1;
        let mut candidates: Stream<'_> =
            Box::new(ROOT_SERVERS.iter().map(|&addr| Ok(Found::Address(addr))));
        for _ in 0..hops {
            candidates = Box::new(NextHops::new(self, candidates, name.clone()));
        }
        Addresses {
            inner: AddressesInner::Walk {
                stream: FinalAddresses::new(self, candidates, name.clone(), qtype),
                done: false,
            },
        }
    }

    /// Resolves `name` to its first discovered address, or `None` if
    /// the name has none.
    pub fn resolve_first(&self, name: &Name, qtype: Qtype) -> Result<Option<IpAddr>, Error> {
        match self.resolve_all(name, qtype).next().transpose()? {
            Some(addr) => Ok(Some(addr)),
            None => {
                warn!("no address found for {}", name);
                Ok(None)
            }
        }
    }

    /// Zeroes the session request budget. To be called before each
    /// incoming query.
    pub fn reset_budget(&self) {
        self.requester.borrow_mut().reset_budget();
    }

    /// Returns the number of upstream sends charged to the current
    /// session.
    pub fn budget_used(&self) -> u32 {
        self.requester.borrow().budget_used()
    }

    /// Sends `question` to `server` through the cache.
    pub(super) fn request(
        &self,
        server: IpAddr,
        question: &Question,
    ) -> Result<Rc<Response>, Error> {
        self.requester.borrow_mut().request(server, question)
    }
}

////////////////////////////////////////////////////////////////////////
// THE ADDRESS SEQUENCE                                               //
////////////////////////////////////////////////////////////////////////

/// The lazy sequence of addresses produced by
/// [`Resolver::resolve_all`].
pub struct Addresses<'a, R: Requester> {
    inner: AddressesInner<'a, R>,
}

enum AddressesInner<'a, R: Requester> {
    Roots(std::slice::Iter<'static, IpAddr>),
    Walk {
        stream: FinalAddresses<'a, R>,
        done: bool,
    },
}

impl<R: Requester> Iterator for Addresses<'_, R> {
    type Item = Result<IpAddr, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            AddressesInner::Roots(roots) => roots.next().copied().map(Ok),
            AddressesInner::Walk { stream, done } => {
                if *done {
                    return None;
                }
                match stream.next() {
                    Some(Ok(Found::Address(addr))) => Some(Ok(addr)),
                    Some(Ok(Found::Immediate(addr))) => {
                        // The walk is abandoned; this is the only
                        // result.
                        debug!("short-circuit answer: {}", addr);
                        *done = true;
                        Some(Ok(addr))
                    }
                    Some(Err(error)) => {
                        *done = true;
                        Some(Err(error))
                    }
                    None => None,
                }
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error produced by the resolution engine.
#[derive(Debug)]
pub enum Error {
    /// The session's upstream request budget has been exhausted. Fatal
    /// for the resolution in progress.
    BudgetExceeded,

    /// An upstream exchange failed. Within a walk this is local to one
    /// candidate server (the walker logs it and moves on); it surfaces
    /// only from direct cache requests.
    Transport(transport::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BudgetExceeded => f.write_str("upstream request budget exhausted"),
            Self::Transport(error) => error.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
