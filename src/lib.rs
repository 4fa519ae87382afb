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

//! A recursive DNS resolver.
//!
//! Rootward answers DNS queries by walking the delegation hierarchy
//! itself, starting from the IANA root servers, rather than forwarding
//! to an upstream recursive resolver. The crate provides:
//!
//! * the [`resolver`] module, which implements the iterative resolution
//!   engine (referral walking, TTL caching, and the per-query upstream
//!   request budget);
//! * the [`server`] module, which implements the message-processing
//!   logic of the DNS front end;
//! * the [`io`] module, which provides a network I/O provider driving
//!   the server over TCP and UDP; and
//! * supporting modules for domain [`name`]s, resource records
//!   ([`rr`]), and on-the-wire [`message`] handling.

pub mod class;
pub mod io;
pub mod message;
pub mod name;
pub mod resolver;
pub mod rr;
pub mod server;
pub mod thread;

mod util;
