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

//! The upstream transport: sending a single question to a single
//! server and parsing the reply.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use log::debug;

use crate::message::{reader, writer, Question, Response, Writer};

/// The standard DNS port.
pub const DNS_PORT: u16 = 53;

/// The default time limit on one upstream exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

////////////////////////////////////////////////////////////////////////
// THE REQUESTER TRAIT                                                //
////////////////////////////////////////////////////////////////////////

/// The capability the resolution engine consumes: send one question to
/// one upstream server and return the parsed response.
///
/// The engine itself never touches the network; everything it learns
/// arrives through this trait. Tests substitute a scripted
/// implementation for [`TcpRequester`].
pub trait Requester {
    fn request(&mut self, server: IpAddr, question: &Question) -> Result<Response, Error>;
}

////////////////////////////////////////////////////////////////////////
// TCP TRANSPORT                                                      //
////////////////////////////////////////////////////////////////////////

/// A [`Requester`] that queries upstream servers over TCP, framing
/// messages with the two-octet length prefix of [RFC 1035 § 4.2.2].
///
/// A single timeout covers the whole exchange: connecting, writing the
/// query, and reading the response.
///
/// [RFC 1035 § 4.2.2]: https://datatracker.ietf.org/doc/html/rfc1035#section-4.2.2
pub struct TcpRequester {
    timeout: Duration,
}

impl TcpRequester {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpRequester {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl Requester for TcpRequester {
    fn request(&mut self, server: IpAddr, question: &Question) -> Result<Response, Error> {
        let id = rand::random();
        debug!(
            "sending {} {} query to {} (ID {})",
            question.qname, question.qtype, server, id
        );

        let mut buf = [0; 512];
        let query_len = serialize_query(&mut buf, id, question)?;

        let deadline = Instant::now() + self.timeout;
        let stream = TcpStream::connect_timeout(&SocketAddr::new(server, DNS_PORT), self.timeout)
            .map_err(check_for_timeout)?;
        let mut stream = DeadlineStream { stream, deadline };

        let mut framed = Vec::with_capacity(2 + query_len);
        framed.extend_from_slice(&(query_len as u16).to_be_bytes());
        framed.extend_from_slice(&buf[..query_len]);
        stream.write_all(&framed)?;

        let mut len_buf = [0; 2];
        stream.read_exact(&mut len_buf)?;
        let response_len = u16::from_be_bytes(len_buf) as usize;
        let mut response_buf = vec![0; response_len];
        stream.read_exact(&mut response_buf)?;

        let response = Response::parse(&response_buf)?;
        if u16::from_be_bytes([response_buf[0], response_buf[1]]) != id {
            return Err(Error::IdMismatch);
        }
        Ok(response)
    }
}

/// Serializes a query for `question` into `buf`, returning its length.
fn serialize_query(buf: &mut [u8], id: u16, question: &Question) -> Result<usize, Error> {
    let mut writer = Writer::new(buf, buf.len())?;
    writer.set_id(id);
    writer.set_rd(true);
    writer.add_question(question)?;
    Ok(writer.finish())
}

/// A [`TcpStream`] wrapper whose reads and writes each respect what
/// remains of an overall deadline.
struct DeadlineStream {
    stream: TcpStream,
    deadline: Instant,
}

impl DeadlineStream {
    /// Returns the time left until the deadline, or [`Error::Timeout`]
    /// if it has already passed. The result is never zero, since a zero
    /// socket timeout means "no timeout".
    fn remaining(&self) -> Result<Duration, Error> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            Err(Error::Timeout)
        } else {
            Ok(remaining)
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.stream
            .set_read_timeout(Some(self.remaining()?))
            .map_err(Error::Io)?;
        self.stream.read_exact(buf).map_err(check_for_timeout)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.stream
            .set_write_timeout(Some(self.remaining()?))
            .map_err(Error::Io)?;
        self.stream.write_all(buf).map_err(check_for_timeout)
    }
}

/// Converts timeout-indicating I/O errors into [`Error::Timeout`].
fn check_for_timeout(error: io::Error) -> Error {
    match error.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
        _ => Error::Io(error),
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error signaling that an upstream exchange failed.
#[derive(Debug)]
pub enum Error {
    /// The exchange did not complete within the timeout.
    Timeout,

    /// The server's response could not be parsed.
    Malformed(reader::Error),

    /// The server's response carried a different ID than the query.
    IdMismatch,

    /// The query could not be serialized.
    BadQuery(writer::Error),

    /// A network error other than a timeout.
    Io(io::Error),
}

impl From<reader::Error> for Error {
    fn from(error: reader::Error) -> Self {
        Self::Malformed(error)
    }
}

impl From<writer::Error> for Error {
    fn from(error: writer::Error) -> Self {
        Self::BadQuery(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("upstream exchange timed out"),
            Self::Malformed(error) => write!(f, "malformed response: {error}"),
            Self::IdMismatch => f.write_str("response ID does not match the query"),
            Self::BadQuery(error) => write!(f, "failed to serialize query: {error}"),
            Self::Io(error) => error.fmt(f),
        }
    }
}

impl std::error::Error for Error {}
