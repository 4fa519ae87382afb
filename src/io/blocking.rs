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

//! Implementation of the blocking I/O provider.

// NOTE: In this provider, I/O error handling is generally to exit the
// task. Worker threads are respawnable, so this causes the thread to
// respawn, possibly after a delay (if the last respawn occurred too
// recently); this prevents us from using up all CPU time on I/O
// operations that repeatedly fail. For the TCP connection handler,
// this aborts the connection on I/O error, as appropriate.
//
// The single exception is that *sends* in the UDP receive/send loop do
// not cause the task to exit, but are rather logged and ignored.
// Therefore we will keep processing incoming messages as long as the
// *receive* portion continues to work.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::error;

use crate::resolver::{Resolver, TcpRequester};
use crate::server::{ReceivedInfo, Response, Server, Transport};
use crate::thread::ThreadGroup;

/// A blocking I/O provider.
///
/// This provider uses blocking I/O over the standard library's TCP and
/// UDP sockets, with a configurable number of worker threads for
/// concurrency. Each worker thread constructs its own
/// [`Resolver<TcpRequester>`] when it starts and keeps it for its
/// lifetime: caches are per-worker and never shared, so the workers
/// need no synchronization around resolution state.
pub struct BlockingIoProvider {
    config: BlockingIoConfig,
    tcp_listeners: Vec<TcpListener>,
    udp_sockets: Vec<UdpSocket>,
}

/// Configuration options for the [`BlockingIoProvider`].
pub struct BlockingIoConfig {
    /// The number of TCP worker threads to run for each TCP listener.
    /// Each worker accepts and services one connection at a time.
    pub tcp_workers_per_listener: usize,

    /// The number of UDP worker threads to run for each UDP socket.
    pub udp_workers_per_socket: usize,

    /// The timeout for each upstream exchange performed by the workers'
    /// resolvers.
    pub upstream_timeout: Duration,
}

impl BlockingIoProvider {
    /// Creates a new `BlockingIoProvider`. This call binds TCP and UDP
    /// sockets in preparation, but does not start the server.
    pub fn bind<T, U>(config: BlockingIoConfig, tcp_addrs: T, udp_addrs: U) -> io::Result<Self>
    where
        T: IntoIterator<Item = SocketAddr>,
        U: IntoIterator<Item = SocketAddr>,
    {
        let mut tcp_listeners = Vec::new();
        for addr in tcp_addrs {
            let listener = TcpListener::bind(addr)?;
            // Accepts are polled so that workers can notice group
            // shutdown; see run_tcp_worker.
            listener.set_nonblocking(true)?;
            tcp_listeners.push(listener);
        }

        let mut udp_sockets = Vec::new();
        for addr in udp_addrs {
            let socket = UdpSocket::bind(addr)?;
            socket.set_read_timeout(Some(CHECK_FOR_SHUTDOWN_TIMEOUT))?;
            udp_sockets.push(socket);
        }

        Ok(Self {
            config,
            tcp_listeners,
            udp_sockets,
        })
    }

    /// Starts the server's worker threads on the provided
    /// [`ThreadGroup`]. The server is shut down by shutting down the
    /// group; workers notice within [`CHECK_FOR_SHUTDOWN_TIMEOUT`].
    pub fn start(
        self,
        server: &Arc<Server>,
        group: &Arc<ThreadGroup>,
    ) -> Result<(), crate::thread::Error> {
        let upstream_timeout = self.config.upstream_timeout;

        for (i, tcp_listener) in self.tcp_listeners.into_iter().enumerate() {
            for j in 0..self.config.tcp_workers_per_listener {
                let name = format!("tcp worker {i}/{j}");
                let listener = tcp_listener.try_clone().map_err(crate::thread::Error::Io)?;
                let group_clone = group.clone();
                let server = server.clone();
                let task = move || {
                    let resolver = Resolver::new(TcpRequester::new(upstream_timeout));
                    log_io_errors(run_tcp_worker(&group_clone, &server, &listener, &resolver));
                };
                group.start_respawnable(Some(name), task)?;
            }
        }

        for (i, udp_socket) in self.udp_sockets.into_iter().enumerate() {
            for j in 0..self.config.udp_workers_per_socket {
                let name = format!("udp worker {i}/{j}");
                let socket = udp_socket.try_clone().map_err(crate::thread::Error::Io)?;
                let group_clone = group.clone();
                let server = server.clone();
                let task = move || {
                    let resolver = Resolver::new(TcpRequester::new(upstream_timeout));
                    log_io_errors(run_udp_worker(&group_clone, &server, &socket, &resolver));
                };
                group.start_respawnable(Some(name), task)?;
            }
        }

        Ok(())
    }
}

/// The maximum interval between shutdown checks in the TCP accept and
/// UDP receive loops, and consequently the maximum amount of time the
/// shutdown procedure has to wait for these threads to finish up.
const CHECK_FOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// The maximum amount of time a client is allowed to take to send us a
/// full DNS message over TCP. If it takes longer, we close the
/// connection to defend against Slowloris-style denial-of-service
/// attacks.
const READ_MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// The TCP accept/serve loop. Connections are serviced on the worker
/// thread itself, one at a time; additional concurrent connections are
/// handled by the other workers sharing the listener, or else wait in
/// the kernel backlog.
fn run_tcp_worker(
    group: &Arc<ThreadGroup>,
    server: &Arc<Server>,
    listener: &TcpListener,
    resolver: &Resolver<TcpRequester>,
) -> io::Result<()> {
    loop {
        if group.is_shutting_down() {
            return Ok(());
        }

        // The listener is nonblocking, so an empty backlog shows up as
        // WouldBlock; we sleep before checking for shutdown and
        // retrying. Connections arriving in the interim wait in the
        // backlog.
        let (client, client_ip) = match listener.accept() {
            Ok((client, socket_addr)) => (client, socket_addr.ip()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(CHECK_FOR_SHUTDOWN_TIMEOUT);
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        log_io_errors(handle_tcp_connection(
            group, server, client, client_ip, resolver,
        ));
    }
}

/// Handles a TCP connection, reading length-prefixed DNS messages until
/// the client closes its side, times out, or the group shuts down.
fn handle_tcp_connection(
    group: &Arc<ThreadGroup>,
    server: &Arc<Server>,
    mut socket: TcpStream,
    client_ip: IpAddr,
    resolver: &Resolver<TcpRequester>,
) -> io::Result<()> {
    // The connection socket inherits nonblocking status from the
    // listener.
    socket.set_nonblocking(false)?;

    let mut received_buf = vec![0; 2 + u16::MAX as usize];
    let mut response_buf = vec![0; 2 + u16::MAX as usize];
    let mut n_read = 0;

    loop {
        // The client gets READ_MESSAGE_TIMEOUT to send a complete DNS
        // message.
        let deadline = Instant::now() + READ_MESSAGE_TIMEOUT;
        let mut timeout = READ_MESSAGE_TIMEOUT;

        // Read a DNS message.
        let mut received_len_opt = None;
        let received_len = loop {
            // First see whether we already hold an entire message, or,
            // barring that, the two octets preceding the next message
            // (which give its length). This must happen before reading
            // more data from the network: if a client pipelines
            // messages, we may start this loop with data (possibly a
            // whole message) already in the buffer.
            if let Some(received_len) = received_len_opt {
                if n_read >= received_len + 2 {
                    break received_len;
                }
            } else if n_read >= 2 {
                let received_len = u16::from_be_bytes([received_buf[0], received_buf[1]]) as usize;
                if n_read >= received_len + 2 {
                    break received_len;
                } else {
                    received_len_opt = Some(received_len);
                }
            }

            // Do the next read, closing the connection if it times out.
            socket.set_read_timeout(Some(timeout))?;
            let n_read_this_time = match socket.read(&mut received_buf[n_read..]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    timeout = match compute_timeout(deadline) {
                        Some(t) => t,
                        None => return Ok(()),
                    };
                    continue;
                }
                Err(e) => return Err(e),
            };

            // If we read nothing, the client closed their side of the
            // connection.
            if n_read_this_time == 0 {
                return Ok(());
            }

            n_read += n_read_this_time;
            timeout = match compute_timeout(deadline) {
                Some(t) => t,
                None => return Ok(()),
            }
        };

        // Process the DNS message and write the response, if any.
        match server.handle_message(
            &received_buf[2..received_len + 2],
            ReceivedInfo::new(client_ip, Transport::Tcp),
            &mut response_buf[2..],
            resolver,
        ) {
            Response::Single(response_len) => {
                response_buf[0..2].copy_from_slice(&u16::to_be_bytes(response_len as u16));
                socket.write_all(&response_buf[0..2 + response_len])?;
            }

            // Response::None occurs when something was really
            // malformed, so close the connection.
            Response::None => return Ok(()),
        };

        if group.is_shutting_down() {
            return Ok(());
        }

        // Any leftover data is the start of the next message.
        if n_read > received_len + 2 {
            received_buf.copy_within(received_len + 2..n_read, 0);
            n_read -= received_len + 2;
        } else {
            n_read = 0;
        }
    }
}

/// The maximum DNS message size this server will send over UDP.
const UDP_PAYLOAD_SIZE: usize = 512;

/// The UDP receive/handle/send loop.
fn run_udp_worker(
    group: &Arc<ThreadGroup>,
    server: &Arc<Server>,
    socket: &UdpSocket,
    resolver: &Resolver<TcpRequester>,
) -> io::Result<()> {
    let mut received_buf = vec![0; UDP_PAYLOAD_SIZE];
    let mut response_buf = vec![0; UDP_PAYLOAD_SIZE];

    loop {
        if group.is_shutting_down() {
            return Ok(());
        }

        // Receive a DNS message. If interrupted, skip the rest of the
        // loop body and check for group shutdown before retrying;
        // otherwise repeated interruptions could keep the call from
        // ever timing out.
        let (received_len, src) = match socket.recv_from(&mut received_buf) {
            Ok(tuple) => tuple,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        // Process the DNS message and send the response, if any.
        match server.handle_message(
            &received_buf[0..received_len],
            ReceivedInfo::new(src.ip(), Transport::Udp),
            &mut response_buf,
            resolver,
        ) {
            Response::Single(response_len) => {
                // Don't exit the task if the send fails. (See the note
                // at the beginning of the module.)
                log_io_errors(retry_if_interrupted(|| {
                    socket.send_to(&response_buf[0..response_len], src)
                }));
            }
            Response::None => (),
        }
    }
}

/// Computes the time until the deadline. Returns [`None`] if the
/// deadline is in the past.
fn compute_timeout(deadline: Instant) -> Option<Duration> {
    deadline.checked_duration_since(Instant::now())
}

/// Executes `f`, retrying the operation if it is interrupted.
fn retry_if_interrupted<F, R>(mut f: F) -> io::Result<R>
where
    F: FnMut() -> io::Result<R>,
{
    loop {
        match f() {
            Ok(r) => return Ok(r),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Logs errors if a task exits with an I/O error.
fn log_io_errors<T>(result: io::Result<T>) {
    if let Err(e) = result {
        let current_thread = thread::current();
        let thread_name = current_thread.name().unwrap_or("anonymous thread");
        error!("I/O error in thread {}: {}", thread_name, e);
    }
}
