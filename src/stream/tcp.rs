/*
 * Copyright (C) 2021 Evtech Solutions, Ltd., dba 3D-P
 * Copyright (C) 2021 Neil Tallim <neiltallim@3d-p.com>
 *
 * This file is part of tperf.
 *
 * tperf is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * tperf is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with tperf.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::net::TcpStream;
use std::time::Duration;

use crate::stream::{SocketTicket, StreamContext, StreamRole, TransportStream};
use crate::Result;

#[cfg(unix)]
const KEEPALIVE_DURATION: Duration = Duration::from_secs(5);

/// how long a receiver blocks in one read before re-checking its deadlines
const READ_TIMEOUT: Duration = Duration::from_millis(50);

fn mio_stream_to_std_stream(stream: mio::net::TcpStream) -> std::net::TcpStream {
    #[cfg(unix)]
    {
        use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
        let fd = unsafe { OwnedFd::from_raw_fd(stream.into_raw_fd()) };
        let socket: socket2::Socket = socket2::Socket::from(fd);
        socket.into()
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::{FromRawSocket, IntoRawSocket, OwnedSocket};
        let socket = unsafe { OwnedSocket::from_raw_socket(stream.into_raw_socket()) };
        let socket: socket2::Socket = socket2::Socket::from(socket);
        socket.into()
    }
}

/// the kernel's cumulative retransmission count for this connection
#[cfg(target_os = "linux")]
fn total_retransmits(stream: &TcpStream) -> Option<u64> {
    use std::os::unix::io::AsRawFd;

    // the leading fields of the kernel's struct tcp_info, up to tcpi_total_retrans
    #[repr(C)]
    #[derive(Default)]
    struct TcpInfo {
        state: u8,
        ca_state: u8,
        retransmits: u8,
        probes: u8,
        backoff: u8,
        options: u8,
        wscale: u8,
        app_limited: u8,

        rto: u32,
        ato: u32,
        snd_mss: u32,
        rcv_mss: u32,

        unacked: u32,
        sacked: u32,
        lost: u32,
        retrans: u32,
        fackets: u32,

        last_data_sent: u32,
        last_ack_sent: u32,
        last_data_recv: u32,
        last_ack_recv: u32,

        pmtu: u32,
        rcv_ssthresh: u32,
        rtt: u32,
        rttvar: u32,
        snd_ssthresh: u32,
        snd_cwnd: u32,
        advmss: u32,
        reordering: u32,

        rcv_rtt: u32,
        rcv_space: u32,

        total_retrans: u32,
    }

    let mut info = TcpInfo::default();
    let mut length = std::mem::size_of::<TcpInfo>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_TCP,
            libc::TCP_INFO,
            &mut info as *mut TcpInfo as *mut libc::c_void,
            &mut length,
        )
    };
    if result == 0 && length as usize >= std::mem::size_of::<TcpInfo>() {
        Some(u64::from(info.total_retrans))
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
fn total_retransmits(_stream: &TcpStream) -> Option<u64> {
    None
}

/// applies the negotiated socket options and wraps the connection in the stream type its role calls for
fn into_transport(ctx: StreamContext, stream: TcpStream, ticket: SocketTicket) -> Result<Box<dyn TransportStream>> {
    if ctx.no_delay {
        log::debug!("setting no-delay on TCP stream {}...", ctx.stream_idx);
        stream.set_nodelay(true)?;
    }

    // NOTE: features unsupported on Windows
    #[cfg(unix)]
    {
        let keepalive_parameters = socket2::TcpKeepalive::new().with_time(KEEPALIVE_DURATION);
        let raw_socket = socket2::SockRef::from(&stream);
        raw_socket.set_tcp_keepalive(&keepalive_parameters)?;
    }

    if let Some(window) = ctx.window {
        log::debug!("setting TCP stream {} window to {}...", ctx.stream_idx, window);
        let raw_socket = socket2::SockRef::from(&stream);
        raw_socket.set_send_buffer_size(window)?;
        raw_socket.set_recv_buffer_size(window)?;
    }

    if let Some(tos) = ctx.tos {
        super::apply_tos(ctx.stream_idx, &socket2::SockRef::from(&stream), tos)?;
    }

    match ctx.role {
        StreamRole::Sender => {
            stream.set_nonblocking(true)?;
            Ok(Box::new(sender::TcpSender::new(&ctx, stream, ticket)))
        }
        StreamRole::Receiver => {
            stream.set_nonblocking(false)?;
            stream.set_read_timeout(Some(READ_TIMEOUT))?;
            Ok(Box::new(receiver::TcpReceiver::new(&ctx, stream, ticket)))
        }
    }
}

pub mod receiver {
    use std::io::Read;
    use std::net::{IpAddr, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
    use std::time::{Duration, Instant};

    use mio::net::TcpListener;

    use crate::stream::{
        PortPool, RetryBudget, SocketTicket, StreamContext, TransferDelta, TransportStream, CONNECT_TIMEOUT, DRAIN_TIMEOUT,
    };
    use crate::{error_gen, Error, Result};

    const POLL_TIMEOUT: Duration = Duration::from_millis(100);
    /// how long a new connection has to present the session cookie
    const COOKIE_TIMEOUT: Duration = Duration::from_secs(1);
    /// a draining receiver gives up once the connection has been idle this long
    const DRAIN_QUIET: Duration = Duration::from_millis(250);

    /// a listener bound for one stream, waiting for the initiator to dial it
    pub struct PendingTcp {
        ctx: StreamContext,
        listener: TcpListener,
        _ticket: SocketTicket,
    }

    impl PendingTcp {
        pub fn bind(ctx: StreamContext, pool: &PortPool, peer_ip: IpAddr) -> Result<PendingTcp> {
            log::debug!("binding TCP listener for stream {}...", ctx.stream_idx);
            let listener: TcpListener = pool.bind(peer_ip, TcpListener::bind)?;
            let ticket = ctx.tally.open();
            log::debug!("bound TCP listener for stream {}: {}", ctx.stream_idx, listener.local_addr()?);
            Ok(PendingTcp {
                ctx,
                listener,
                _ticket: ticket,
            })
        }

        pub fn get_port(&self) -> Result<u16> {
            Ok(self.listener.local_addr()?.port())
        }

        /// reads the session cookie from a fresh connection
        fn validate(&self, stream: &mut TcpStream) -> Result<bool> {
            stream.set_nonblocking(false)?;
            stream.set_read_timeout(Some(COOKIE_TIMEOUT))?;
            let mut cookie = [0_u8; 16];
            stream.read_exact(&mut cookie)?;
            Ok(uuid::Uuid::from_bytes(cookie) == self.ctx.cookie)
        }

        pub fn accept(mut self, alive: &dyn Fn() -> bool) -> Result<Box<dyn TransportStream>> {
            let stream_idx = self.ctx.stream_idx;
            log::debug!("preparing to receive TCP stream {} connection...", stream_idx);

            let mut mio_poll = mio::Poll::new()?;
            let mut mio_events = mio::Events::with_capacity(1);
            let mio_token = mio::Token(0);
            mio_poll
                .registry()
                .register(&mut self.listener, mio_token, mio::Interest::READABLE)?;

            let start = Instant::now();
            loop {
                if !alive() {
                    return Err(Error::Cancelled);
                }
                if start.elapsed() >= CONNECT_TIMEOUT {
                    return Err(Error::Connect(format!("TCP listening for stream {} timed out", stream_idx)));
                }

                mio_poll.poll(&mut mio_events, Some(POLL_TIMEOUT))?;
                if mio_events.is_empty() {
                    continue;
                }
                loop {
                    let (new_stream, address) = match self.listener.accept() {
                        Ok((new_stream, address)) => (new_stream, address),
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            // no pending connections available
                            break;
                        }
                        Err(e) => return Err(Error::Io(e)),
                    };
                    log::debug!("received TCP stream {} connection from {}", stream_idx, address);

                    let mut stream = super::mio_stream_to_std_stream(new_stream);
                    match self.validate(&mut stream) {
                        Ok(true) => {
                            log::debug!("validated TCP stream {} connection from {}", stream_idx, address);
                            mio_poll.registry().deregister(&mut self.listener)?;
                            let ticket = self.ctx.tally.open();
                            // the listener closes here
                            let PendingTcp { ctx, .. } = self;
                            return super::into_transport(ctx, stream, ticket);
                        }
                        Ok(false) => log::warn!("unexpected ID in stream {} connection from {}", stream_idx, address),
                        Err(e) => log::warn!("could not validate TCP stream {} connection from {}: {}", stream_idx, address, e),
                    }
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                }
            }
        }
    }

    pub struct TcpReceiver {
        stream_idx: usize,
        stream: Option<TcpStream>,
        ticket: Option<SocketTicket>,
        buffer: Vec<u8>,
        retries: RetryBudget,
        eof: bool,
    }

    impl TcpReceiver {
        pub fn new(ctx: &StreamContext, stream: TcpStream, ticket: SocketTicket) -> TcpReceiver {
            TcpReceiver {
                stream_idx: ctx.stream_idx,
                stream: Some(stream),
                ticket: Some(ticket),
                buffer: vec![0_u8; ctx.block_size.max(1)],
                retries: RetryBudget::default(),
                eof: false,
            }
        }
    }

    impl TransportStream for TcpReceiver {
        fn begin(&mut self, _origin: Instant, _end: Option<Instant>) {}

        fn run_tick(&mut self, until: Instant, stop: &AtomicBool) -> Result<TransferDelta> {
            let stream = self.stream.as_mut().ok_or_else(|| error_gen!("no stream currently exists"))?;
            let mut delta = TransferDelta::default();

            while !self.eof && !stop.load(Relaxed) && Instant::now() < until {
                match stream.read(&mut self.buffer) {
                    Ok(0) => {
                        log::debug!("TCP stream {} reached end-of-stream", self.stream_idx);
                        self.eof = true;
                    }
                    Ok(packet_size) => {
                        log::trace!("received {} bytes in TCP stream {}", packet_size, self.stream_idx);
                        delta.bytes += packet_size as u64;
                        self.retries.succeeded();
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => self.retries.failed(self.stream_idx, e)?,
                }
            }
            delta.finished = self.eof;
            Ok(delta)
        }

        fn drain(&mut self) -> Result<TransferDelta> {
            let mut delta = TransferDelta::default();
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return Ok(delta),
            };

            let start = Instant::now();
            let mut last_data = start;
            while !self.eof && start.elapsed() < DRAIN_TIMEOUT && last_data.elapsed() < DRAIN_QUIET {
                match stream.read(&mut self.buffer) {
                    Ok(0) => self.eof = true,
                    Ok(packet_size) => {
                        delta.bytes += packet_size as u64;
                        last_data = Instant::now();
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        log::debug!("TCP stream {} stopped draining: {}", self.stream_idx, e);
                        break;
                    }
                }
            }
            log::debug!("drained {} bytes from TCP stream {}", delta.bytes, self.stream_idx);
            delta.finished = true;
            Ok(delta)
        }

        fn close(&mut self) {
            if let Some(stream) = self.stream.take() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            self.ticket = None;
        }

        fn get_idx(&self) -> usize {
            self.stream_idx
        }

        fn get_port(&self) -> Result<u16> {
            match &self.stream {
                Some(stream) => Ok(stream.local_addr()?.port()),
                None => Err(error_gen!("no stream currently exists")),
            }
        }

        fn shutdown_handle(&self) -> Option<TcpStream> {
            self.stream.as_ref().and_then(|stream| stream.try_clone().ok())
        }
    }
}

pub mod sender {
    use std::io::Write;
    use std::net::{Shutdown, SocketAddr, TcpStream};
    use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    use crate::rate::TokenBucket;
    use crate::settings::Quota;
    use crate::stream::{staged_buffer, RetryBudget, SocketTicket, StreamContext, TransferDelta, TransportStream, CONNECT_TIMEOUT};
    use crate::utils::clock::MonotonicClock;
    use crate::{error_gen, Error, Result};

    const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
    const BUFFER_FULL_TIMEOUT: Duration = Duration::from_millis(1);

    /// dials the responder's data port and presents the session cookie
    pub fn connect(ctx: StreamContext, address: SocketAddr) -> Result<Box<dyn TransportStream>> {
        log::debug!("preparing to connect TCP stream {} to {}...", ctx.stream_idx, address);

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(address),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        let ticket = ctx.tally.open();

        // buffer sizes influence the window scale, so they must be set before connecting
        if let Some(window) = ctx.window {
            socket.set_send_buffer_size(window)?;
            socket.set_recv_buffer_size(window)?;
        }

        if let Err(e) = socket.connect_timeout(&address.into(), CONNECT_TIMEOUT) {
            return Err(Error::Connect(format!("unable to connect stream {}: {}", ctx.stream_idx, e)));
        }
        let mut stream: TcpStream = socket.into();
        log::debug!("connected TCP stream {} to {}", ctx.stream_idx, stream.peer_addr()?);

        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        stream
            .write_all(ctx.cookie.as_bytes())
            .map_err(|e| Error::Connect(format!("unable to identify stream {}: {}", ctx.stream_idx, e)))?;

        super::into_transport(ctx, stream, ticket)
    }

    pub struct TcpSender {
        stream_idx: usize,
        stream: Option<TcpStream>,
        ticket: Option<SocketTicket>,
        staged_buffer: Vec<u8>,

        bucket: TokenBucket,
        clock: MonotonicClock,
        end: Option<Instant>,
        /// bytes left to send under a byte target
        remaining: Option<u64>,

        retries: RetryBudget,
        reported_retransmits: Option<u64>,
        write_closed: bool,
    }

    impl TcpSender {
        pub fn new(ctx: &StreamContext, stream: TcpStream, ticket: SocketTicket) -> TcpSender {
            let remaining = match ctx.quota {
                Some(Quota::Bytes(bytes)) => Some(bytes),
                // packet targets are only negotiated for UDP
                Some(Quota::Packets(_)) | None => None,
            };
            TcpSender {
                stream_idx: ctx.stream_idx,
                stream: Some(stream),
                ticket: Some(ticket),
                staged_buffer: staged_buffer(ctx.block_size, 0),

                bucket: ctx.token_bucket(),
                clock: MonotonicClock::new(),
                end: None,
                remaining,

                retries: RetryBudget::default(),
                reported_retransmits: None,
                write_closed: false,
            }
        }

        fn retransmits_since_last_report(&mut self) -> Option<u64> {
            let total = super::total_retransmits(self.stream.as_ref()?)?;
            let previous = self.reported_retransmits.replace(total).unwrap_or(0);
            Some(total.saturating_sub(previous))
        }

        /// signals end-of-stream to the receiver
        fn close_write(&mut self) {
            if !self.write_closed {
                if let Some(stream) = self.stream.as_ref() {
                    if let Err(e) = stream.shutdown(Shutdown::Write) {
                        log::debug!("unable to half-close TCP stream {}: {}", self.stream_idx, e);
                    }
                }
                self.write_closed = true;
            }
        }
    }

    impl TransportStream for TcpSender {
        fn begin(&mut self, origin: Instant, end: Option<Instant>) {
            self.clock = MonotonicClock::starting_at(origin);
            self.end = end;
            // retransmissions during connection setup are not part of the test
            self.reported_retransmits = self.stream.as_ref().and_then(super::total_retransmits);
        }

        fn run_tick(&mut self, until: Instant, stop: &AtomicBool) -> Result<TransferDelta> {
            let stream = self.stream.as_mut().ok_or_else(|| error_gen!("no stream currently exists"))?;
            let mut delta = TransferDelta::default();

            while !stop.load(Relaxed) {
                let now = Instant::now();
                if self.end.map_or(false, |end| now >= end) || self.remaining == Some(0) {
                    delta.finished = true;
                    break;
                }
                if now >= until {
                    break;
                }

                let wanted = match self.remaining {
                    Some(remaining) => (remaining as usize).min(self.staged_buffer.len()),
                    None => self.staged_buffer.len(),
                };
                let allowed = self.bucket.admit(wanted, self.clock.elapsed());
                if allowed == 0 {
                    sleep(self.bucket.wait_hint(wanted).min(until - now).max(BUFFER_FULL_TIMEOUT));
                    continue;
                }

                // it doesn't matter if the whole thing couldn't be written, since it's just filler
                match stream.write(&self.staged_buffer[..allowed]) {
                    Ok(packet_size) => {
                        log::trace!("wrote {} bytes in TCP stream {}", packet_size, self.stream_idx);
                        self.bucket.refund(allowed - packet_size);
                        delta.bytes += packet_size as u64;
                        if let Some(remaining) = self.remaining.as_mut() {
                            *remaining = remaining.saturating_sub(packet_size as u64);
                        }
                        self.retries.succeeded();
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        // send-buffer is full; nothing to do, but avoid burning CPU cycles
                        self.bucket.refund(allowed);
                        sleep(BUFFER_FULL_TIMEOUT);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => self.bucket.refund(allowed),
                    Err(e) => {
                        self.bucket.refund(allowed);
                        self.retries.failed(self.stream_idx, e)?;
                    }
                }
            }

            delta.retransmits = self.retransmits_since_last_report();
            if delta.finished {
                log::debug!("TCP stream {} has sent everything; closing its write side", self.stream_idx);
                self.close_write();
            }
            Ok(delta)
        }

        fn drain(&mut self) -> Result<TransferDelta> {
            self.close_write();
            Ok(TransferDelta {
                retransmits: self.retransmits_since_last_report(),
                finished: true,
                ..TransferDelta::default()
            })
        }

        fn close(&mut self) {
            if let Some(stream) = self.stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            self.ticket = None;
        }

        fn get_idx(&self) -> usize {
            self.stream_idx
        }

        fn get_port(&self) -> Result<u16> {
            match &self.stream {
                Some(stream) => Ok(stream.local_addr()?.port()),
                None => Err(error_gen!("no stream currently exists")),
            }
        }

        fn shutdown_handle(&self) -> Option<TcpStream> {
            self.stream.as_ref().and_then(|stream| stream.try_clone().ok())
        }
    }
}
