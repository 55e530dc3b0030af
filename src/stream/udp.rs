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

use std::net::UdpSocket;
use std::time::Duration;

use crate::stream::{SocketTicket, StreamContext, StreamRole, TransportStream};
use crate::utils::clock::extend_sequence;
use crate::Result;

/// a data datagram opens with a 32-bit sequence number and a 64-bit send timestamp, in microseconds
pub const TEST_HEADER_SIZE: usize = 12;

/// the session cookie followed by a one-byte tag
const CONTROL_DATAGRAM_SIZE: usize = 17;
const TAG_REGISTER: u8 = 0;
const TAG_END: u8 = 1;

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const WRITE_TIMEOUT: Duration = Duration::from_millis(50);

fn write_header(packet: &mut [u8], sequence: u32, send_micros: u64) {
    packet[0..4].copy_from_slice(&sequence.to_be_bytes());
    packet[4..12].copy_from_slice(&send_micros.to_be_bytes());
}

fn read_header(packet: &[u8]) -> Option<(u32, u64)> {
    let sequence = u32::from_be_bytes(packet.get(0..4)?.try_into().ok()?);
    let send_micros = u64::from_be_bytes(packet.get(4..12)?.try_into().ok()?);
    Some((sequence, send_micros))
}

fn control_datagram(cookie: &uuid::Uuid, tag: u8) -> [u8; CONTROL_DATAGRAM_SIZE] {
    let mut datagram = [0_u8; CONTROL_DATAGRAM_SIZE];
    datagram[..16].copy_from_slice(cookie.as_bytes());
    datagram[16] = tag;
    datagram
}

/// the tag of a cookie-bearing control datagram belonging to this session, if `packet` is one
fn control_tag(packet: &[u8], cookie: &uuid::Uuid) -> Option<u8> {
    if packet.len() == CONTROL_DATAGRAM_SIZE && &packet[..16] == cookie.as_bytes() {
        Some(packet[16])
    } else {
        None
    }
}

/// tracks arrival order; anything at or below the highest sequence seen is out-of-order, not lost
#[derive(Debug, Default)]
pub struct SequenceTracker {
    highest: Option<u64>,
    received: u64,
    out_of_order: u64,
}

impl SequenceTracker {
    /// returns true when the datagram advanced the sequence
    pub fn observe(&mut self, wire: u32) -> bool {
        let sequence = extend_sequence(self.highest.unwrap_or(0), wire);
        self.received += 1;
        match self.highest {
            Some(highest) if sequence <= highest => {
                self.out_of_order += 1;
                false
            }
            _ => {
                self.highest = Some(sequence);
                true
            }
        }
    }

    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    pub fn lost(&self) -> u64 {
        match self.highest {
            Some(highest) => (highest + 1).saturating_sub(self.received),
            None => 0,
        }
    }
}

/// RFC 1889 interarrival jitter: J += (|D| - J) / 16
#[derive(Debug, Default)]
pub struct JitterEstimator {
    previous_transit: Option<i64>,
    jitter_micros: Option<f64>,
}

impl JitterEstimator {
    /// both timestamps are microseconds from the test origin, on each side's own monotonic clock;
    /// their constant offset cancels out
    pub fn observe(&mut self, send_micros: u64, receive_micros: u64) {
        let transit = receive_micros as i64 - send_micros as i64;
        if let Some(previous) = self.previous_transit {
            let deviation = (transit - previous).abs() as f64;
            let jitter = self.jitter_micros.unwrap_or(0.0);
            self.jitter_micros = Some(jitter + (deviation - jitter) / 16.0);
        }
        self.previous_transit = Some(transit);
    }

    pub fn jitter_ms(&self) -> Option<f64> {
        self.jitter_micros.map(|micros| micros / 1000.0)
    }
}

fn apply_socket_options(ctx: &StreamContext, socket: &UdpSocket) -> Result<()> {
    let raw_socket = socket2::SockRef::from(socket);
    if let Some(window) = ctx.window {
        log::debug!("setting UDP stream {} buffers to {}...", ctx.stream_idx, window);
        raw_socket.set_send_buffer_size(window)?;
        raw_socket.set_recv_buffer_size(window)?;
    }
    if let Some(tos) = ctx.tos {
        super::apply_tos(ctx.stream_idx, &raw_socket, tos)?;
    }
    Ok(())
}

fn into_transport(ctx: StreamContext, socket: UdpSocket, ticket: SocketTicket) -> Result<Box<dyn TransportStream>> {
    match ctx.role {
        StreamRole::Sender => {
            socket.set_write_timeout(Some(WRITE_TIMEOUT))?;
            Ok(Box::new(sender::UdpSender::new(&ctx, socket, ticket)))
        }
        StreamRole::Receiver => {
            socket.set_read_timeout(Some(READ_TIMEOUT))?;
            Ok(Box::new(receiver::UdpReceiver::new(&ctx, socket, ticket)))
        }
    }
}

pub mod receiver {
    use std::net::{IpAddr, TcpStream, UdpSocket};
    use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
    use std::time::{Duration, Instant};

    use super::{JitterEstimator, SequenceTracker, CONTROL_DATAGRAM_SIZE, TAG_END, TAG_REGISTER, TEST_HEADER_SIZE};
    use crate::stream::{PortPool, RetryBudget, SocketTicket, StreamContext, TransferDelta, TransportStream, CONNECT_TIMEOUT, DRAIN_TIMEOUT};
    use crate::utils::clock::MonotonicClock;
    use crate::{error_gen, Error, Result};

    const REGISTER_POLL: Duration = Duration::from_millis(100);
    /// a draining receiver gives up once nothing has arrived for this long
    const DRAIN_QUIET: Duration = Duration::from_millis(250);

    /// a socket bound for one stream, waiting for the initiator's registration datagram
    pub struct PendingUdp {
        ctx: StreamContext,
        socket: UdpSocket,
        ticket: SocketTicket,
    }

    impl PendingUdp {
        pub fn bind(ctx: StreamContext, pool: &PortPool, peer_ip: IpAddr) -> Result<PendingUdp> {
            log::debug!("binding UDP socket for stream {}...", ctx.stream_idx);
            let socket: UdpSocket = pool.bind(peer_ip, |address| UdpSocket::bind(address))?;
            let ticket = ctx.tally.open();
            super::apply_socket_options(&ctx, &socket)?;
            log::debug!("bound UDP socket for stream {}: {}", ctx.stream_idx, socket.local_addr()?);
            Ok(PendingUdp { ctx, socket, ticket })
        }

        pub fn get_port(&self) -> Result<u16> {
            Ok(self.socket.local_addr()?.port())
        }

        pub fn accept(self, alive: &dyn Fn() -> bool) -> Result<Box<dyn TransportStream>> {
            let stream_idx = self.ctx.stream_idx;
            self.socket.set_read_timeout(Some(REGISTER_POLL))?;

            let mut buf = [0_u8; CONTROL_DATAGRAM_SIZE + 1];
            let start = Instant::now();
            loop {
                if !alive() {
                    return Err(Error::Cancelled);
                }
                if start.elapsed() >= CONNECT_TIMEOUT {
                    return Err(Error::Connect(format!("UDP stream {} was never registered", stream_idx)));
                }

                let (packet_size, peer_addr) = match self.socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(Error::Io(e)),
                };
                let tag = super::control_tag(&buf[..packet_size], &self.ctx.cookie);
                match tag {
                    Some(TAG_REGISTER) => {
                        log::debug!("UDP stream {} registered from {}", stream_idx, peer_addr);
                        self.socket.connect(peer_addr)?;
                        let PendingUdp { ctx, socket, ticket } = self;
                        return super::into_transport(ctx, socket, ticket);
                    }
                    _ => log::warn!("received packet unrelated to UDP stream {} from {}", stream_idx, peer_addr),
                }
            }
        }
    }

    pub struct UdpReceiver {
        stream_idx: usize,
        cookie: uuid::Uuid,
        socket: Option<UdpSocket>,
        ticket: Option<SocketTicket>,
        buffer: Vec<u8>,

        clock: MonotonicClock,
        sequence: SequenceTracker,
        jitter: JitterEstimator,

        retries: RetryBudget,
        ended: bool,
    }

    impl UdpReceiver {
        pub fn new(ctx: &StreamContext, socket: UdpSocket, ticket: SocketTicket) -> UdpReceiver {
            UdpReceiver {
                stream_idx: ctx.stream_idx,
                cookie: ctx.cookie,
                socket: Some(socket),
                ticket: Some(ticket),
                buffer: vec![0_u8; ctx.block_size.max(CONTROL_DATAGRAM_SIZE) + 1],

                clock: MonotonicClock::new(),
                sequence: SequenceTracker::default(),
                jitter: JitterEstimator::default(),

                retries: RetryBudget::default(),
                ended: false,
            }
        }

        /// accounts for one datagram; returns false if it was not test data
        fn process_packet(&mut self, packet_size: usize, delta: &mut TransferDelta) -> bool {
            let receive_micros = self.clock.micros();
            let packet = &self.buffer[..packet_size];

            match super::control_tag(packet, &self.cookie) {
                Some(TAG_END) => {
                    log::debug!("UDP stream {} received the end-of-test marker", self.stream_idx);
                    self.ended = true;
                    return false;
                }
                // late registrations are expected and harmless
                Some(_) => return false,
                None => (),
            }

            let (sequence, send_micros) = match super::read_header(packet) {
                Some(header) if packet_size >= TEST_HEADER_SIZE => header,
                _ => {
                    log::warn!("received malformed packet with size {} for UDP stream {}", packet_size, self.stream_idx);
                    return false;
                }
            };

            delta.bytes += packet_size as u64;
            *delta.packets.get_or_insert(0) += 1;
            if self.sequence.observe(sequence) {
                self.jitter.observe(send_micros, receive_micros);
            } else {
                log::trace!("UDP stream {} received sequence {} out of order", self.stream_idx, sequence);
                delta.out_of_order += 1;
            }
            true
        }

        fn finish_delta(&self, mut delta: TransferDelta) -> TransferDelta {
            delta.packets.get_or_insert(0);
            delta.highest_sequence = self.sequence.highest();
            delta.jitter_ms = self.jitter.jitter_ms();
            delta.finished = self.ended;
            delta
        }
    }

    impl TransportStream for UdpReceiver {
        fn begin(&mut self, origin: Instant, _end: Option<Instant>) {
            self.clock = MonotonicClock::starting_at(origin);
        }

        fn run_tick(&mut self, until: Instant, stop: &AtomicBool) -> Result<TransferDelta> {
            let mut delta = TransferDelta::default();
            while !self.ended && !stop.load(Relaxed) && Instant::now() < until {
                let socket = self.socket.as_ref().ok_or_else(|| error_gen!("no socket currently exists"))?;
                match socket.recv(&mut self.buffer) {
                    Ok(packet_size) => {
                        log::trace!("received {} bytes in UDP stream {}", packet_size, self.stream_idx);
                        self.retries.succeeded();
                        self.process_packet(packet_size, &mut delta);
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::Interrupted => {}
                    // a port-unreachable bounced back from an earlier registration
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {}
                    Err(e) => self.retries.failed(self.stream_idx, e)?,
                }
            }
            Ok(self.finish_delta(delta))
        }

        fn drain(&mut self) -> Result<TransferDelta> {
            let mut delta = TransferDelta::default();
            let start = Instant::now();
            let mut last_data = start;
            while !self.ended && start.elapsed() < DRAIN_TIMEOUT && last_data.elapsed() < DRAIN_QUIET {
                let socket = match self.socket.as_ref() {
                    Some(socket) => socket,
                    None => break,
                };
                match socket.recv(&mut self.buffer) {
                    Ok(packet_size) => {
                        if self.process_packet(packet_size, &mut delta) {
                            last_data = Instant::now();
                        }
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::Interrupted
                            || e.kind() == std::io::ErrorKind::ConnectionRefused => {}
                    Err(e) => {
                        log::debug!("UDP stream {} stopped draining: {}", self.stream_idx, e);
                        break;
                    }
                }
            }
            self.ended = true;
            Ok(self.finish_delta(delta))
        }

        fn close(&mut self) {
            self.socket = None;
            self.ticket = None;
        }

        fn get_idx(&self) -> usize {
            self.stream_idx
        }

        fn get_port(&self) -> Result<u16> {
            match &self.socket {
                Some(socket) => Ok(socket.local_addr()?.port()),
                None => Err(error_gen!("no socket currently exists")),
            }
        }

        fn shutdown_handle(&self) -> Option<TcpStream> {
            None
        }
    }
}

pub mod sender {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
    use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    use super::{TAG_END, TAG_REGISTER, TEST_HEADER_SIZE};
    use crate::rate::TokenBucket;
    use crate::settings::Quota;
    use crate::stream::{staged_buffer, RetryBudget, SocketTicket, StreamContext, TransferDelta, TransportStream};
    use crate::utils::clock::MonotonicClock;
    use crate::{error_gen, Error, Result};

    const BUFFER_FULL_TIMEOUT: Duration = Duration::from_millis(1);
    const REGISTER_ANNOUNCEMENTS: usize = 3;
    const END_ANNOUNCEMENTS: usize = 5;

    /// binds a local socket, points it at the responder and registers the stream with the session cookie
    pub fn connect(ctx: StreamContext, address: SocketAddr) -> Result<Box<dyn TransportStream>> {
        log::debug!("preparing to connect UDP stream {} to {}...", ctx.stream_idx, address);
        let local = match address.ip() {
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local)?;
        let ticket = ctx.tally.open();
        super::apply_socket_options(&ctx, &socket)?;
        socket
            .connect(address)
            .map_err(|e| Error::Connect(format!("unable to connect UDP stream {}: {}", ctx.stream_idx, e)))?;

        // several times, in case of loss
        let registration = super::control_datagram(&ctx.cookie, TAG_REGISTER);
        for _ in 0..REGISTER_ANNOUNCEMENTS {
            socket
                .send(&registration)
                .map_err(|e| Error::Connect(format!("unable to register UDP stream {}: {}", ctx.stream_idx, e)))?;
        }
        log::debug!("connected UDP stream {} to {}", ctx.stream_idx, address);

        super::into_transport(ctx, socket, ticket)
    }

    pub struct UdpSender {
        stream_idx: usize,
        cookie: uuid::Uuid,
        socket: Option<UdpSocket>,
        ticket: Option<SocketTicket>,
        staged_packet: Vec<u8>,

        bucket: TokenBucket,
        clock: MonotonicClock,
        end: Option<Instant>,
        remaining: Option<Quota>,

        next_sequence: u32,
        retries: RetryBudget,
        announced_end: bool,
    }

    impl UdpSender {
        pub fn new(ctx: &StreamContext, socket: UdpSocket, ticket: SocketTicket) -> UdpSender {
            UdpSender {
                stream_idx: ctx.stream_idx,
                cookie: ctx.cookie,
                socket: Some(socket),
                ticket: Some(ticket),
                staged_packet: staged_buffer(ctx.block_size, TEST_HEADER_SIZE),

                bucket: ctx.token_bucket(),
                clock: MonotonicClock::new(),
                end: None,
                remaining: ctx.quota,

                next_sequence: 0,
                retries: RetryBudget::default(),
                announced_end: false,
            }
        }

        fn exhausted(&self) -> bool {
            matches!(self.remaining, Some(Quota::Bytes(0)) | Some(Quota::Packets(0)))
        }

        /// the size of the next datagram; a byte target's final datagram may be short, but never shorter than the header
        fn next_size(&self) -> usize {
            match self.remaining {
                Some(Quota::Bytes(remaining)) => (remaining as usize).clamp(TEST_HEADER_SIZE, self.staged_packet.len()),
                _ => self.staged_packet.len(),
            }
        }

        fn consume(&mut self, packet_size: usize) {
            match self.remaining.as_mut() {
                Some(Quota::Bytes(remaining)) => *remaining = remaining.saturating_sub(packet_size as u64),
                Some(Quota::Packets(remaining)) => *remaining = remaining.saturating_sub(1),
                None => (),
            }
        }

        /// tells the receiver no more data is coming
        fn announce_end(&mut self) {
            if self.announced_end {
                return;
            }
            self.announced_end = true;
            let socket = match self.socket.as_ref() {
                Some(socket) => socket,
                None => return,
            };
            let marker = super::control_datagram(&self.cookie, TAG_END);
            let mut remaining_announcements = END_ANNOUNCEMENTS;
            let start = Instant::now();
            while remaining_announcements > 0 && start.elapsed() < Duration::from_millis(100) {
                match socket.send(&marker) {
                    Ok(_) => remaining_announcements -= 1,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => sleep(BUFFER_FULL_TIMEOUT),
                    Err(e) => {
                        log::debug!("unable to send end-of-test marker in UDP stream {}: {}", self.stream_idx, e);
                        return;
                    }
                }
            }
        }
    }

    impl TransportStream for UdpSender {
        fn begin(&mut self, origin: Instant, end: Option<Instant>) {
            self.clock = MonotonicClock::starting_at(origin);
            self.end = end;
        }

        fn run_tick(&mut self, until: Instant, stop: &AtomicBool) -> Result<TransferDelta> {
            let mut delta = TransferDelta {
                packets: Some(0),
                ..TransferDelta::default()
            };

            while !stop.load(Relaxed) {
                let now = Instant::now();
                if self.end.map_or(false, |end| now >= end) || self.exhausted() {
                    delta.finished = true;
                    break;
                }
                if now >= until {
                    break;
                }

                // datagrams are only ever sent whole
                let size = self.next_size();
                let allowed = self.bucket.admit(size, self.clock.elapsed());
                if allowed < size {
                    self.bucket.refund(allowed);
                    sleep(self.bucket.wait_hint(size).min(until - now).max(BUFFER_FULL_TIMEOUT));
                    continue;
                }

                super::write_header(&mut self.staged_packet, self.next_sequence, self.clock.micros());
                let socket = self.socket.as_ref().ok_or_else(|| error_gen!("no socket currently exists"))?;
                match socket.send(&self.staged_packet[..size]) {
                    Ok(packet_size) => {
                        log::trace!("wrote {} bytes in UDP stream {}", packet_size, self.stream_idx);
                        self.retries.succeeded();
                        self.next_sequence = self.next_sequence.wrapping_add(1);
                        delta.bytes += packet_size as u64;
                        *delta.packets.get_or_insert(0) += 1;
                        self.consume(packet_size);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        // send-buffer is full; nothing to do, but avoid burning CPU cycles
                        self.bucket.refund(size);
                        sleep(BUFFER_FULL_TIMEOUT);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused || e.kind() == std::io::ErrorKind::Interrupted => {
                        // the receiver is momentarily unreachable; the datagram was not sent
                        self.bucket.refund(size);
                        sleep(BUFFER_FULL_TIMEOUT);
                    }
                    Err(e) => {
                        self.bucket.refund(size);
                        self.retries.failed(self.stream_idx, e)?;
                    }
                }
            }

            if delta.finished {
                log::debug!("UDP stream {} has sent everything; announcing the end", self.stream_idx);
                self.announce_end();
            }
            Ok(delta)
        }

        fn drain(&mut self) -> Result<TransferDelta> {
            self.announce_end();
            Ok(TransferDelta {
                packets: Some(0),
                finished: true,
                ..TransferDelta::default()
            })
        }

        fn close(&mut self) {
            self.socket = None;
            self.ticket = None;
        }

        fn get_idx(&self) -> usize {
            self.stream_idx
        }

        fn get_port(&self) -> Result<u16> {
            match &self.socket {
                Some(socket) => Ok(socket.local_addr()?.port()),
                None => Err(error_gen!("no socket currently exists")),
            }
        }

        fn shutdown_handle(&self) -> Option<TcpStream> {
            None
        }
    }
}
