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

pub mod tcp;
pub mod udp;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::rate::TokenBucket;
use crate::settings::{Flow, Protocol, Quota, Settings};
use crate::{error_gen, Error, Result};

/// how long each data stream may take to connect before the session is abandoned
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// how long a stopping receiver keeps consuming data that is already in flight
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// consecutive failed I/O calls tolerated on an established stream
const MAX_TRANSIENT_RETRIES: u32 = 3;

/// counter changes observed by one stream over one slice of time
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransferDelta {
    pub bytes: u64,
    /// datagrams moved; `None` for TCP
    pub packets: Option<u64>,
    /// retransmitted segments; only known to TCP senders on some platforms
    pub retransmits: Option<u64>,
    pub out_of_order: u64,
    /// the highest sequence number seen so far, for UDP receivers
    pub highest_sequence: Option<u64>,
    /// the current jitter estimate, for UDP receivers
    pub jitter_ms: Option<f64>,
    /// the stream has nothing more to move
    pub finished: bool,
}

/// a delta tagged with the reporting interval it was measured in
#[derive(Clone, Debug, PartialEq)]
pub struct IntervalSample {
    pub stream_idx: usize,
    pub tick: u64,
    pub delta: TransferDelta,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamRole {
    Sender,
    Receiver,
}

impl StreamRole {
    /// whether this side sends data on a stream of the given flow
    pub fn for_flow(flow: Flow, initiator: bool) -> StreamRole {
        match (flow, initiator) {
            (Flow::Upload, true) | (Flow::Download, false) => StreamRole::Sender,
            _ => StreamRole::Receiver,
        }
    }
}

/// one data-plane connection, driven by its own worker thread
pub trait TransportStream: Send {
    /// marks the start of the test; senders stop on their own once `end` passes
    fn begin(&mut self, origin: Instant, end: Option<Instant>);

    /// moves data until `until`, until `stop` is raised, or until the stream finishes
    fn run_tick(&mut self, until: Instant, stop: &AtomicBool) -> Result<TransferDelta>;

    /// consumes data still in flight after a stop, for at most `DRAIN_TIMEOUT`
    fn drain(&mut self) -> Result<TransferDelta>;

    /// releases the socket
    fn close(&mut self);

    fn get_idx(&self) -> usize;

    fn get_port(&self) -> Result<u16>;

    /// a handle through which a stuck stream can be forcibly shut down from another thread
    fn shutdown_handle(&self) -> Option<std::net::TcpStream>;
}

/// everything a stream needs to know about the session it belongs to
#[derive(Clone, Debug)]
pub struct StreamContext {
    pub stream_idx: usize,
    pub role: StreamRole,
    pub protocol: Protocol,
    pub block_size: usize,
    pub bandwidth: Option<u64>,
    pub interval: Duration,
    pub window: Option<usize>,
    pub no_delay: bool,
    pub tos: Option<u8>,
    pub quota: Option<Quota>,
    pub cookie: uuid::Uuid,
    pub tally: SocketTally,
}

impl StreamContext {
    pub fn new(settings: &Settings, stream_idx: usize, initiator: bool, cookie: uuid::Uuid, tally: &SocketTally) -> StreamContext {
        StreamContext {
            stream_idx,
            role: StreamRole::for_flow(settings.flow_of(stream_idx), initiator),
            protocol: settings.protocol,
            block_size: settings.block_size,
            bandwidth: settings.bandwidth,
            interval: settings.interval,
            window: settings.window,
            no_delay: settings.no_delay,
            tos: settings.tos,
            quota: settings.quota_of(stream_idx),
            cookie,
            tally: tally.clone(),
        }
    }

    /// the pacer for a sending stream; unthrottled when no bandwidth was requested
    pub fn token_bucket(&self) -> TokenBucket {
        match self.bandwidth {
            Some(bandwidth) => TokenBucket::new(bandwidth, self.interval, self.block_size),
            None => TokenBucket::unlimited(),
        }
    }
}

/// names the WMM access category a type-of-service byte maps to
pub fn access_category(tos: u8) -> &'static str {
    match tos >> 5 {
        1 | 2 => "BK",
        4 | 5 => "VI",
        6 | 7 => "VO",
        _ => "BE",
    }
}

/// marks outgoing data packets with the given type-of-service byte
pub fn apply_tos(stream_idx: usize, socket: &socket2::Socket, tos: u8) -> Result<()> {
    log::debug!("setting stream {} type-of-service to {:#04x} ({})...", stream_idx, tos, access_category(tos));
    let is_ipv6 = socket.local_addr()?.as_socket().map_or(false, |address| address.is_ipv6());
    if is_ipv6 {
        set_traffic_class(socket, tos)?;
        // v4-mapped peers still take their marking from IP_TOS
        if let Err(e) = socket.set_tos(u32::from(tos)) {
            log::trace!("IP_TOS not applied to IPv6 stream {}: {}", stream_idx, e);
        }
        Ok(())
    } else {
        Ok(socket.set_tos(u32::from(tos))?)
    }
}

#[cfg(target_os = "linux")]
fn set_traffic_class(socket: &socket2::Socket, tos: u8) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let value = libc::c_int::from(tos);
    let result = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_TCLASS,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_traffic_class(socket: &socket2::Socket, tos: u8) -> io::Result<()> {
    socket.set_tos(u32::from(tos))
}

/// a count of open data sockets, shared by every stream of a session
#[derive(Clone, Debug, Default)]
pub struct SocketTally(Arc<AtomicUsize>);

impl SocketTally {
    pub fn open(&self) -> SocketTicket {
        self.0.fetch_add(1, Ordering::Relaxed);
        SocketTicket(self.0.clone())
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// held alongside a socket; the tally drops when this does
#[derive(Debug)]
pub struct SocketTicket(Arc<AtomicUsize>);

impl Drop for SocketTicket {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// decides whether an I/O failure on an established stream may be retried
#[derive(Debug, Default)]
pub struct RetryBudget {
    consecutive: u32,
}

impl RetryBudget {
    pub fn succeeded(&mut self) {
        self.consecutive = 0;
    }

    /// `Ok` while the failure may be retried; escalates fatal kinds immediately
    /// and anything else after `MAX_TRANSIENT_RETRIES` in a row
    pub fn failed(&mut self, stream_idx: usize, e: io::Error) -> Result<()> {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => {
                return Err(Error::TransientIo(format!("stream {}: {}", stream_idx, e)));
            }
            _ => (),
        }
        self.consecutive += 1;
        if self.consecutive > MAX_TRANSIENT_RETRIES {
            return Err(Error::TransientIo(format!(
                "stream {}: {} consecutive failures, last: {}",
                stream_idx, self.consecutive, e
            )));
        }
        log::debug!("retrying stream {} after transient failure: {}", stream_idx, e);
        Ok(())
    }
}

/// fills a block with a fixed byte sequence, starting after any header
pub fn staged_buffer(length: usize, header: usize) -> Vec<u8> {
    let mut staged_buffer = vec![0_u8; length];
    for (i, staged_buffer_i) in staged_buffer.iter_mut().enumerate().skip(header) {
        *staged_buffer_i = (i % 256) as u8;
    }
    staged_buffer
}

/// parses a spec like "5100-5110,5120" into a list of ports; empty when unset
pub fn parse_port_spec(port_spec: &str) -> Vec<u16> {
    let mut ports = Vec::<u16>::new();
    if port_spec.is_empty() {
        return ports;
    }

    for range in port_spec.split(',').map(str::trim).filter(|range| !range.is_empty()) {
        let parsed = match range.split_once('-') {
            Some((first, last)) => match (first.trim().parse::<u16>(), last.trim().parse::<u16>()) {
                (Ok(first), Ok(last)) if first <= last => Some(first..=last),
                _ => None,
            },
            None => range.parse::<u16>().ok().map(|port| port..=port),
        };
        match parsed {
            Some(ports_in_range) => {
                for port in ports_in_range {
                    if port != 0 && !ports.contains(&port) {
                        ports.push(port);
                    }
                }
            }
            None => log::warn!("ignoring malformed port-range {:?}", range),
        }
    }
    ports
}

/// a rotating pool of local ports for one transport; empty pools defer to the OS
#[derive(Debug, Default)]
pub struct PortPool {
    label: &'static str,
    ports_ip4: Vec<u16>,
    ports_ip6: Vec<u16>,
    /// the position of the most recently used port, per address family
    positions: Mutex<(usize, usize)>,
}

impl PortPool {
    pub fn new(label: &'static str, port_spec: &str, port_spec6: &str) -> PortPool {
        let ports_ip4 = parse_port_spec(port_spec);
        if !ports_ip4.is_empty() {
            log::debug!("configured IPv4 {} port pool: {:?}", label, ports_ip4);
        } else {
            log::debug!("using OS assignment for IPv4 {} ports", label);
        }

        let ports_ip6 = parse_port_spec(port_spec6);
        if !ports_ip6.is_empty() {
            log::debug!("configured IPv6 {} port pool: {:?}", label, ports_ip6);
        } else {
            log::debug!("using OS assignment for IPv6 {} ports", label);
        }

        PortPool {
            label,
            ports_ip4,
            ports_ip6,
            positions: Mutex::new((0, 0)),
        }
    }

    /// binds a socket with `bind_fn` on the first free pooled port after the last one handed out,
    /// wrapping around once; the unspecified address of the peer's family is used
    pub fn bind<S, F>(&self, peer_ip: IpAddr, bind_fn: F) -> Result<S>
    where
        F: Fn(SocketAddr) -> io::Result<S>,
    {
        let (unspecified, ports, family) = match peer_ip {
            IpAddr::V4(_) => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), &self.ports_ip4, "IPv4"),
            IpAddr::V6(_) => (IpAddr::V6(Ipv6Addr::UNSPECIFIED), &self.ports_ip6, "IPv6"),
        };
        if ports.is_empty() {
            return Ok(bind_fn(SocketAddr::new(unspecified, 0))?);
        }

        let mut positions = self.positions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let position = match peer_ip {
            IpAddr::V4(_) => &mut positions.0,
            IpAddr::V6(_) => &mut positions.1,
        };
        // start just after the last port handed out and circle back to it
        for offset in 1..=ports.len() {
            let port_idx = (*position + offset) % ports.len();
            match bind_fn(SocketAddr::new(unspecified, ports[port_idx])) {
                Ok(socket) => {
                    *position = port_idx;
                    return Ok(socket);
                }
                Err(e) => log::warn!("unable to bind {} {} port {}: {}", family, self.label, ports[port_idx], e),
            }
        }
        Err(error_gen!("unable to allocate {} {} port", family, self.label))
    }
}

/// the responder's data-port pools
#[derive(Debug, Default)]
pub struct PortPools {
    pub tcp: PortPool,
    pub udp: PortPool,
}

impl PortPools {
    pub fn new(tcp_spec: &str, tcp6_spec: &str, udp_spec: &str, udp6_spec: &str) -> PortPools {
        PortPools {
            tcp: PortPool::new("TCP", tcp_spec, tcp6_spec),
            udp: PortPool::new("UDP", udp_spec, udp6_spec),
        }
    }
}

/// a data socket bound on the responder, waiting for the initiator to arrive
pub enum PendingStream {
    Tcp(tcp::receiver::PendingTcp),
    Udp(udp::receiver::PendingUdp),
}

impl PendingStream {
    pub fn get_port(&self) -> Result<u16> {
        match self {
            PendingStream::Tcp(pending) => pending.get_port(),
            PendingStream::Udp(pending) => pending.get_port(),
        }
    }

    /// waits for the initiator to connect or register, within `CONNECT_TIMEOUT`
    pub fn accept(self, alive: &dyn Fn() -> bool) -> Result<Box<dyn TransportStream>> {
        match self {
            PendingStream::Tcp(pending) => pending.accept(alive),
            PendingStream::Udp(pending) => pending.accept(alive),
        }
    }
}

/// binds the responder's socket for one stream
pub fn listen(ctx: StreamContext, pools: &PortPools, peer_ip: IpAddr) -> Result<PendingStream> {
    match ctx.protocol {
        Protocol::Tcp => Ok(PendingStream::Tcp(tcp::receiver::PendingTcp::bind(ctx, &pools.tcp, peer_ip)?)),
        Protocol::Udp => Ok(PendingStream::Udp(udp::receiver::PendingUdp::bind(ctx, &pools.udp, peer_ip)?)),
    }
}

/// dials the responder's socket for one stream
pub fn connect(ctx: StreamContext, address: SocketAddr) -> Result<Box<dyn TransportStream>> {
    match ctx.protocol {
        Protocol::Tcp => tcp::sender::connect(ctx, address),
        Protocol::Udp => udp::sender::connect(ctx, address),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tos_maps_onto_access_categories() {
        assert_eq!(access_category(0x00), "BE");
        assert_eq!(access_category(0x60), "BE");
        assert_eq!(access_category(0x20), "BK");
        assert_eq!(access_category(0x40), "BK");
        assert_eq!(access_category(0xa0), "VI");
        assert_eq!(access_category(0xe0), "VO");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn tos_is_readable_from_the_socket() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let raw_socket = socket2::SockRef::from(&socket);
        apply_tos(0, &raw_socket, 0xa0).unwrap();
        assert_eq!(raw_socket.tos().unwrap(), 0xa0);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let raw_stream = socket2::SockRef::from(&stream);
        apply_tos(1, &raw_stream, 0x20).unwrap();
        assert_eq!(raw_stream.tos().unwrap(), 0x20);
    }

    #[test]
    fn port_specs_expand_ranges_and_singletons() {
        assert_eq!(parse_port_spec(""), Vec::<u16>::new());
        assert_eq!(parse_port_spec("5100-5103,5120"), vec![5100, 5101, 5102, 5103, 5120]);
        assert_eq!(parse_port_spec("7, 7,9-8,x,8"), vec![7, 8]);
    }

    #[test]
    fn pool_rotates_through_its_ports() {
        let pool = PortPool::new("TCP", "6000-6002", "");
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let picked: Vec<u16> = (0..4)
            .map(|_| pool.bind(localhost, |address| Ok::<_, io::Error>(address.port())).unwrap())
            .collect();
        assert_eq!(picked, vec![6001, 6002, 6000, 6001]);
    }

    #[test]
    fn pool_skips_ports_that_fail_and_gives_up_when_exhausted() {
        let pool = PortPool::new("UDP", "6000-6002", "");
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let port = pool
            .bind(localhost, |address| {
                if address.port() == 6001 {
                    Err(io::Error::new(io::ErrorKind::AddrInUse, "busy"))
                } else {
                    Ok(address.port())
                }
            })
            .unwrap();
        assert_eq!(port, 6002);

        let result = pool.bind(localhost, |_| Err::<u16, _>(io::Error::new(io::ErrorKind::AddrInUse, "busy")));
        assert!(result.is_err());
    }

    #[test]
    fn empty_pool_defers_to_the_os() {
        let pool = PortPool::default();
        let port = pool
            .bind(IpAddr::V6(Ipv6Addr::LOCALHOST), |address| Ok::<_, io::Error>(address.port()))
            .unwrap();
        assert_eq!(port, 0);
    }

    #[test]
    fn tally_follows_tickets() {
        let tally = SocketTally::default();
        let first = tally.open();
        let second = tally.clone().open();
        assert_eq!(tally.count(), 2);
        drop(first);
        assert_eq!(tally.count(), 1);
        drop(second);
        assert_eq!(tally.count(), 0);
    }

    #[test]
    fn retry_budget_escalates() {
        let mut budget = RetryBudget::default();
        let transient = || io::Error::new(io::ErrorKind::Other, "no buffer space");
        for _ in 0..MAX_TRANSIENT_RETRIES {
            budget.failed(0, transient()).unwrap();
        }
        assert!(matches!(budget.failed(0, transient()), Err(Error::TransientIo(_))));

        let mut budget = RetryBudget::default();
        budget.failed(0, transient()).unwrap();
        budget.succeeded();
        for _ in 0..MAX_TRANSIENT_RETRIES {
            budget.failed(0, transient()).unwrap();
        }

        let mut budget = RetryBudget::default();
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(budget.failed(1, reset), Err(Error::TransientIo(_))));
    }

    #[test]
    fn roles_follow_flow_and_side() {
        assert_eq!(StreamRole::for_flow(Flow::Upload, true), StreamRole::Sender);
        assert_eq!(StreamRole::for_flow(Flow::Upload, false), StreamRole::Receiver);
        assert_eq!(StreamRole::for_flow(Flow::Download, true), StreamRole::Receiver);
        assert_eq!(StreamRole::for_flow(Flow::Download, false), StreamRole::Sender);
    }

    #[test]
    fn staged_buffer_leaves_the_header_clear() {
        let buffer = staged_buffer(300, 12);
        assert!(buffer[..12].iter().all(|&b| b == 0));
        assert_eq!(buffer[12], 12);
        assert_eq!(buffer[299], (299 % 256) as u8);
    }
}
