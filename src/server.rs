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

use std::io;
use std::net::{IpAddr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::args::Args;
use crate::session::{Session, SessionStatus};
use crate::settings::{Limits, DEFAULT_PORT};
use crate::stream::PortPools;
use crate::{BoxResult, Result};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// when false, the system is shutting down
static ALIVE: AtomicBool = AtomicBool::new(true);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// concurrent clients allowed; 0 means unlimited
    pub client_limit: usize,
    pub limits: Limits,
    pub tcp_port_pool: String,
    pub tcp6_port_pool: String,
    pub udp_port_pool: String,
    pub udp6_port_pool: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            client_limit: 0,
            limits: Limits::default(),
            tcp_port_pool: String::new(),
            tcp6_port_pool: String::new(),
            udp_port_pool: String::new(),
            udp6_port_pool: String::new(),
        }
    }
}

/// a panic-tolerant means of indicating that a client has been disconnected
struct ClientThreadMonitor {
    client_address: String,
    clients: Arc<AtomicUsize>,
}
impl Drop for ClientThreadMonitor {
    fn drop(&mut self) {
        self.clients.fetch_sub(1, Ordering::Relaxed);
        if thread::panicking() {
            log::warn!("[{}] disconnecting due to panic", self.client_address);
        } else {
            log::info!("[{}] disconnected", self.client_address);
        }
    }
}

/// the responding side: accepts control connections and runs one session on each
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    pools: Arc<PortPools>,
    clients: Arc<AtomicUsize>,
    sessions: Arc<Mutex<Vec<Arc<SessionStatus>>>>,
    stop: Arc<AtomicBool>,
}

impl Server {
    pub fn bind(config: ServerConfig) -> Result<Server> {
        let pools = Arc::new(PortPools::new(
            &config.tcp_port_pool,
            &config.tcp6_port_pool,
            &config.udp_port_pool,
            &config.udp6_port_pool,
        ));
        if config.client_limit > 0 {
            log::debug!("limiting service to {} concurrent clients", config.client_limit);
        }

        let listener = TcpListener::bind(SocketAddr::new(config.bind, config.port))?;
        listener.set_nonblocking(true)?;
        log::info!("server listening on {}", listener.local_addr()?);

        Ok(Server {
            listener,
            config,
            pools,
            clients: Arc::new(AtomicUsize::new(0)),
            sessions: Arc::new(Mutex::new(Vec::new())),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// raising the returned flag makes `run` cancel its sessions and return
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// the number of clients currently connected
    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    fn is_running(&self) -> bool {
        is_alive() && !self.stop.load(Ordering::Relaxed)
    }

    pub fn run(&self) -> Result<()> {
        while self.is_running() {
            let (stream, address) = match self.listener.accept() {
                Ok((stream, address)) => (stream, address),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // no pending clients
                    thread::sleep(POLL_TIMEOUT);
                    continue;
                }
                Err(e) => {
                    return Err(e.into());
                }
            };

            log::info!("connection from {}", address);
            if let Err(e) = self.admit(stream, address) {
                log::error!("[{}] unable to serve client: {}", address, e);
            }
        }

        let sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
        for status in sessions.iter().filter(|status| !status.is_closed()) {
            status.cancel();
        }

        //wait until all clients have been disconnected
        loop {
            let clients_count = self.clients.load(Ordering::Relaxed);
            if clients_count > 0 {
                log::info!("waiting for {} clients to finish...", clients_count);
                thread::sleep(POLL_TIMEOUT);
            } else {
                break;
            }
        }
        Ok(())
    }

    fn admit(&self, stream: TcpStream, address: SocketAddr) -> Result<()> {
        // the listener is non-blocking; the control connection must not be
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;

        #[cfg(unix)]
        {
            use crate::protocol::communication::KEEPALIVE_DURATION;
            let keepalive_parameters = socket2::TcpKeepalive::new().with_time(KEEPALIVE_DURATION);
            let raw_socket = socket2::SockRef::from(&stream);
            raw_socket.set_tcp_keepalive(&keepalive_parameters)?;
        }

        let client_limit = self.config.client_limit;
        let client_count = self.clients.fetch_add(1, Ordering::Relaxed) + 1;
        if client_limit > 0 && client_count > client_limit {
            log::warn!("client-limit ({}) reached; disconnecting {}...", client_limit, address);
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                log::trace!("error disconnecting [{}]: {}", address, e);
            }
            self.clients.fetch_sub(1, Ordering::Relaxed);
            return Ok(());
        }

        // ensure the client is accounted-for even if the handler panics
        let client_thread_monitor = ClientThreadMonitor {
            client_address: address.to_string(),
            clients: self.clients.clone(),
        };

        let status = Arc::new(SessionStatus::default());
        {
            let mut sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions.retain(|status| !status.is_closed());
            sessions.push(status.clone());
        }

        let limits = self.config.limits;
        let pools = self.pools.clone();
        let thread_builder = thread::Builder::new().name(address.to_string());
        thread_builder.spawn(move || {
            let _client_thread_monitor = client_thread_monitor;

            match Session::responder(stream, limits, pools, status).and_then(Session::run) {
                Ok(report) => log::info!(
                    "[{}] test {:?}: {} bytes over {} streams",
                    address,
                    report.outcome,
                    report.sum.bytes,
                    report.streams.len()
                ),
                Err(e) => log::error!("[{}] error in client-handler: {}", address, e),
            }
        })?;
        Ok(())
    }
}

pub fn serve(args: &Args) -> BoxResult<()> {
    let config = ServerConfig {
        bind: args.bind,
        port: args.port,
        client_limit: args.client_limit,
        limits: Limits::default(),
        tcp_port_pool: args.tcp_port_pool.clone(),
        tcp6_port_pool: args.tcp6_port_pool.clone(),
        udp_port_pool: args.udp_port_pool.clone(),
        udp6_port_pool: args.udp6_port_pool.clone(),
    };
    let server = Server::bind(config)?;
    server.run()?;
    Ok(())
}

pub fn kill() -> bool {
    ALIVE.swap(false, Ordering::Relaxed)
}
fn is_alive() -> bool {
    ALIVE.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1".parse().unwrap(),
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn stops_when_asked() {
        let server = Server::bind(loopback_config()).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        let stop = server.stop_handle();
        let handle = thread::spawn(move || server.run());
        thread::sleep(Duration::from_millis(150));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn client_limit_disconnects_extra_clients() {
        let config = ServerConfig {
            client_limit: 1,
            ..loopback_config()
        };
        let server = Arc::new(Server::bind(config).unwrap());
        let address = server.local_addr().unwrap();
        let stop = server.stop_handle();
        let c_server = server.clone();
        let handle = thread::spawn(move || c_server.run());

        let _first = TcpStream::connect(address).unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(server.clients(), 1);

        let second = TcpStream::connect(address).unwrap();
        second.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 1];
        // the server hangs up without a word
        assert_eq!(io::Read::read(&mut &second, &mut buf).unwrap_or(0), 0);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.clients(), 1);

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
    }
}
