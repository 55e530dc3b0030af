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

use std::net::{SocketAddr, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::protocol::results::{FinalReport, IntervalReport};
use crate::protocol::state::{AbortReason, SessionState};
use crate::session::{Session, SessionStatus};
use crate::settings::{Limits, Settings};
use crate::stream::CONNECT_TIMEOUT;
use crate::{Error, Result};

/// how long `abort` waits for the session to release everything it holds
pub const ABORT_TIMEOUT: Duration = Duration::from_secs(5);

/// a running test, as seen by whoever started it
pub struct SessionHandle {
    status: Arc<SessionStatus>,
    reports: Option<mpsc::Receiver<IntervalReport>>,
    handle: JoinHandle<Result<FinalReport>>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    /// data sockets the session still has open
    pub fn open_sockets(&self) -> usize {
        self.status.open_sockets()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_closed()
    }

    /// interval reports as they are produced; can only be taken once
    pub fn interval_reports(&mut self) -> Option<mpsc::Receiver<IntervalReport>> {
        self.reports.take()
    }

    /// cancels the test and returns once its streams and control connection are closed,
    /// or once `ABORT_TIMEOUT` has passed; false in the latter case
    pub fn abort(&self) -> bool {
        log::info!("aborting test");
        self.status.cancel();
        self.status.wait_closed(ABORT_TIMEOUT)
    }

    /// blocks until the session is done or aborted
    pub fn wait(self) -> Result<FinalReport> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(Error::from("session thread panicked")),
        }
    }
}

fn connect_control(server_address: SocketAddr) -> Result<TcpStream> {
    log::info!("connecting to server at {}...", server_address);
    let stream = TcpStream::connect_timeout(&server_address, CONNECT_TIMEOUT)
        .map_err(|e| Error::Connect(format!("unable to connect to {}: {}", server_address, e)))?;
    stream.set_nodelay(true)?;

    #[cfg(unix)]
    {
        use crate::protocol::communication::KEEPALIVE_DURATION;
        let keepalive_parameters = socket2::TcpKeepalive::new().with_time(KEEPALIVE_DURATION);
        let raw_socket = socket2::SockRef::from(&stream);
        raw_socket.set_tcp_keepalive(&keepalive_parameters)?;
    }

    log::info!("connected to server");
    Ok(stream)
}

/// runs the initiating side on the calling thread; a cancellation noticed before the
/// session driver takes over still ends in `Aborted(Cancelled)` with an empty report
fn run_initiator(
    server_address: SocketAddr,
    settings: Settings,
    status: &Arc<SessionStatus>,
    reports: Option<mpsc::Sender<IntervalReport>>,
) -> Result<FinalReport> {
    let cancelled = |settings: &Settings| -> Result<FinalReport> {
        log::info!("test cancelled before it began");
        status.abandon(AbortReason::Cancelled);
        Ok(FinalReport::cancelled_before_start(settings.to_record()))
    };
    if status.is_cancelled() {
        return cancelled(&settings);
    }

    let control = match connect_control(server_address) {
        Ok(control) => control,
        Err(_) if status.is_cancelled() => return cancelled(&settings),
        Err(e) => {
            status.abandon(AbortReason::ConnectFailed(e.to_string()));
            return Err(e);
        }
    };
    if status.is_cancelled() {
        // dropping the connection closes it
        return cancelled(&settings);
    }

    let session = Session::initiator(control, settings, status.clone(), reports).map_err(|e| {
        status.abandon(AbortReason::ConnectFailed(e.to_string()));
        e
    })?;
    session.run()
}

/// validates `settings` and starts a test against the server at `server_address` in the background;
/// invalid settings are refused here, before any socket is opened
pub fn start(settings: Settings, server_address: SocketAddr) -> Result<SessionHandle> {
    settings.validate(&Limits::default())?;

    let status = Arc::new(SessionStatus::default());
    let (reports_tx, reports_rx) = mpsc::channel();

    let c_status = status.clone();
    let handle = thread::Builder::new()
        .name(format!("session-{}", server_address))
        .spawn(move || {
            let result = run_initiator(server_address, settings, &c_status, Some(reports_tx));
            if let Err(e) = &result {
                log::debug!("session ended in {}: {}", c_status.state().name(), e);
            }
            c_status.close();
            result
        })?;

    Ok(SessionHandle {
        status,
        reports: Some(reports_rx),
        handle,
    })
}

/// runs a test to completion; interval reports are handed to `on_interval` as they arrive
pub fn execute<F>(settings: Settings, server_address: SocketAddr, mut on_interval: F) -> Result<FinalReport>
where
    F: FnMut(&IntervalReport),
{
    let mut handle = start(settings, server_address)?;
    if let Some(reports) = handle.interval_reports() {
        // the sender disappears with the session, ending this loop
        for report in reports.iter() {
            on_interval(&report);
        }
    }
    handle.wait()
}
