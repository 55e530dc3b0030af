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

//! The session driver: the single thread that owns a session's state.
//!
//! Everything else (the control-connection reader, the timer, the stream
//! openers and one worker per data stream) runs on its own thread and only
//! talks to the driver through the bounded event queue. The driver feeds those
//! events to the `ControlMachine` and carries out the effects it returns.

use std::collections::VecDeque;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};

use crate::protocol::communication::{receive_message, send_message};
use crate::protocol::messaging::{prepare_accept, Message, StreamResult};
use crate::protocol::results::{get_unix_timestamp, FinalReport, IntervalRecord, IntervalReport, Outcome};
use crate::protocol::state::{AbortReason, ControlMachine, Effect, Role, SessionEvent, SessionState};
use crate::settings::{Limits, Settings};
use crate::stats::{Aggregator, StreamSlot};
use crate::stream::{self, IntervalSample, PortPools, SocketTally, StreamContext, StreamRole, TransportStream, CONNECT_TIMEOUT};
use crate::utils::timer::{TickSchedule, TimerEvent, TimerService};
use crate::{error_gen, Error, Result};

const EVENT_CAPACITY: usize = 1024;
/// how long the driver waits for an event before re-checking cancellation, liveness and pending intervals
const POP_TIMEOUT: Duration = Duration::from_millis(50);
const PUSH_TIMEOUT: Duration = Duration::from_secs(1);

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// how long an elapsed interval waits for slow streams before it is closed with what has arrived
const TICK_GRACE: Duration = Duration::from_millis(200);
/// how long stopping streams may take before their sockets are shut down underneath them
const CANCEL_TIMEOUT: Duration = Duration::from_secs(3);
const FORCED_CLOSE_GRACE: Duration = Duration::from_millis(500);
/// the slice a worker runs for when interval reporting is disabled
const ONE_SHOT_SLICE: Duration = Duration::from_millis(100);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// what other threads tell the driver
enum Event {
    Control(Message),
    ControlLost(String),
    ControlMalformed(String),
    Timer(TimerEvent),
    StreamsOpened(Result<Vec<Box<dyn TransportStream>>>),
    Sample(IntervalSample),
    StreamFinished(usize),
    StreamFailed(usize, String),
}

struct StatusInner {
    state: SessionState,
    closed: bool,
}

/// the part of a session visible from other threads
pub struct SessionStatus {
    inner: Mutex<StatusInner>,
    changed: Condvar,
    cancelled: AtomicBool,
    tally: SocketTally,
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus {
            inner: Mutex::new(StatusInner {
                state: SessionState::New,
                closed: false,
            }),
            changed: Condvar::new(),
            cancelled: AtomicBool::new(false),
            tally: SocketTally::default(),
        }
    }
}

impl SessionStatus {
    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    fn set_state(&self, state: &SessionState) {
        let mut inner = self.lock();
        if &inner.state != state {
            inner.state = state.clone();
            self.changed.notify_all();
        }
    }

    /// marks a session that ended before its driver could run; a terminal state is never replaced
    pub(crate) fn abandon(&self, reason: AbortReason) {
        let mut inner = self.lock();
        if !inner.state.is_terminal() {
            log::debug!("session abandoned while {}: {}", inner.state.name(), reason);
            inner.state = SessionState::Aborted(reason);
            self.changed.notify_all();
        }
    }

    /// raises the cancellation flag; the driver notices it at its next queue wait
    pub fn cancel(&self) {
        self.cancelled.store(true, Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Relaxed)
    }

    pub fn tally(&self) -> &SocketTally {
        &self.tally
    }

    pub fn open_sockets(&self) -> usize {
        self.tally.count()
    }

    /// true once the session is terminal and everything it owned has been released
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    /// waits for the session to close; false if `timeout` passed first
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while !inner.closed {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = match self.changed.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

struct StreamWorker {
    stream_idx: usize,
    handle: JoinHandle<()>,
    shutdown: Option<TcpStream>,
}

pub struct Session {
    machine: ControlMachine,
    control: TcpStream,
    peer: SocketAddr,
    cookie: uuid::Uuid,
    settings: Option<Settings>,
    pools: Arc<PortPools>,
    status: Arc<SessionStatus>,
    reports: Option<mpsc::Sender<IntervalReport>>,

    events_tx: Sender<Event>,
    events: Receiver<Event>,
    deferred: VecDeque<Event>,
    reader: Option<JoinHandle<()>>,
    reader_stop: Arc<AtomicBool>,
    opener: Option<JoinHandle<()>>,

    /// connected streams that have not been handed to a worker yet
    streams: Vec<Box<dyn TransportStream>>,
    workers: Vec<StreamWorker>,
    stop: Arc<AtomicBool>,
    finished_streams: Vec<usize>,

    timer: Option<TimerService>,
    schedule: Option<TickSchedule>,
    aggregator: Option<Aggregator>,
    pending_close: Option<(u64, Instant)>,
    started: String,
    peer_results: Vec<StreamResult>,

    last_heard: Instant,
    last_heartbeat: Instant,
    streams_stopped: bool,
    torn_down: bool,
}

impl Session {
    fn new(machine: ControlMachine, control: TcpStream, cookie: uuid::Uuid, status: Arc<SessionStatus>) -> Result<Session> {
        let peer = control.peer_addr()?;
        let (events_tx, events) = channel::bounded(EVENT_CAPACITY);
        Ok(Session {
            machine,
            control,
            peer,
            cookie,
            settings: None,
            pools: Arc::new(PortPools::default()),
            status,
            reports: None,

            events_tx,
            events,
            deferred: VecDeque::new(),
            reader: None,
            reader_stop: Arc::new(AtomicBool::new(false)),
            opener: None,

            streams: Vec::new(),
            workers: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            finished_streams: Vec::new(),

            timer: None,
            schedule: None,
            aggregator: None,
            pending_close: None,
            started: get_unix_timestamp(),
            peer_results: Vec::new(),

            last_heard: Instant::now(),
            last_heartbeat: Instant::now(),
            streams_stopped: false,
            torn_down: false,
        })
    }

    /// the side that opened `control` and proposes `settings`, which must already be valid
    pub fn initiator(
        control: TcpStream,
        settings: Settings,
        status: Arc<SessionStatus>,
        reports: Option<mpsc::Sender<IntervalReport>>,
    ) -> Result<Session> {
        let machine = ControlMachine::initiator(settings.stream_count());
        let mut session = Session::new(machine, control, uuid::Uuid::new_v4(), status)?;
        session.settings = Some(settings);
        session.reports = reports;
        Ok(session)
    }

    /// the side that accepted `control`; proposals are checked against `limits`
    pub fn responder(control: TcpStream, limits: Limits, pools: Arc<PortPools>, status: Arc<SessionStatus>) -> Result<Session> {
        let machine = ControlMachine::responder(limits);
        let mut session = Session::new(machine, control, uuid::Uuid::nil(), status)?;
        session.pools = pools;
        Ok(session)
    }

    /// drives the session to completion; a cancelled session still yields its partial report
    pub fn run(mut self) -> Result<FinalReport> {
        if let Err(e) = self.start_reader() {
            self.status.abandon(AbortReason::ControlLost(e.to_string()));
            self.status.close();
            return Err(e);
        }
        if self.machine.role() == Role::Initiator {
            self.dispatch(SessionEvent::Begin);
        }

        while !self.machine.state().is_terminal() {
            if self.status.is_cancelled() {
                log::info!("[{}] cancelling session", self.peer);
                self.dispatch(SessionEvent::Cancel);
                break;
            }
            self.keep_alive();
            self.try_close_interval(false);

            let event = match self.deferred.pop_front() {
                Some(event) => Some(event),
                None => self.events.recv_timeout(POP_TIMEOUT).ok(),
            };
            if let Some(event) = event {
                self.on_event(event);
            }
        }
        self.teardown();

        let result = match self.machine.state().clone() {
            SessionState::Done => {
                log::info!("[{}] session complete", self.peer);
                Ok(self.build_report(Outcome::Done))
            }
            SessionState::Aborted(AbortReason::Cancelled) => Ok(self.build_report(Outcome::Cancelled)),
            SessionState::Aborted(reason) => {
                log::error!("[{}] session aborted: {}", self.peer, reason);
                Err(Error::from(reason))
            }
            state => Err(error_gen!("session stopped while {}", state.name())),
        };
        self.status.close();
        result
    }

    fn dispatch(&mut self, event: SessionEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let effects = self.machine.handle(event);
            self.status.set_state(self.machine.state());
            for effect in effects {
                if let Err(failure) = self.apply(effect) {
                    if self.machine.state().is_terminal() {
                        // already on the way out; the remaining effects still run
                        log::debug!("[{}] ignoring {:?} during teardown", self.peer, failure);
                        continue;
                    }
                    queue.push_back(failure);
                    break;
                }
            }
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Control(message) => {
                self.last_heard = Instant::now();
                if let Message::Cookie { cookie } = &message {
                    if self.machine.role() == Role::Responder {
                        self.cookie = *cookie;
                    }
                }
                self.dispatch(SessionEvent::Received(message));
            }
            Event::ControlLost(reason) => self.dispatch(SessionEvent::ControlLost(reason)),
            Event::ControlMalformed(reason) => self.dispatch(SessionEvent::Malformed(reason)),
            Event::Timer(TimerEvent::Tick(k)) => self.dispatch(SessionEvent::IntervalElapsed(k)),
            Event::Timer(TimerEvent::Deadline) => {
                log::info!("[{}] test duration reached", self.peer);
                self.dispatch(SessionEvent::DeadlineReached);
            }
            Event::StreamsOpened(Ok(streams)) => {
                if self.machine.state().is_terminal() {
                    // dropping them closes them
                    return;
                }
                log::info!("[{}] all {} streams connected", self.peer, streams.len());
                self.streams = streams;
                self.dispatch(SessionEvent::StreamsConnected);
            }
            Event::StreamsOpened(Err(Error::Cancelled)) => (),
            Event::StreamsOpened(Err(e)) => self.dispatch(SessionEvent::StreamConnectFailed(e.to_string())),
            Event::Sample(sample) => {
                if let Some(aggregator) = self.aggregator.as_mut() {
                    aggregator.on_sample(sample);
                }
            }
            Event::StreamFinished(stream_idx) => {
                log::debug!("[{}] stream {} has finished", self.peer, stream_idx);
                if let Some(aggregator) = self.aggregator.as_mut() {
                    aggregator.mark_done(stream_idx);
                }
                if !self.finished_streams.contains(&stream_idx) {
                    self.finished_streams.push(stream_idx);
                }
                let expected = self.settings.as_ref().map_or(0, Settings::stream_count);
                if self.finished_streams.len() == expected {
                    self.dispatch(SessionEvent::StreamsFinished);
                }
            }
            Event::StreamFailed(stream_idx, reason) => {
                log::error!("[{}] stream {} failed: {}", self.peer, stream_idx, reason);
                self.dispatch(SessionEvent::StreamFailed(format!("stream {}: {}", stream_idx, reason)));
            }
        }
    }

    fn apply(&mut self, effect: Effect) -> std::result::Result<(), SessionEvent> {
        match effect {
            Effect::SendCookie => {
                let cookie = self.cookie;
                self.send(&Message::Cookie { cookie })
            }
            Effect::SendSettings => {
                let record = self.settings.as_ref().map(Settings::to_record).unwrap_or_default();
                self.send(&Message::Settings(record))
            }
            Effect::PrepareStreams(settings) => self.prepare_streams(settings),
            Effect::SendReject(reason) => {
                log::warn!("[{}] rejecting settings: {}", self.peer, reason);
                self.send(&Message::Reject { reason })
            }
            Effect::OpenStreams(stream_ports) => self.open_streams(stream_ports),
            Effect::SendConnected => self.send(&Message::Connected),
            Effect::SendStart => self.send(&Message::Start),
            Effect::StartStreams => self.start_streams(),
            Effect::CloseInterval(k) => {
                // a later tick supersedes an earlier one still waiting; closing k closes everything before it
                self.pending_close = match self.pending_close {
                    Some((_, since)) => Some((k, since)),
                    None => Some((k, Instant::now())),
                };
                self.try_close_interval(false);
                Ok(())
            }
            Effect::SendEnd => self.send(&Message::End),
            Effect::StopStreams => {
                self.stop_streams();
                Ok(())
            }
            Effect::SendResults => {
                let streams = self.aggregator.as_ref().map(Aggregator::cumulative).unwrap_or_default();
                self.send(&Message::Results { streams })
            }
            Effect::Finalize(streams) => {
                self.peer_results = streams;
                Ok(())
            }
            Effect::SendAbort(reason) => self.send(&Message::Abort { reason }),
            Effect::TearDown => {
                self.teardown();
                Ok(())
            }
        }
    }

    fn send(&mut self, message: &Message) -> std::result::Result<(), SessionEvent> {
        send_message(&mut self.control, message).map_err(|e| SessionEvent::ControlLost(e.to_string()))
    }

    fn start_reader(&mut self) -> Result<()> {
        let control = self.control.try_clone()?;
        let stop = self.reader_stop.clone();
        let events = self.events_tx.clone();
        let peer = self.peer;
        let handle = thread::Builder::new().name(format!("control-{}", peer)).spawn(move || {
            let alive = || !stop.load(Relaxed);
            loop {
                let event = match receive_message(&control, &alive) {
                    Ok(message) => Event::Control(message),
                    Err(Error::Cancelled) => break,
                    Err(Error::Protocol(reason)) => Event::ControlMalformed(reason),
                    Err(e) => Event::ControlLost(e.to_string()),
                };
                let last = !matches!(event, Event::Control(_));
                if events.send_timeout(event, PUSH_TIMEOUT).is_err() {
                    log::debug!("[{}] control reader stopping; the session is gone", peer);
                    break;
                }
                if last {
                    break;
                }
            }
            log::trace!("[{}] control reader stopped", peer);
        })?;
        self.reader = Some(handle);
        Ok(())
    }

    /// sends heartbeats and aborts the session if the peer has gone quiet
    fn keep_alive(&mut self) {
        let state = self.machine.state().clone();
        if state.is_terminal() {
            return;
        }
        if self.last_heard.elapsed() >= LIVENESS_TIMEOUT {
            log::warn!("[{}] nothing heard from the peer for {:?}", self.peer, LIVENESS_TIMEOUT);
            self.dispatch(SessionEvent::LivenessExpired);
            return;
        }
        if state != SessionState::New && self.last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            self.last_heartbeat = Instant::now();
            if let Err(failure) = self.send(&Message::Heartbeat) {
                self.dispatch(failure);
            }
        }
    }

    /// binds the responder's data sockets, offers their ports and waits for the initiator in the background
    fn prepare_streams(&mut self, settings: Settings) -> std::result::Result<(), SessionEvent> {
        log::info!(
            "[{}] preparing {} {} test with {} streams",
            self.peer,
            settings.direction,
            settings.protocol,
            settings.stream_count()
        );
        let mut pending = Vec::with_capacity(settings.stream_count());
        let mut stream_ports = Vec::with_capacity(settings.stream_count());
        for stream_idx in 0..settings.stream_count() {
            log::debug!("[{}] preparing stream {}...", self.peer, stream_idx);
            let ctx = StreamContext::new(&settings, stream_idx, false, self.cookie, self.status.tally());
            let listening = stream::listen(ctx, &self.pools, self.peer.ip())
                .and_then(|listening| Ok((listening.get_port()?, listening)))
                .map_err(|e| SessionEvent::StreamConnectFailed(e.to_string()))?;
            stream_ports.push(listening.0);
            pending.push(listening.1);
        }
        self.settings = Some(settings);
        self.send(&prepare_accept(&stream_ports))?;

        let stop = self.stop.clone();
        self.spawn_opener(move || {
            let alive = || !stop.load(Relaxed);
            pending.into_iter().map(|listening| listening.accept(&alive)).collect()
        })
    }

    /// dials the responder's data ports in the background
    fn open_streams(&mut self, stream_ports: Vec<u16>) -> std::result::Result<(), SessionEvent> {
        let settings = self
            .settings
            .clone()
            .ok_or_else(|| SessionEvent::StreamConnectFailed("no settings to open streams with".to_string()))?;
        let cookie = self.cookie;
        let tally = self.status.tally().clone();
        let peer_ip = self.peer.ip();
        let stop = self.stop.clone();
        self.spawn_opener(move || {
            stream_ports
                .iter()
                .enumerate()
                .map(|(stream_idx, &port)| {
                    if stop.load(Relaxed) {
                        return Err(Error::Cancelled);
                    }
                    let ctx = StreamContext::new(&settings, stream_idx, true, cookie, &tally);
                    stream::connect(ctx, SocketAddr::new(peer_ip, port))
                })
                .collect()
        })
    }

    fn spawn_opener<F>(&mut self, open: F) -> std::result::Result<(), SessionEvent>
    where
        F: FnOnce() -> Result<Vec<Box<dyn TransportStream>>> + Send + 'static,
    {
        let stop = self.stop.clone();
        let events = self.events_tx.clone();
        let peer = self.peer;
        let handle = thread::Builder::new()
            .name(format!("opener-{}", peer))
            .spawn(move || {
                let result = open();
                if stop.load(Relaxed) {
                    // the session is being torn down; dropping the streams closes them
                    return;
                }
                if events.send_timeout(Event::StreamsOpened(result), PUSH_TIMEOUT).is_err() {
                    log::debug!("[{}] discarding opened streams; the session is gone", peer);
                }
            })
            .map_err(|e| SessionEvent::StreamConnectFailed(e.to_string()))?;
        self.opener = Some(handle);
        Ok(())
    }

    fn start_streams(&mut self) -> std::result::Result<(), SessionEvent> {
        let settings = self
            .settings
            .clone()
            .ok_or_else(|| SessionEvent::StreamFailed("no settings to start streams with".to_string()))?;
        let initiator = self.machine.role() == Role::Initiator;

        let origin = Instant::now();
        let schedule = TickSchedule::new(origin, settings.interval);
        let end = settings.duration().map(|duration| origin + duration);
        let slots: Vec<StreamSlot> = (0..settings.stream_count())
            .map(|stream_idx| {
                let flow = settings.flow_of(stream_idx);
                StreamSlot {
                    stream_idx,
                    flow,
                    sending: StreamRole::for_flow(flow, initiator) == StreamRole::Sender,
                }
            })
            .collect();
        self.aggregator = Some(Aggregator::new(schedule, &slots, settings.protocol));
        self.schedule = Some(schedule);
        self.started = get_unix_timestamp();

        // only the initiator's clock decides when a timed test is over
        let deadline = if initiator { end } else { None };
        let events = self.events_tx.clone();
        let timer = TimerService::start(schedule, deadline, move |event| {
            if events.send_timeout(Event::Timer(event), PUSH_TIMEOUT).is_err() {
                log::debug!("dropping timer event {:?}", event);
            }
        })
        .map_err(|e| SessionEvent::StreamFailed(e.to_string()))?;
        self.timer = Some(timer);

        for mut test_stream in self.streams.drain(..) {
            test_stream.begin(origin, end);
            let stream_idx = test_stream.get_idx();
            let shutdown = test_stream.shutdown_handle();
            let stop = self.stop.clone();
            let events = self.events_tx.clone();
            let peer = self.peer;
            log::info!("[{}] beginning execution of stream {}...", peer, stream_idx);
            let handle = thread::Builder::new()
                .name(format!("stream-{}", stream_idx))
                .spawn(move || run_stream(test_stream, schedule, stop, events, peer))
                .map_err(|e| SessionEvent::StreamFailed(format!("stream {}: {}", stream_idx, e)))?;
            self.workers.push(StreamWorker {
                stream_idx,
                handle,
                shutdown,
            });
        }
        Ok(())
    }

    fn publish(&self, report: IntervalReport) {
        log::debug!(
            "[{}] interval {} ({:.1}s-{:.1}s): {} bytes, {:.0} bits/second",
            self.peer,
            report.index,
            report.sum.interval_start,
            report.sum.interval_end,
            report.sum.bytes,
            report.sum.bits_per_second
        );
        if let Some(reports) = &self.reports {
            if reports.send(report).is_err() {
                log::trace!("[{}] nobody is listening for interval reports", self.peer);
            }
        }
    }

    /// closes the pending interval once every stream has reported, or once the grace period is over
    fn try_close_interval(&mut self, force: bool) {
        let (k, since) = match self.pending_close {
            Some(pending) => pending,
            None => return,
        };
        let aggregator = match self.aggregator.as_mut() {
            Some(aggregator) => aggregator,
            None => {
                self.pending_close = None;
                return;
            }
        };
        let complete = aggregator.is_complete(k);
        if !(force || complete || since.elapsed() >= TICK_GRACE) {
            return;
        }
        if !complete {
            log::debug!("[{}] closing interval {} without every stream", self.peer, k);
        }
        self.pending_close = None;
        if let Some(report) = aggregator.close_interval(k) {
            self.publish(report);
        }
    }

    /// seconds of test time covered so far; a timed test never covers more than its duration
    fn elapsed_seconds(&self) -> Option<f64> {
        let elapsed = self.schedule?.origin().elapsed().as_secs_f64();
        match self.settings.as_ref().and_then(Settings::duration) {
            Some(duration) => Some(elapsed.min(duration.as_secs_f64())),
            None => Some(elapsed),
        }
    }

    fn stop_streams(&mut self) {
        if self.streams_stopped {
            return;
        }
        self.streams_stopped = true;
        let end = self.elapsed_seconds();
        log::debug!("[{}] stopping any still-in-progress streams", self.peer);

        if let Some(timer) = self.timer.as_mut() {
            timer.stop();
        }
        self.join_workers();

        self.try_close_interval(true);
        if let Some(end) = end {
            let report = self.aggregator.as_mut().and_then(|aggregator| aggregator.finish(end));
            if let Some(report) = report {
                self.publish(report);
            }
        }
    }

    /// raises the stop flag and waits for every worker, shutting sockets down under any that do not respond
    fn join_workers(&mut self) {
        self.stop.store(true, Relaxed);
        let mut deadline = Instant::now() + CANCEL_TIMEOUT;
        let mut forced = false;
        loop {
            // keep the queue moving so that no worker blocks publishing
            while let Ok(event) = self.events.try_recv() {
                self.absorb_while_stopping(event);
            }
            if self.workers.iter().all(|worker| worker.handle.is_finished()) {
                break;
            }
            if Instant::now() >= deadline {
                if forced {
                    log::warn!("[{}] abandoning unresponsive stream workers", self.peer);
                    break;
                }
                for worker in self.workers.iter().filter(|worker| !worker.handle.is_finished()) {
                    log::warn!("[{}] forcing stream {} closed", self.peer, worker.stream_idx);
                    if let Some(socket) = &worker.shutdown {
                        let _ = socket.shutdown(Shutdown::Both);
                    }
                }
                forced = true;
                deadline = Instant::now() + FORCED_CLOSE_GRACE;
            }
            thread::sleep(JOIN_POLL);
        }

        for worker in self.workers.drain(..) {
            if worker.handle.is_finished() && worker.handle.join().is_err() {
                log::error!("[{}] stream {} worker panicked", self.peer, worker.stream_idx);
            }
        }
        while let Ok(event) = self.events.try_recv() {
            self.absorb_while_stopping(event);
        }
    }

    fn absorb_while_stopping(&mut self, event: Event) {
        match event {
            Event::Sample(sample) => {
                if let Some(aggregator) = self.aggregator.as_mut() {
                    aggregator.on_sample(sample);
                }
            }
            // streams stopping on request are neither finished nor failed
            Event::StreamFinished(_) | Event::StreamFailed(..) => (),
            other => self.deferred.push_back(other),
        }
    }

    /// releases every stream, the timer and the control connection; safe to call more than once
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        log::debug!("[{}] tearing down session", self.peer);

        self.stop_streams();
        for mut test_stream in self.streams.drain(..) {
            test_stream.close();
        }

        if let Some(opener) = self.opener.take() {
            let deadline = Instant::now() + CONNECT_TIMEOUT;
            while !opener.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if opener.is_finished() {
                let _ = opener.join();
            } else {
                log::warn!("[{}] stream opener did not stop in time", self.peer);
            }
        }
        // opened streams that were never claimed are closed by dropping them
        self.deferred.clear();
        while self.events.try_recv().is_ok() {}

        self.reader_stop.store(true, Relaxed);
        if let Some(reader) = self.reader.take() {
            let deadline = Instant::now() + CANCEL_TIMEOUT;
            while !reader.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if reader.is_finished() {
                let _ = reader.join();
            }
        }
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            log::trace!("[{}] error disconnecting: {}", self.peer, e);
        }
    }

    fn build_report(&mut self, outcome: Outcome) -> FinalReport {
        let mut streams = self.aggregator.take().map(Aggregator::into_reports).unwrap_or_default();
        for stream in streams.iter_mut() {
            stream.peer = self
                .peer_results
                .iter()
                .find(|result| result.stream_idx == stream.stream_idx)
                .map(|result| result.totals.clone());
        }
        let sum = IntervalRecord::sum(streams.iter().map(|stream| &stream.cumulative));
        let peers: Vec<&IntervalRecord> = streams.iter().filter_map(|stream| stream.peer.as_ref()).collect();
        let sum_peer = if peers.is_empty() {
            None
        } else {
            Some(IntervalRecord::sum(peers))
        };

        FinalReport {
            cookie: self.cookie,
            settings: self.settings.as_ref().map(Settings::to_record).unwrap_or_default(),
            started: self.started.clone(),
            outcome,
            streams,
            sum,
            sum_peer,
        }
    }
}

/// a stream worker: moves data one interval slice at a time and publishes what it moved
fn run_stream(
    mut test_stream: Box<dyn TransportStream>,
    schedule: TickSchedule,
    stop: Arc<AtomicBool>,
    events: Sender<Event>,
    peer: SocketAddr,
) {
    let stream_idx = test_stream.get_idx();
    let publish = |event: Event| {
        if events.send_timeout(event, PUSH_TIMEOUT).is_err() {
            log::debug!("[{}] stream {} could not publish; the session is gone", peer, stream_idx);
        }
    };

    let mut finished = false;
    while !stop.load(Relaxed) {
        let now = Instant::now();
        let tick = schedule.interval_at(now);
        let until = if schedule.is_one_shot() {
            now + ONE_SHOT_SLICE
        } else {
            schedule.boundary(tick + 1)
        };

        match test_stream.run_tick(until, &stop) {
            Ok(delta) => {
                log::trace!("[{}] stream {} moved {} bytes in interval {}", peer, stream_idx, delta.bytes, tick);
                finished = delta.finished;
                publish(Event::Sample(IntervalSample { stream_idx, tick, delta }));
                if finished {
                    publish(Event::StreamFinished(stream_idx));
                    break;
                }
            }
            Err(e) => {
                if !stop.load(Relaxed) {
                    publish(Event::StreamFailed(stream_idx, e.to_string()));
                }
                test_stream.close();
                return;
            }
        }
    }

    if !finished {
        match test_stream.drain() {
            Ok(delta) => {
                let tick = schedule.interval_at(Instant::now());
                publish(Event::Sample(IntervalSample { stream_idx, tick, delta }));
            }
            Err(e) => log::debug!("[{}] stream {} could not drain: {}", peer, stream_idx, e),
        }
    }
    test_stream.close();
    log::debug!("[{}] stream {} closed", peer, stream_idx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_starts_new_and_open() {
        let status = SessionStatus::default();
        assert_eq!(status.state(), SessionState::New);
        assert!(!status.is_closed());
        assert!(!status.is_cancelled());
        assert_eq!(status.open_sockets(), 0);
        assert!(!status.wait_closed(Duration::from_millis(10)));
    }

    #[test]
    fn closing_wakes_waiters() {
        let status = Arc::new(SessionStatus::default());
        let c_status = status.clone();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            c_status.set_state(&SessionState::Done);
            c_status.close();
        });
        assert!(status.wait_closed(Duration::from_secs(5)));
        assert_eq!(status.state(), SessionState::Done);
        closer.join().unwrap();
    }

    #[test]
    fn abandoning_never_overrides_a_terminal_state() {
        let status = SessionStatus::default();
        status.abandon(AbortReason::ConnectFailed("refused".to_string()));
        assert_eq!(status.state(), SessionState::Aborted(AbortReason::ConnectFailed("refused".to_string())));
        status.abandon(AbortReason::Cancelled);
        assert_eq!(status.state(), SessionState::Aborted(AbortReason::ConnectFailed("refused".to_string())));

        let status = SessionStatus::default();
        status.set_state(&SessionState::Done);
        status.abandon(AbortReason::Cancelled);
        assert_eq!(status.state(), SessionState::Done);
    }

    struct CountedStream {
        ticks: usize,
    }

    impl TransportStream for CountedStream {
        fn begin(&mut self, _origin: Instant, _end: Option<Instant>) {}

        fn run_tick(&mut self, _until: Instant, _stop: &AtomicBool) -> Result<crate::stream::TransferDelta> {
            self.ticks += 1;
            Ok(crate::stream::TransferDelta {
                bytes: 100,
                finished: self.ticks == 3,
                ..Default::default()
            })
        }

        fn drain(&mut self) -> Result<crate::stream::TransferDelta> {
            Ok(Default::default())
        }

        fn close(&mut self) {}

        fn get_idx(&self) -> usize {
            4
        }

        fn get_port(&self) -> Result<u16> {
            Ok(0)
        }

        fn shutdown_handle(&self) -> Option<TcpStream> {
            None
        }
    }

    #[test]
    fn workers_publish_samples_then_finish() {
        let (events_tx, events) = channel::bounded(EVENT_CAPACITY);
        let schedule = TickSchedule::new(Instant::now(), Duration::from_secs(1));
        let peer: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        run_stream(Box::new(CountedStream { ticks: 0 }), schedule, Arc::new(AtomicBool::new(false)), events_tx, peer);

        let published: Vec<Event> = events.try_iter().collect();
        assert_eq!(published.len(), 4);
        let bytes: u64 = published
            .iter()
            .map(|event| match event {
                Event::Sample(sample) => sample.delta.bytes,
                _ => 0,
            })
            .sum();
        assert_eq!(bytes, 300);
        assert!(matches!(published.last(), Some(Event::StreamFinished(4))));
    }

    #[test]
    fn cancellation_is_sticky() {
        let status = SessionStatus::default();
        status.cancel();
        status.cancel();
        assert!(status.is_cancelled());
    }
}
