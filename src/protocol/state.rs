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

//! The session lifecycle as a pure transition function.
//!
//! `ControlMachine::handle` consumes one event and returns the effects the driver must
//! carry out, in order. Nothing here touches a socket, a thread or a clock, so both
//! roles can be exercised directly from tests.

use std::fmt;

use crate::error::Error;
use crate::protocol::messaging::{Message, StreamResult};
use crate::settings::{Limits, Settings};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// opens the control connection, proposes settings and dials every data stream
    Initiator,
    /// validates the proposal and accepts the data streams
    Responder,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AbortReason {
    Rejected(String),
    Cancelled,
    ConnectFailed(String),
    Protocol(String),
    ControlLost(String),
    StreamFailed(String),
    PeerAborted(String),
    LivenessExpired,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Rejected(reason) => write!(f, "settings rejected: {}", reason),
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::ConnectFailed(reason) => write!(f, "unable to connect streams: {}", reason),
            AbortReason::Protocol(reason) => write!(f, "protocol violation: {}", reason),
            AbortReason::ControlLost(reason) => write!(f, "control connection lost: {}", reason),
            AbortReason::StreamFailed(reason) => write!(f, "stream failed: {}", reason),
            AbortReason::PeerAborted(reason) => write!(f, "peer aborted: {}", reason),
            AbortReason::LivenessExpired => write!(f, "peer stopped responding"),
        }
    }
}

impl From<AbortReason> for Error {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Rejected(reason) => Error::Rejected(reason),
            AbortReason::Cancelled => Error::Cancelled,
            AbortReason::ConnectFailed(reason) => Error::Connect(reason),
            AbortReason::Protocol(reason) => Error::Protocol(reason),
            AbortReason::StreamFailed(reason) => Error::TransientIo(reason),
            reason @ (AbortReason::ControlLost(_) | AbortReason::PeerAborted(_) | AbortReason::LivenessExpired) => {
                Error::Connect(reason.to_string())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionState {
    New,
    Negotiating,
    Ready { local_connected: bool, peer_connected: bool },
    Running,
    ExchangingResults,
    Done,
    Aborted(AbortReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Aborted(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::New => "new",
            SessionState::Negotiating => "negotiating",
            SessionState::Ready { .. } => "ready",
            SessionState::Running => "running",
            SessionState::ExchangingResults => "exchanging-results",
            SessionState::Done => "done",
            SessionState::Aborted(_) => "aborted",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// the initiator's control connection is up
    Begin,
    Received(Message),
    /// every local data stream is connected
    StreamsConnected,
    StreamConnectFailed(String),
    IntervalElapsed(u64),
    DeadlineReached,
    /// every local data stream has run out of data to move
    StreamsFinished,
    StreamFailed(String),
    ControlLost(String),
    /// a control message arrived that could not be decoded
    Malformed(String),
    LivenessExpired,
    Cancel,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    SendCookie,
    SendSettings,
    /// bind the data sockets for these validated settings and answer with their ports
    PrepareStreams(Settings),
    SendReject(String),
    /// dial the responder's data ports, in stream-index order
    OpenStreams(Vec<u16>),
    SendConnected,
    SendStart,
    StartStreams,
    CloseInterval(u64),
    SendEnd,
    StopStreams,
    SendResults,
    /// the peer's final per-stream totals
    Finalize(Vec<StreamResult>),
    SendAbort(String),
    TearDown,
}

pub struct ControlMachine {
    role: Role,
    limits: Limits,
    /// the number of data ports the initiator expects to be offered
    expected_streams: usize,
    state: SessionState,
}

impl ControlMachine {
    pub fn initiator(expected_streams: usize) -> ControlMachine {
        ControlMachine {
            role: Role::Initiator,
            limits: Limits::default(),
            expected_streams,
            state: SessionState::New,
        }
    }

    pub fn responder(limits: Limits) -> ControlMachine {
        ControlMachine {
            role: Role::Responder,
            limits,
            expected_streams: 0,
            state: SessionState::New,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    fn abort(&mut self, reason: AbortReason, notify_peer: bool) -> Vec<Effect> {
        log::debug!("session aborting from {}: {}", self.state.name(), reason);
        let notice = reason.to_string();
        self.state = SessionState::Aborted(reason);
        if notify_peer {
            vec![Effect::SendAbort(notice), Effect::TearDown]
        } else {
            vec![Effect::TearDown]
        }
    }

    fn unexpected(&mut self, message: &Message) -> Vec<Effect> {
        let reason = format!("unexpected {} message while {}", message.kind(), self.state.name());
        self.abort(AbortReason::Protocol(reason), true)
    }

    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        if self.state.is_terminal() {
            log::trace!("ignoring {:?} in terminal state {}", event, self.state.name());
            return Vec::new();
        }

        // failures apply to every non-terminal state
        let event = match event {
            SessionEvent::Cancel => return self.abort(AbortReason::Cancelled, true),
            SessionEvent::ControlLost(reason) => return self.abort(AbortReason::ControlLost(reason), false),
            SessionEvent::Malformed(reason) => return self.abort(AbortReason::Protocol(reason), true),
            SessionEvent::StreamConnectFailed(reason) => return self.abort(AbortReason::ConnectFailed(reason), true),
            SessionEvent::StreamFailed(reason) => return self.abort(AbortReason::StreamFailed(reason), true),
            SessionEvent::LivenessExpired => return self.abort(AbortReason::LivenessExpired, true),
            SessionEvent::Received(Message::Abort { reason }) => return self.abort(AbortReason::PeerAborted(reason), false),
            SessionEvent::Received(Message::Heartbeat) => return Vec::new(),
            other => other,
        };

        match self.role {
            Role::Initiator => self.handle_initiator(event),
            Role::Responder => self.handle_responder(event),
        }
    }

    fn handle_initiator(&mut self, event: SessionEvent) -> Vec<Effect> {
        match (&self.state, event) {
            (SessionState::New, SessionEvent::Begin) => {
                self.state = SessionState::Negotiating;
                vec![Effect::SendCookie, Effect::SendSettings]
            }
            (SessionState::Negotiating, SessionEvent::Received(Message::Accept { stream_ports })) => {
                if stream_ports.len() != self.expected_streams {
                    let reason = format!("offered {} stream ports for {} streams", stream_ports.len(), self.expected_streams);
                    return self.abort(AbortReason::Protocol(reason), true);
                }
                self.state = SessionState::Ready {
                    local_connected: false,
                    peer_connected: false,
                };
                vec![Effect::OpenStreams(stream_ports)]
            }
            (SessionState::Negotiating, SessionEvent::Received(Message::Reject { reason })) => {
                self.abort(AbortReason::Rejected(reason), false)
            }
            (
                &SessionState::Ready {
                    local_connected: false,
                    peer_connected,
                },
                SessionEvent::StreamsConnected,
            ) => self.ready(true, peer_connected),
            (
                &SessionState::Ready {
                    local_connected,
                    peer_connected: false,
                },
                SessionEvent::Received(Message::Connected),
            ) => self.ready(local_connected, true),
            (_, event) => self.handle_common(event),
        }
    }

    fn ready(&mut self, local_connected: bool, peer_connected: bool) -> Vec<Effect> {
        if local_connected && peer_connected {
            log::debug!("all streams connected on both sides; starting");
            self.state = SessionState::Running;
            vec![Effect::SendStart, Effect::StartStreams]
        } else {
            self.state = SessionState::Ready {
                local_connected,
                peer_connected,
            };
            Vec::new()
        }
    }

    fn handle_responder(&mut self, event: SessionEvent) -> Vec<Effect> {
        match (&self.state, event) {
            (SessionState::New, SessionEvent::Received(Message::Cookie { .. })) => {
                self.state = SessionState::Negotiating;
                Vec::new()
            }
            (SessionState::Negotiating, SessionEvent::Received(Message::Settings(record))) => {
                let negotiated = Settings::try_from(&record).and_then(|settings| {
                    settings.validate(&self.limits)?;
                    Ok(settings)
                });
                match negotiated {
                    Ok(settings) => {
                        self.state = SessionState::Ready {
                            local_connected: false,
                            peer_connected: false,
                        };
                        vec![Effect::PrepareStreams(settings)]
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        self.state = SessionState::Aborted(AbortReason::Rejected(reason.clone()));
                        vec![Effect::SendReject(reason), Effect::TearDown]
                    }
                }
            }
            (
                SessionState::Ready {
                    local_connected: false, ..
                },
                SessionEvent::StreamsConnected,
            ) => {
                self.state = SessionState::Ready {
                    local_connected: true,
                    peer_connected: false,
                };
                vec![Effect::SendConnected]
            }
            (SessionState::Ready { local_connected: true, .. }, SessionEvent::Received(Message::Start)) => {
                self.state = SessionState::Running;
                vec![Effect::StartStreams]
            }
            (_, event) => self.handle_common(event),
        }
    }

    /// transitions shared by both roles once data is flowing
    fn handle_common(&mut self, event: SessionEvent) -> Vec<Effect> {
        match (&self.state, event) {
            (SessionState::Running, SessionEvent::IntervalElapsed(k)) => vec![Effect::CloseInterval(k)],
            (SessionState::Running, SessionEvent::DeadlineReached | SessionEvent::StreamsFinished) => {
                self.state = SessionState::ExchangingResults;
                vec![Effect::SendEnd, Effect::StopStreams, Effect::SendResults]
            }
            (SessionState::Running, SessionEvent::Received(Message::End)) => {
                self.state = SessionState::ExchangingResults;
                vec![Effect::StopStreams, Effect::SendResults]
            }
            (SessionState::ExchangingResults, SessionEvent::Received(Message::Results { streams })) => {
                self.state = SessionState::Done;
                vec![Effect::Finalize(streams), Effect::TearDown]
            }
            // both sides may decide to end at once
            (SessionState::ExchangingResults, SessionEvent::Received(Message::End)) => Vec::new(),
            (_, SessionEvent::Received(message)) => self.unexpected(&message),
            (state, event) => {
                log::trace!("ignoring {:?} while {}", event, state.name());
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::results::IntervalRecord;
    use crate::settings::Protocol;

    fn settings() -> Settings {
        Settings {
            protocol: Protocol::Udp,
            streams: 2,
            block_size: 1200,
            bandwidth: Some(1_000_000),
            ..Settings::default()
        }
    }

    fn results() -> Message {
        Message::Results {
            streams: vec![StreamResult {
                stream_idx: 0,
                totals: IntervalRecord::default(),
            }],
        }
    }

    fn running_initiator() -> ControlMachine {
        let mut machine = ControlMachine::initiator(2);
        machine.handle(SessionEvent::Begin);
        machine.handle(SessionEvent::Received(Message::Accept {
            stream_ports: vec![5100, 5101],
        }));
        machine.handle(SessionEvent::StreamsConnected);
        machine.handle(SessionEvent::Received(Message::Connected));
        assert_eq!(machine.state(), &SessionState::Running);
        machine
    }

    fn running_responder() -> ControlMachine {
        let mut machine = ControlMachine::responder(Limits::default());
        machine.handle(SessionEvent::Received(Message::Cookie {
            cookie: uuid::Uuid::new_v4(),
        }));
        machine.handle(SessionEvent::Received(Message::Settings(settings().to_record())));
        machine.handle(SessionEvent::StreamsConnected);
        machine.handle(SessionEvent::Received(Message::Start));
        assert_eq!(machine.state(), &SessionState::Running);
        machine
    }

    #[test]
    fn initiator_happy_path() {
        let mut machine = ControlMachine::initiator(2);
        assert_eq!(
            machine.handle(SessionEvent::Begin),
            vec![Effect::SendCookie, Effect::SendSettings]
        );
        assert_eq!(machine.state(), &SessionState::Negotiating);

        assert_eq!(
            machine.handle(SessionEvent::Received(Message::Accept {
                stream_ports: vec![5100, 5101]
            })),
            vec![Effect::OpenStreams(vec![5100, 5101])]
        );
        assert_eq!(machine.handle(SessionEvent::StreamsConnected), vec![]);
        assert_eq!(
            machine.state(),
            &SessionState::Ready {
                local_connected: true,
                peer_connected: false
            }
        );
        assert_eq!(
            machine.handle(SessionEvent::Received(Message::Connected)),
            vec![Effect::SendStart, Effect::StartStreams]
        );

        assert_eq!(machine.handle(SessionEvent::IntervalElapsed(0)), vec![Effect::CloseInterval(0)]);
        assert_eq!(
            machine.handle(SessionEvent::DeadlineReached),
            vec![Effect::SendEnd, Effect::StopStreams, Effect::SendResults]
        );
        assert_eq!(machine.state(), &SessionState::ExchangingResults);
        // the responder may have ended too
        assert_eq!(machine.handle(SessionEvent::Received(Message::End)), vec![]);

        let effects = machine.handle(SessionEvent::Received(results()));
        assert!(matches!(effects[0], Effect::Finalize(ref streams) if streams.len() == 1));
        assert_eq!(effects[1], Effect::TearDown);
        assert_eq!(machine.state(), &SessionState::Done);
    }

    #[test]
    fn peer_may_report_connected_first() {
        let mut machine = ControlMachine::initiator(1);
        machine.handle(SessionEvent::Begin);
        machine.handle(SessionEvent::Received(Message::Accept { stream_ports: vec![1] }));
        assert_eq!(machine.handle(SessionEvent::Received(Message::Connected)), vec![]);
        assert_eq!(
            machine.handle(SessionEvent::StreamsConnected),
            vec![Effect::SendStart, Effect::StartStreams]
        );
    }

    #[test]
    fn responder_happy_path() {
        let mut machine = ControlMachine::responder(Limits::default());
        assert_eq!(
            machine.handle(SessionEvent::Received(Message::Cookie {
                cookie: uuid::Uuid::new_v4()
            })),
            vec![]
        );
        assert_eq!(
            machine.handle(SessionEvent::Received(Message::Settings(settings().to_record()))),
            vec![Effect::PrepareStreams(settings())]
        );
        assert_eq!(machine.handle(SessionEvent::StreamsConnected), vec![Effect::SendConnected]);
        assert_eq!(machine.handle(SessionEvent::Received(Message::Start)), vec![Effect::StartStreams]);
        assert_eq!(
            machine.handle(SessionEvent::Received(Message::End)),
            vec![Effect::StopStreams, Effect::SendResults]
        );
        machine.handle(SessionEvent::Received(results()));
        assert_eq!(machine.state(), &SessionState::Done);
    }

    #[test]
    fn responder_rejects_settings_beyond_its_limits() {
        let mut machine = ControlMachine::responder(Limits {
            max_streams: 2,
            ..Limits::default()
        });
        machine.handle(SessionEvent::Received(Message::Cookie {
            cookie: uuid::Uuid::new_v4(),
        }));
        let proposal = Settings {
            streams: 4,
            ..settings()
        };
        let effects = machine.handle(SessionEvent::Received(Message::Settings(proposal.to_record())));
        assert!(matches!(effects[0], Effect::SendReject(ref reason) if reason.contains("maximum is 2")));
        assert!(matches!(machine.state(), SessionState::Aborted(AbortReason::Rejected(_))));
    }

    #[test]
    fn responder_rejects_unsupported_tags() {
        let mut machine = ControlMachine::responder(Limits::default());
        machine.handle(SessionEvent::Received(Message::Cookie {
            cookie: uuid::Uuid::new_v4(),
        }));
        let mut record = settings().to_record();
        record.protocol = "sctp".to_string();
        let effects = machine.handle(SessionEvent::Received(Message::Settings(record)));
        assert_eq!(effects[0], Effect::SendReject("unsupported protocol: sctp".to_string()));
    }

    #[test]
    fn initiator_surfaces_rejection() {
        let mut machine = ControlMachine::initiator(1);
        machine.handle(SessionEvent::Begin);
        assert_eq!(
            machine.handle(SessionEvent::Received(Message::Reject {
                reason: "too many".to_string()
            })),
            vec![Effect::TearDown]
        );
        let reason = match machine.state() {
            SessionState::Aborted(reason) => reason.clone(),
            other => panic!("unexpected state {:?}", other),
        };
        assert!(matches!(Error::from(reason), Error::Rejected(r) if r == "too many"));
    }

    #[test]
    fn wrong_number_of_ports_is_a_protocol_error() {
        let mut machine = ControlMachine::initiator(2);
        machine.handle(SessionEvent::Begin);
        machine.handle(SessionEvent::Received(Message::Accept { stream_ports: vec![1] }));
        assert!(matches!(machine.state(), SessionState::Aborted(AbortReason::Protocol(_))));
    }

    #[test]
    fn out_of_sequence_messages_abort() {
        let mut machine = ControlMachine::responder(Limits::default());
        let effects = machine.handle(SessionEvent::Received(Message::Start));
        assert!(matches!(effects[0], Effect::SendAbort(_)));
        assert!(matches!(machine.state(), SessionState::Aborted(AbortReason::Protocol(_))));

        let mut machine = running_initiator();
        machine.handle(SessionEvent::Received(Message::Settings(settings().to_record())));
        assert!(matches!(machine.state(), SessionState::Aborted(AbortReason::Protocol(_))));
    }

    #[test]
    fn senders_finishing_ends_the_test() {
        let mut machine = running_responder();
        assert_eq!(
            machine.handle(SessionEvent::StreamsFinished),
            vec![Effect::SendEnd, Effect::StopStreams, Effect::SendResults]
        );
    }

    #[test]
    fn heartbeats_never_change_state() {
        let mut machine = running_initiator();
        assert_eq!(machine.handle(SessionEvent::Received(Message::Heartbeat)), vec![]);
        assert_eq!(machine.state(), &SessionState::Running);
    }

    #[test]
    fn every_non_terminal_state_can_abort() {
        let builders: Vec<fn() -> ControlMachine> = vec![
            || ControlMachine::initiator(2),
            || {
                let mut m = ControlMachine::initiator(2);
                m.handle(SessionEvent::Begin);
                m
            },
            || {
                let mut m = ControlMachine::initiator(2);
                m.handle(SessionEvent::Begin);
                m.handle(SessionEvent::Received(Message::Accept { stream_ports: vec![1, 2] }));
                m
            },
            running_initiator,
            || {
                let mut m = running_initiator();
                m.handle(SessionEvent::DeadlineReached);
                m
            },
            || ControlMachine::responder(Limits::default()),
            running_responder,
        ];

        let failures = vec![
            (SessionEvent::Cancel, AbortReason::Cancelled),
            (
                SessionEvent::ControlLost("eof".to_string()),
                AbortReason::ControlLost("eof".to_string()),
            ),
            (
                SessionEvent::StreamFailed("reset".to_string()),
                AbortReason::StreamFailed("reset".to_string()),
            ),
            (
                SessionEvent::StreamConnectFailed("timeout".to_string()),
                AbortReason::ConnectFailed("timeout".to_string()),
            ),
            (SessionEvent::LivenessExpired, AbortReason::LivenessExpired),
            (
                SessionEvent::Received(Message::Abort {
                    reason: "bye".to_string(),
                }),
                AbortReason::PeerAborted("bye".to_string()),
            ),
        ];

        for build in &builders {
            for (event, reason) in &failures {
                let mut machine = build();
                let effects = machine.handle(event.clone());
                assert_eq!(machine.state(), &SessionState::Aborted(reason.clone()));
                assert_eq!(effects.last(), Some(&Effect::TearDown));
            }
        }
    }

    #[test]
    fn terminal_states_ignore_everything() {
        let mut machine = running_initiator();
        machine.handle(SessionEvent::Cancel);
        assert_eq!(machine.handle(SessionEvent::Received(Message::Start)), vec![]);
        assert_eq!(machine.handle(SessionEvent::StreamsConnected), vec![]);
        assert_eq!(machine.state(), &SessionState::Aborted(AbortReason::Cancelled));
    }

    #[test]
    fn cancel_notifies_the_peer() {
        let mut machine = running_responder();
        assert_eq!(
            machine.handle(SessionEvent::Cancel),
            vec![Effect::SendAbort("cancelled".to_string()), Effect::TearDown]
        );
        assert!(matches!(Error::from(AbortReason::Cancelled), Error::Cancelled));
    }

    #[test]
    fn undecodable_messages_are_protocol_errors() {
        let mut machine = running_initiator();
        let effects = machine.handle(SessionEvent::Malformed("bad json".to_string()));
        assert_eq!(effects.last(), Some(&Effect::TearDown));
        assert!(matches!(
            Error::from(AbortReason::Protocol("bad json".to_string())),
            Error::Protocol(_)
        ));
        assert_eq!(
            machine.state(),
            &SessionState::Aborted(AbortReason::Protocol("bad json".to_string()))
        );
    }
}
