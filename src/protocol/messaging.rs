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

use serde::{Deserialize, Serialize};

use crate::protocol::results::IntervalRecord;

/// the Settings record as it travels over the control channel; tags stay textual so
/// that an unsupported protocol or direction can be rejected with a reason instead of a parse failure
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct SettingsRecord {
    pub protocol: String,
    pub direction: String,
    pub streams: usize,
    pub block_size: u32,
    /// bits per second, per stream
    pub bandwidth: Option<u64>,
    pub duration_ms: Option<u64>,
    pub bytes: Option<u64>,
    pub packets: Option<u64>,
    pub interval_ms: u64,
    pub window: Option<u32>,
    pub no_delay: Option<bool>,
    #[serde(default)]
    pub tos: Option<u8>,
}

/// one stream's cumulative totals, as observed by the side that sends them
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct StreamResult {
    pub stream_idx: usize,
    pub totals: IntervalRecord,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "kind")]
pub enum Message {
    #[serde(rename(deserialize = "cookie", serialize = "cookie"))]
    Cookie { cookie: uuid::Uuid },
    #[serde(rename(deserialize = "settings", serialize = "settings"))]
    Settings(SettingsRecord),
    #[serde(rename(deserialize = "accept", serialize = "accept"))]
    Accept { stream_ports: Vec<u16> },
    #[serde(rename(deserialize = "reject", serialize = "reject"))]
    Reject { reason: String },
    #[serde(rename(deserialize = "connected", serialize = "connected"))]
    Connected,
    #[serde(rename(deserialize = "start", serialize = "start"))]
    Start,
    #[serde(rename(deserialize = "heartbeat", serialize = "heartbeat"))]
    Heartbeat,
    #[serde(rename(deserialize = "end", serialize = "end"))]
    End,
    #[serde(rename(deserialize = "results", serialize = "results"))]
    Results { streams: Vec<StreamResult> },
    #[serde(rename(deserialize = "abort", serialize = "abort"))]
    Abort { reason: String },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Cookie { .. } => "cookie",
            Message::Settings(_) => "settings",
            Message::Accept { .. } => "accept",
            Message::Reject { .. } => "reject",
            Message::Connected => "connected",
            Message::Start => "start",
            Message::Heartbeat => "heartbeat",
            Message::End => "end",
            Message::Results { .. } => "results",
            Message::Abort { .. } => "abort",
        }
    }
}

/// prepares a message used to tell the initiator where to connect its streams
pub fn prepare_accept(stream_ports: &[u16]) -> Message {
    Message::Accept {
        stream_ports: stream_ports.to_vec(),
    }
}

#[test]
fn test_settings_message_is_tagged() {
    let record = SettingsRecord {
        protocol: "udp".to_string(),
        direction: "normal".to_string(),
        streams: 2,
        block_size: 1200,
        bandwidth: Some(1_048_576),
        duration_ms: Some(5000),
        interval_ms: 1000,
        ..SettingsRecord::default()
    };
    let msg = serde_json::to_value(Message::Settings(record.clone())).unwrap();
    assert_eq!(msg["kind"], "settings");
    assert_eq!(msg["protocol"], "udp");
    assert_eq!(msg["streams"], 2);
    assert_eq!(msg["block_size"], 1200);
    assert_eq!(msg["duration_ms"], 5000);
    assert_eq!(msg["bytes"], serde_json::Value::Null);

    let parsed: Message = serde_json::from_value(msg).unwrap();
    assert_eq!(parsed, Message::Settings(record));
}

#[test]
fn test_lifecycle_signals_carry_only_their_kind() {
    assert_eq!(serde_json::to_value(Message::Start).unwrap(), serde_json::json!({"kind": "start"}));
    assert_eq!(serde_json::to_value(Message::End).unwrap(), serde_json::json!({"kind": "end"}));
    let reject: Message = serde_json::from_value(serde_json::json!({"kind": "reject", "reason": "too many streams"})).unwrap();
    assert_eq!(reject.kind(), "reject");
}

#[test]
fn test_unknown_kind_fails_to_parse() {
    assert!(serde_json::from_value::<Message>(serde_json::json!({"kind": "bogus"})).is_err());
}
