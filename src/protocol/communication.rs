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

//! Length-prefixed JSON framing for the control connection.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread::sleep;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};

use crate::error::Error;
use crate::protocol::messaging::Message;
use crate::Result;

/// how long to wait between checks of the alive-flag while a read is pending
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// how long to wait for a single control message to be written out
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const BUFFER_FULL_TIMEOUT: Duration = Duration::from_millis(1);

#[cfg(unix)]
pub const KEEPALIVE_DURATION: Duration = Duration::from_secs(5);

/// sends a JSON payload, prefixed by its length as a big-endian u16;
/// the control socket is non-blocking, so a full send-buffer is waited out up to `SEND_TIMEOUT`
pub fn send_message(stream: &mut TcpStream, message: &Message) -> Result<()> {
    let serialised_message = serde_json::to_vec(message)?;
    let length = u16::try_from(serialised_message.len())
        .map_err(|_| Error::Protocol(format!("{} message of {} bytes is too large", message.kind(), serialised_message.len())))?;

    log::debug!(
        "sending {} message of length {} to {}...",
        message.kind(),
        length,
        stream.peer_addr()?
    );
    let mut output_buffer = Vec::with_capacity(serialised_message.len() + 2);
    output_buffer.extend_from_slice(&length.to_be_bytes());
    output_buffer.extend_from_slice(&serialised_message);

    let start = Instant::now();
    let mut written = 0;
    while written < output_buffer.len() {
        match stream.write(&output_buffer[written..]) {
            Ok(0) => return Err(Error::Connect("control connection closed while sending".to_string())),
            Ok(size) => written += size,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if start.elapsed() >= SEND_TIMEOUT {
                    return Err(Error::Connect(format!("timed out sending {} message", message.kind())));
                }
                // nothing to do, but avoid burning CPU cycles
                sleep(BUFFER_FULL_TIMEOUT);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

/// reads bytes into `buffer` until it is full, re-checking `alive_check` every `POLL_TIMEOUT`
fn receive_exact(
    stream: &mut mio::net::TcpStream,
    poll: &mut Poll,
    alive_check: &dyn Fn() -> bool,
    buffer: &mut [u8],
) -> Result<()> {
    let mut events = Events::with_capacity(1);
    let mut bytes_read = 0;

    // data may already be buffered from before registration, so read before polling
    let mut readable = true;
    while alive_check() {
        if readable {
            loop {
                let size = match stream.read(&mut buffer[bytes_read..]) {
                    Ok(size) => size,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(Error::Io(e)),
                };
                if size == 0 {
                    return Err(Error::Connect("control connection closed by peer".to_string()));
                }
                bytes_read += size;
                if bytes_read == buffer.len() {
                    return Ok(());
                }
            }
        }
        poll.poll(&mut events, Some(POLL_TIMEOUT))?;
        readable = !events.is_empty();
    }
    Err(Error::Cancelled)
}

/// receives one length-prefixed JSON message; returns `Error::Cancelled` as soon as
/// `alive_check` reports false while waiting. Leaves the socket in non-blocking mode.
pub fn receive_message(stream: &TcpStream, alive_check: &dyn Fn() -> bool) -> Result<Message> {
    let cloned_stream = stream.try_clone()?;
    cloned_stream.set_nonblocking(true)?;
    let mut mio_stream = mio::net::TcpStream::from_std(cloned_stream);

    let mio_token = Token(0);
    let mut poll = Poll::new()?;
    poll.registry().register(&mut mio_stream, mio_token, Interest::READABLE)?;

    let result = (|| -> Result<Message> {
        let mut length_spec = [0_u8; 2];
        receive_exact(&mut mio_stream, &mut poll, alive_check, &mut length_spec)?;
        let length = u16::from_be_bytes(length_spec);
        log::trace!("received length-spec of {}", length);

        let mut payload = vec![0_u8; length as usize];
        receive_exact(&mut mio_stream, &mut poll, alive_check, &mut payload)?;
        let message: Message = serde_json::from_slice(&payload)
            .map_err(|e| Error::Protocol(format!("malformed control message: {}", e)))?;
        log::debug!("received {} message", message.kind());
        Ok(message)
    })();

    poll.registry().deregister(&mut mio_stream)?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn messages_survive_the_framing() {
        let (mut client, server) = connected_pair();
        send_message(&mut client, &Message::Start).unwrap();
        send_message(&mut client, &Message::Reject { reason: "no".to_string() }).unwrap();

        assert_eq!(receive_message(&server, &|| true).unwrap(), Message::Start);
        assert_eq!(
            receive_message(&server, &|| true).unwrap(),
            Message::Reject { reason: "no".to_string() }
        );
    }

    #[test]
    fn closed_peer_is_a_connect_error() {
        let (client, server) = connected_pair();
        drop(client);
        assert!(matches!(receive_message(&server, &|| true), Err(Error::Connect(_))));
    }

    #[test]
    fn waiting_stops_when_no_longer_alive() {
        let (_client, server) = connected_pair();
        assert!(matches!(receive_message(&server, &|| false), Err(Error::Cancelled)));
    }

    #[test]
    fn garbage_payload_is_a_protocol_error() {
        let (mut client, server) = connected_pair();
        client.write_all(&[0, 3, b'{', b'{', b'{']).unwrap();
        assert!(matches!(receive_message(&server, &|| true), Err(Error::Protocol(_))));
    }
}
