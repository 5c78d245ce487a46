// GelSense HILS - Sync Server Client
//
// Blocking line-JSON client for the HILS server.  Requests are strictly
// one-at-a-time; broadcasts that arrive while waiting for a reply only
// refresh the cached state.  The server answers every request exactly once
// and in order, so replies to requests that timed out are counted and
// skipped when they finally arrive.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::drivers::ImpedanceSource;
use crate::error::{Error, Result};
use crate::events::{ChannelPair, ImpedanceVector, TouchState};
use crate::protocol::{self, ClientMessage, MeasureRequest, Role, ServerMessage};
use crate::simulation::MeasureMode;

pub struct HilsClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    pending: Vec<u8>,
    session_id: u64,
    role: Role,
    latest: TouchState,
    client_count: usize,
    timeout: Duration,
    next_request: u64,
    /// Replies still owed for requests that timed out.
    unanswered: u64,
}

impl HilsClient {
    /// Connect and complete the handshake within `timeout`.
    pub fn connect(
        addr: &str,
        role: Role,
        client_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let sock = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Validation(format!("{addr} does not resolve")))?;
        let stream = TcpStream::connect_timeout(&sock, timeout)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;

        let mut client = Self {
            reader: BufReader::new(stream),
            writer,
            pending: Vec::new(),
            session_id: 0,
            role,
            latest: TouchState::initial(),
            client_count: 0,
            timeout,
            next_request: 0,
            unanswered: 0,
        };
        client.send(&ClientMessage::Connect { role, client_id })?;
        let (session_id, state) = client.await_reply(|msg| match msg {
            ServerMessage::Connected {
                session_id, state, ..
            } => Some((session_id, state)),
            _ => None,
        })?;
        client.session_id = session_id;
        client.latest = state;
        log::info!("Connected to HILS server {addr} as {role} (session {session_id})");
        Ok(client)
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Most recent state seen in any reply or broadcast.
    pub fn latest_state(&self) -> &TouchState {
        &self.latest
    }

    pub fn client_count(&self) -> usize {
        self.client_count
    }

    /// Returns the committed version.
    pub fn set_touch(&mut self, x: f64, y: f64) -> Result<u64> {
        self.send(&ClientMessage::SetTouch { x, y })?;
        self.await_ack()
    }

    pub fn clear_touch(&mut self) -> Result<u64> {
        self.send(&ClientMessage::ClearTouch)?;
        self.await_ack()
    }

    pub fn get_state(&mut self) -> Result<TouchState> {
        self.send(&ClientMessage::GetState)?;
        self.await_reply(|msg| match msg {
            ServerMessage::StateUpdate {
                state,
                requested: true,
                ..
            } => Some(state),
            _ => None,
        })
    }

    /// Measure against the server's latest state.  `pairs = None` uses the
    /// server's configured pair list.
    pub fn measure_pairs(
        &mut self,
        pairs: Option<&[ChannelPair]>,
        mode: &MeasureMode,
    ) -> Result<(TouchState, ImpedanceVector)> {
        self.next_request += 1;
        let request_id = format!("{}-{}", self.session_id, self.next_request);
        self.send(&ClientMessage::Measure(MeasureRequest {
            request_id: Some(request_id.clone()),
            pairs: pairs.map(<[ChannelPair]>::to_vec),
            mode: *mode,
        }))?;
        self.await_reply(|msg| match msg {
            ServerMessage::Measurement {
                request_id: Some(id),
                state,
                vector,
            } if id == request_id => Some((state, vector)),
            ServerMessage::Measurement { request_id, .. } => {
                log::debug!("Discarding stale measurement {:?}", request_id);
                None
            }
            _ => None,
        })
    }

    /// Block until the next message arrives and return it.
    pub fn next_message(&mut self) -> Result<ServerMessage> {
        self.recv(Instant::now() + self.timeout)
    }

    fn await_ack(&mut self) -> Result<u64> {
        self.await_reply(|msg| match msg {
            ServerMessage::Ack { version } => Some(version),
            _ => None,
        })
    }

    fn await_reply<T>(&mut self, mut pick: impl FnMut(ServerMessage) -> Option<T>) -> Result<T> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let msg = match self.recv(deadline) {
                Ok(msg) => msg,
                Err(e @ Error::TransientIo(_)) => {
                    self.unanswered += 1;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            if self.unanswered > 0 && !msg.is_broadcast() {
                self.unanswered -= 1;
                log::debug!("Discarding late reply: {:?}", msg);
                continue;
            }
            match msg {
                ServerMessage::Error { kind, message, .. } => {
                    return Err(Error::from_wire(&kind, message));
                }
                msg => {
                    if let Some(value) = pick(msg) {
                        return Ok(value);
                    }
                }
            }
        }
    }

    fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let line = protocol::encode_line(msg)?;
        self.writer.write_all(line.as_bytes())?;
        Ok(())
    }

    fn recv(&mut self, deadline: Instant) -> Result<ServerMessage> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::TransientIo("timed out waiting for server".into()));
        }
        self.reader.get_ref().set_read_timeout(Some(remaining))?;

        // A timeout may leave half a line in `pending`; the next call resumes it.
        self.reader.read_until(b'\n', &mut self.pending)?;
        if self.pending.last() != Some(&b'\n') {
            self.pending.clear();
            return Err(Error::TransientIo("server closed the connection".into()));
        }
        let line = std::mem::take(&mut self.pending);
        let text = String::from_utf8(line)
            .map_err(|_| Error::Protocol("server sent non-UTF-8 data".into()))?;
        let msg: ServerMessage = protocol::decode(&text)?;
        self.observe(&msg);
        Ok(msg)
    }

    fn observe(&mut self, msg: &ServerMessage) {
        let state = match msg {
            ServerMessage::Connected { state, .. } | ServerMessage::Measurement { state, .. } => {
                state
            }
            ServerMessage::StateUpdate {
                state,
                client_count,
                ..
            } => {
                self.client_count = *client_count;
                state
            }
            _ => return,
        };
        if state.version >= self.latest.version {
            self.latest = state.clone();
        }
    }
}

impl ImpedanceSource for HilsClient {
    fn measure(&mut self, pairs: &[ChannelPair], mode: &MeasureMode) -> Result<ImpedanceVector> {
        let (state, vector) = self.measure_pairs(Some(pairs), mode)?;
        log::debug!("Measured against state v{} ({:?})", state.version, state.position);
        Ok(vector)
    }

    fn describe(&self) -> String {
        format!(
            "HILS server {} (session {})",
            self.writer
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into()),
            self.session_id
        )
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    /// Scripted server: answers CONNECT, then holds the reply to the first
    /// SET_TOUCH until the second one arrives.
    fn slow_server() -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut lines = BufReader::new(stream).lines();
            let mut reply = |msg: ServerMessage| {
                writer
                    .write_all(protocol::encode_line(&msg).unwrap().as_bytes())
                    .unwrap();
            };

            lines.next().unwrap().unwrap();
            reply(ServerMessage::Connected {
                session_id: 1,
                role: Role::Setter,
                state: TouchState::initial(),
            });
            lines.next().unwrap().unwrap();
            lines.next().unwrap().unwrap();
            reply(ServerMessage::Ack { version: 1 });
            reply(ServerMessage::Ack { version: 2 });
            // Keep the socket open until the client hangs up.
            for _ in lines {}
        });
        (addr, handle)
    }

    #[test]
    fn late_reply_is_not_taken_for_the_next_request() {
        let (addr, server) = slow_server();
        let mut client =
            HilsClient::connect(&addr, Role::Setter, None, Duration::from_millis(200)).unwrap();

        let err = client.set_touch(1.0, 1.0).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(client.set_touch(2.0, 2.0).unwrap(), 2);

        drop(client);
        server.join().unwrap();
    }
}
