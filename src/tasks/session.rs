// GelSense HILS - Client Session Tasks
//
// One reader and one writer thread per TCP connection.  The reader parses
// requests, enforces the role and talks to the hub; the writer drains the
// session's outbound queue so a slow socket never stalls the hub.  A writer
// blocked longer than the write timeout closes the connection.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::{MAX_LINE_BYTES, SESSION_QUEUE_DEPTH, SESSION_WRITE_TIMEOUT_MS};
use crate::error::Error;
use crate::events::{ChannelPair, Point};
use crate::protocol::{self, ClientMessage, MeasureRequest, Role, ServerMessage};
use crate::simulation::{Noise, SimulationEngine};
use crate::tasks::hub::{self, HubCommand, SharedState};

/// Everything a session needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    pub hub: Sender<HubCommand>,
    pub shared: SharedState,
    pub engine: Arc<SimulationEngine>,
    pub noise: Noise,
    pub pairs: Arc<Vec<ChannelPair>>,
}

pub fn session_task(stream: TcpStream, ctx: SessionContext) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    log::info!("Session opened from {}", peer);

    let (out_tx, out_rx) = mpsc::sync_channel(SESSION_QUEUE_DEPTH);
    let sockets = stream.try_clone().and_then(|writer| {
        writer.set_write_timeout(Some(Duration::from_millis(SESSION_WRITE_TIMEOUT_MS)))?;
        Ok((writer, stream.try_clone()?))
    });
    let (writer_stream, hangup_stream) = match sockets {
        Ok(s) => s,
        Err(e) => {
            log::error!("Cannot clone socket for {}: {}", peer, e);
            return;
        }
    };
    let writer = thread::Builder::new()
        .name(format!("tx-{peer}"))
        .spawn(move || writer_task(writer_stream, out_rx));
    if let Err(e) = writer {
        log::error!("Cannot spawn writer for {}: {}", peer, e);
        return;
    }

    let mut membership = Membership {
        hub: &ctx.hub,
        session_id: None,
    };
    let hangup: hub::Hangup = Box::new(move || {
        let _ = hangup_stream.shutdown(Shutdown::Both);
    });
    reader_loop(&stream, &ctx, &out_tx, &mut membership, hangup);
    // The writer finishes once this sender and the hub's clone are gone.
    drop(membership);
    drop(out_tx);
    log::info!("Session from {} closed", peer);
}

/// Sends `Leave` when the reader is done with the session, even if it
/// unwinds.
struct Membership<'a> {
    hub: &'a Sender<HubCommand>,
    session_id: Option<u64>,
}

impl Drop for Membership<'_> {
    fn drop(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            let _ = self.hub.send(HubCommand::Leave { session_id });
        }
    }
}

enum Frame {
    Line(Vec<u8>),
    /// Longer than `MAX_LINE_BYTES`; the rest of the line was skipped.
    Oversized,
    Closed,
}

fn read_frame<R: BufRead>(reader: &mut R) -> io::Result<Frame> {
    let mut buf = Vec::new();
    let limit = MAX_LINE_BYTES as u64 + 1;
    if reader.by_ref().take(limit).read_until(b'\n', &mut buf)? == 0 {
        return Ok(Frame::Closed);
    }
    if buf.last() == Some(&b'\n') || buf.len() <= MAX_LINE_BYTES {
        return Ok(Frame::Line(buf));
    }
    loop {
        let chunk = reader.fill_buf()?;
        if chunk.is_empty() {
            return Ok(Frame::Oversized);
        }
        match chunk.iter().position(|b| *b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(Frame::Oversized);
            }
            None => {
                let len = chunk.len();
                reader.consume(len);
            }
        }
    }
}

fn reader_loop(
    stream: &TcpStream,
    ctx: &SessionContext,
    out: &SyncSender<ServerMessage>,
    membership: &mut Membership<'_>,
    hangup: hub::Hangup,
) {
    let mut joined: Option<(u64, Role)> = None;
    let mut hangup = Some(hangup);
    let mut reader = BufReader::new(stream);

    loop {
        let bytes = match read_frame(&mut reader) {
            Ok(Frame::Line(bytes)) => bytes,
            Ok(Frame::Oversized) => {
                let e = Error::Protocol(format!("line exceeds {MAX_LINE_BYTES} bytes"));
                log::warn!("Rejected line: {}", e);
                let _ = out.send(ServerMessage::error(&e));
                continue;
            }
            Ok(Frame::Closed) => break,
            Err(e) => {
                log::debug!("Read ended: {}", e);
                break;
            }
        };
        let line = match String::from_utf8(bytes) {
            Ok(l) => l,
            Err(_) => {
                let e = Error::Protocol("line is not valid UTF-8".into());
                log::warn!("Rejected line: {}", e);
                let _ = out.send(ServerMessage::error(&e));
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let msg = match protocol::decode::<ClientMessage>(&line) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Rejected line: {}", e);
                let _ = out.send(ServerMessage::error(&e));
                continue;
            }
        };

        match (joined, msg) {
            (None, ClientMessage::Connect { role, client_id }) => {
                let Some(hangup) = hangup.take() else {
                    break;
                };
                let (reply_tx, reply_rx) = mpsc::channel();
                let join = HubCommand::Join {
                    role,
                    client_id,
                    outbound: out.clone(),
                    hangup,
                    reply: reply_tx,
                };
                if ctx.hub.send(join).is_err() {
                    break;
                }
                match reply_rx.recv() {
                    Ok(id) => {
                        membership.session_id = Some(id);
                        joined = Some((id, role));
                    }
                    Err(_) => break,
                }
                continue;
            }
            (None, other) => {
                let e = Error::Protocol(format!("{} before CONNECT", other.name()));
                let _ = out.send(ServerMessage::error(&e));
                continue;
            }
            (Some(_), ClientMessage::Connect { .. }) => {
                let e = Error::Protocol("session already connected".into());
                let _ = out.send(ServerMessage::error(&e));
                continue;
            }
            (Some((id, role)), msg) if !msg.permitted_for(role) => {
                let e = Error::Protocol(format!("{} not permitted for {role}", msg.name()));
                log::warn!("Session {}: {}", id, e);
                let _ = out.send(ServerMessage::error(&e));
            }
            (Some((id, _)), msg) => {
                if !handle(id, msg, ctx, out) {
                    break;
                }
            }
        }
    }
}

/// Returns `false` once the hub is gone.
fn handle(
    session_id: u64,
    msg: ClientMessage,
    ctx: &SessionContext,
    out: &SyncSender<ServerMessage>,
) -> bool {
    match msg {
        ClientMessage::SetTouch { x, y } => {
            let p = Point::new(x, y);
            if !p.is_finite() {
                let e = Error::Validation(format!("touch ({x}, {y}) is not finite"));
                let _ = out.send(ServerMessage::error(&e));
                return true;
            }
            mutate(session_id, Some(p), ctx)
        }
        ClientMessage::ClearTouch => mutate(session_id, None, ctx),
        ClientMessage::GetState => ctx.hub.send(HubCommand::GetState { session_id }).is_ok(),
        ClientMessage::Measure(req) => {
            let _ = out.send(measure(req, ctx));
            true
        }
        ClientMessage::Connect { .. } => true,
    }
}

/// Blocks until the hub has committed, so the next request on this
/// session observes the write.
fn mutate(session_id: u64, position: Option<Point>, ctx: &SessionContext) -> bool {
    let (done_tx, done_rx) = mpsc::channel();
    let cmd = HubCommand::Mutate {
        session_id,
        position,
        done: done_tx,
    };
    ctx.hub.send(cmd).is_ok() && done_rx.recv().is_ok()
}

fn measure(req: MeasureRequest, ctx: &SessionContext) -> ServerMessage {
    let state = hub::snapshot(&ctx.shared);
    let pairs = req.pairs.as_deref().unwrap_or(ctx.pairs.as_slice());
    match ctx.engine.simulate(state.position, pairs, &req.mode, ctx.noise) {
        Ok(vector) => ServerMessage::Measurement {
            request_id: req.request_id,
            state: (*state).clone(),
            vector,
        },
        Err(e) => {
            log::warn!("Measurement {:?} failed: {}", req.request_id, e);
            ServerMessage::error_for(&e, req.request_id)
        }
    }
}

pub fn writer_task(mut stream: TcpStream, outbound: Receiver<ServerMessage>) {
    for msg in outbound {
        let line = match protocol::encode_line(&msg) {
            Ok(l) => l,
            Err(e) => {
                log::error!("Dropping unencodable message: {}", e);
                continue;
            }
        };
        if let Err(e) = stream.write_all(line.as_bytes()) {
            log::warn!("Write failed, closing session: {}", e);
            break;
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}
