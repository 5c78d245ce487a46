// GelSense HILS - State Hub Task
//
// The only writer of the touch state.  Sessions send commands over one
// channel; the hub applies them strictly in arrival order.  A mutation is
// committed as: publish snapshot, queue ACK to the setter, queue
// STATE_UPDATE to every session, then release the waiting setter.
//
// Session queues are bounded and the hub never blocks on them.  A session
// whose queue is full is evicted and its connection hung up.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, PoisonError, RwLock};

use crate::events::{Point, TouchState};
use crate::protocol::{Role, ServerMessage};

/// Latest committed state, readable without going through the hub.
pub type SharedState = Arc<RwLock<Arc<TouchState>>>;

pub fn shared_state() -> SharedState {
    Arc::new(RwLock::new(Arc::new(TouchState::initial())))
}

pub fn snapshot(shared: &SharedState) -> Arc<TouchState> {
    Arc::clone(&shared.read().unwrap_or_else(PoisonError::into_inner))
}

/// Closes a session's connection when the hub evicts it.
pub type Hangup = Box<dyn FnOnce() + Send>;

pub enum HubCommand {
    /// Register a session.  The hub queues CONNECTED on `outbound` and
    /// answers with the session id on `reply`.
    Join {
        role: Role,
        client_id: Option<String>,
        outbound: SyncSender<ServerMessage>,
        hangup: Hangup,
        reply: Sender<u64>,
    },
    Leave {
        session_id: u64,
    },
    /// Replace the touch position.  `done` receives the new version once
    /// the ACK and broadcast are queued.
    Mutate {
        session_id: u64,
        position: Option<Point>,
        done: Sender<u64>,
    },
    GetState {
        session_id: u64,
    },
}

struct Member {
    role: Role,
    outbound: SyncSender<ServerMessage>,
    hangup: Hangup,
}

type Roster = HashMap<u64, Member>;

pub fn hub_task(commands: Receiver<HubCommand>, shared: SharedState) {
    log::info!("Hub task started");

    let mut state = snapshot(&shared);
    let mut roster = Roster::new();
    let mut next_id: u64 = 1;

    for cmd in commands {
        match cmd {
            HubCommand::Join {
                role,
                client_id,
                outbound,
                hangup,
                reply,
            } => {
                let session_id = next_id;
                next_id += 1;
                roster.insert(
                    session_id,
                    Member {
                        role,
                        outbound,
                        hangup,
                    },
                );
                deliver(
                    &mut roster,
                    session_id,
                    ServerMessage::Connected {
                        session_id,
                        role,
                        state: (*state).clone(),
                    },
                );
                let _ = reply.send(session_id);
                log::info!(
                    "Session {} joined as {} ({}), {} connected",
                    session_id,
                    role,
                    client_id.as_deref().unwrap_or("anonymous"),
                    roster.len()
                );
            }

            HubCommand::Leave { session_id } => {
                if let Some(member) = roster.remove(&session_id) {
                    log::info!(
                        "Session {} ({}) left, {} connected",
                        session_id,
                        member.role,
                        roster.len()
                    );
                }
            }

            HubCommand::Mutate {
                session_id,
                position,
                done,
            } => {
                let next = Arc::new(state.next(position));
                *shared.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);
                state = next;

                let ack = ServerMessage::Ack {
                    version: state.version,
                };
                deliver(&mut roster, session_id, ack);
                broadcast(&mut roster, &state);
                let _ = done.send(state.version);
                log::debug!(
                    "Committed v{} from session {}: {:?}",
                    state.version,
                    session_id,
                    state.position
                );
            }

            HubCommand::GetState { session_id } => {
                let reply = ServerMessage::StateUpdate {
                    state: (*state).clone(),
                    client_count: roster.len(),
                    requested: true,
                };
                deliver(&mut roster, session_id, reply);
            }
        }
    }

    log::info!("Hub task stopped (all senders dropped)");
}

/// Queue `msg` for one session without blocking.
fn deliver(roster: &mut Roster, session_id: u64, msg: ServerMessage) {
    let full = match roster.get(&session_id) {
        Some(member) => matches!(member.outbound.try_send(msg), Err(TrySendError::Full(_))),
        None => false,
    };
    if full {
        evict(roster, session_id);
    }
}

fn broadcast(roster: &mut Roster, state: &TouchState) {
    let msg = ServerMessage::StateUpdate {
        state: state.clone(),
        client_count: roster.len(),
        requested: false,
    };
    // A disconnected queue means the session is on its way out; Leave follows.
    let stalled: Vec<u64> = roster
        .iter()
        .filter(|(_, member)| {
            matches!(
                member.outbound.try_send(msg.clone()),
                Err(TrySendError::Full(_))
            )
        })
        .map(|(id, _)| *id)
        .collect();
    for session_id in stalled {
        evict(roster, session_id);
    }
}

fn evict(roster: &mut Roster, session_id: u64) {
    if let Some(member) = roster.remove(&session_id) {
        log::warn!(
            "Session {} ({}) is not reading, evicted; {} connected",
            session_id,
            member.role,
            roster.len()
        );
        (member.hangup)();
    }
}
