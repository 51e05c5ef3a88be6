//! # Session Registry
//!
//! Maps every live connection to exactly one [`ClientSession`]. Each session
//! holds at most one pending `(meta, frame)` pair: a newer frame replaces
//! the buffered one instead of queueing behind it.
//!
//! The registry is owned by the relay controller and mutated only from its
//! loop, so it carries no locks. Sessions are kept in a `BTreeMap` keyed by
//! the monotonically increasing id, which gives the scheduler a stable scan
//! order equal to connection order.

use std::collections::BTreeMap;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::events::ServerEvent;

/// Opaque connection identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(SessionId)
    }
}

// Serialized as a string so the browser and the worker treat it as opaque.
impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Client-declared properties of the next binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
}

/// What happened to a binary frame handed to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Buffered,
    /// An older, not yet submitted frame was overwritten.
    Replaced,
    /// No `frame_meta` preceded the frame; it was dropped.
    NoMeta,
    UnknownSession,
}

pub struct ClientSession {
    id: SessionId,
    pending_meta: Option<FrameMeta>,
    pending_frame: Option<Bytes>,
    outbound: mpsc::Sender<ServerEvent>,
}

impl ClientSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_ready(&self) -> bool {
        self.pending_meta.is_some() && self.pending_frame.is_some()
    }

    /// Removes the pending pair, but only when both halves are present.
    pub fn take_pending(&mut self) -> Option<(FrameMeta, Bytes)> {
        if !self.is_ready() {
            return None;
        }
        self.pending_meta.take().zip(self.pending_frame.take())
    }

    /// Best-effort delivery. Returns `false` when the event was dropped
    /// because the connection's queue is full or already closed.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.outbound.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::debug!("Outbound queue full for session {}, dropping event", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Outbound queue closed for session {}, dropping event", self.id);
                false
            }
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    last_id: u64,
    sessions: BTreeMap<SessionId, ClientSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, outbound: mpsc::Sender<ServerEvent>) -> SessionId {
        self.last_id += 1;
        let id = SessionId(self.last_id);
        self.sessions.insert(
            id,
            ClientSession {
                id,
                pending_meta: None,
                pending_frame: None,
                outbound,
            },
        );
        id
    }

    /// Stores the meta for the next binary frame. Returns `false` for an
    /// unknown session.
    pub fn set_pending_meta(&mut self, id: SessionId, meta: FrameMeta) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.pending_meta = Some(meta);
                true
            }
            None => false,
        }
    }

    pub fn set_pending_frame(&mut self, id: SessionId, frame: Bytes) -> FrameOutcome {
        let Some(session) = self.sessions.get_mut(&id) else {
            return FrameOutcome::UnknownSession;
        };
        if session.pending_meta.is_none() {
            return FrameOutcome::NoMeta;
        }
        match session.pending_frame.replace(frame) {
            Some(_) => FrameOutcome::Replaced,
            None => FrameOutcome::Buffered,
        }
    }

    /// Puts a pair back after a submission was refused, unless the client
    /// already delivered something newer.
    pub fn restore_pending(&mut self, id: SessionId, meta: FrameMeta, frame: Bytes) {
        if let Some(session) = self.sessions.get_mut(&id) {
            if session.pending_frame.is_none() {
                session.pending_meta = session.pending_meta.or(Some(meta));
                session.pending_frame = Some(frame);
            }
        }
    }

    /// Drops the session together with any pending frame and meta.
    pub fn unregister(&mut self, id: SessionId) -> Option<ClientSession> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    /// Sessions in registration order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
