// src/cluster/scheduler.rs

//! The pending queue and the fairness/affinity scan.
//!
//! All of this state lives behind one short-section lock in
//! [`super::Shared`]; nothing here performs I/O or awaits.

use crate::core::request::{Request, SessionId};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

/// Lifecycle state of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Idle,
    Busy,
    Lost,
    Reconnecting,
}

/// Bookkeeping for one connection, mutated only under the scheduler lock.
pub(crate) struct ConnMeta {
    pub session: SessionId,
    pub state: ConnState,
    pub in_transaction: bool,
    /// Channel names this connection is subscribed to. Read back on
    /// reconnect for re-subscription.
    pub channels: HashSet<String>,
    /// Wakes the connection task when eligible work may be available.
    pub waker: Arc<Notify>,
}

impl ConnMeta {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            state: ConnState::Connecting,
            in_transaction: false,
            channels: HashSet::new(),
            waker: Arc::new(Notify::new()),
        }
    }
}

pub(crate) struct Scheduler {
    pub queue: VecDeque<Request>,
    pub conns: Vec<ConnMeta>,
    /// Set under this lock by pool disconnect; once true, nothing may be
    /// pushed anymore.
    pub closed: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            conns: Vec::new(),
            closed: false,
        }
    }

    /// Appends a request and wakes every idle connection; the first one to
    /// find it eligible under the lock takes it.
    pub fn push(&mut self, req: Request) {
        self.queue.push_back(req);
        for meta in self.conns.iter().filter(|m| m.state == ConnState::Idle) {
            meta.waker.notify_one();
        }
    }

    /// First-eligible scan for the connection at `index`. Marks the
    /// connection busy when a request is handed out.
    ///
    /// Eligible means: the request is bound to this connection's session, or
    /// it is unaffine and this connection is either outside a transaction or
    /// inside one with none of its own statements waiting in the queue.
    pub fn pull_for(&mut self, index: usize) -> Option<Request> {
        let meta = &self.conns[index];
        if meta.state != ConnState::Idle {
            return None;
        }
        let session = meta.session;
        let tx_statement_waiting = meta.in_transaction
            && self.queue.iter().any(|r| r.affinity == Some(session));
        let pos = self.queue.iter().position(|r| match r.affinity {
            Some(bound) => bound == session,
            None => !tx_statement_waiting,
        })?;
        let req = self.queue.remove(pos)?;
        self.conns[index].state = ConnState::Busy;
        Some(req)
    }

    /// Removes every queued request bound to a session that just died. The
    /// caller resolves them outside the lock.
    pub fn drain_affine(&mut self, session: SessionId) -> Vec<Request> {
        let mut orphaned = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.queue.len());
        for req in self.queue.drain(..) {
            if req.affinity == Some(session) {
                orphaned.push(req);
            } else {
                remaining.push_back(req);
            }
        }
        self.queue = remaining;
        orphaned
    }

    pub fn drain_all(&mut self) -> Vec<Request> {
        self.queue.drain(..).collect()
    }

    /// True when `session` is currently held by a connection able to serve
    /// it. Sessions of lost or reconnecting links count as gone: the
    /// replacement link gets a fresh id, so nothing could ever take a
    /// request bound to the old one.
    pub fn session_live(&self, session: SessionId) -> bool {
        self.conns.iter().any(|m| {
            m.session == session
                && !matches!(m.state, ConnState::Lost | ConnState::Reconnecting)
        })
    }

    /// Union of channel names subscribed anywhere in the pool.
    pub fn channels_anywhere(&self) -> HashSet<String> {
        self.conns
            .iter()
            .flat_map(|m| m.channels.iter().cloned())
            .collect()
    }

    /// An arbitrary live connection's session, preferring idle ones.
    pub fn any_live_session(&self) -> Option<SessionId> {
        self.conns
            .iter()
            .find(|m| m.state == ConnState::Idle)
            .or_else(|| self.conns.iter().find(|m| m.state == ConnState::Busy))
            .map(|m| m.session)
    }
}
