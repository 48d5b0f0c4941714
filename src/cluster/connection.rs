// src/cluster/connection.rs

//! Drives one physical connection: the dispatch loop, loss detection, and
//! the reconnect/re-subscribe cycle.
//!
//! Each connection is owned by exactly one tokio task running
//! [`ConnDriver::run`], which serializes all access to the underlying wire
//! stream. Lifecycle: `Idle ⇄ Busy → (Idle | Lost) → Reconnecting → Idle`.

use super::scheduler::ConnState;
use super::{ReconnectReport, Shared};
use crate::core::cache::cache_key;
use crate::core::request::Request;
use crate::core::result::QueryResult;
use crate::core::PoolError;
use crate::wire::{WireMessage, WireStream};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

/// Why the driver left its normal cycle.
enum Exit {
    Shutdown,
    Lost,
}

pub(crate) struct ConnDriver {
    index: usize,
    shared: Arc<Shared>,
    stream: Box<dyn WireStream>,
    shutdown: broadcast::Receiver<()>,
    waker: Arc<Notify>,
}

impl ConnDriver {
    pub fn new(
        index: usize,
        shared: Arc<Shared>,
        stream: Box<dyn WireStream>,
        shutdown: broadcast::Receiver<()>,
        waker: Arc<Notify>,
    ) -> Self {
        Self {
            index,
            shared,
            stream,
            shutdown,
            waker,
        }
    }

    /// The driver's main loop: pull eligible work, execute it, park on
    /// inbound pushes otherwise.
    pub async fn run(mut self) {
        loop {
            // Completing a request falls straight back here, so the next
            // eligible request is pulled without idling in between.
            if let Some(req) = self.shared.pull_for(self.index) {
                match self.execute(req).await {
                    Ok(()) => {
                        self.shared.set_state(self.index, ConnState::Idle);
                        continue;
                    }
                    Err(Exit::Shutdown) => break,
                    Err(Exit::Lost) => {
                        if matches!(self.reconnect().await, Err(Exit::Shutdown)) {
                            break;
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                _ = self.waker.notified() => {}
                msg = self.stream.recv() => match msg {
                    Ok(WireMessage::Notification { channel, payload, pid }) => {
                        self.shared.deliver(&channel, &payload, pid);
                    }
                    Ok(other) => {
                        warn!(
                            "Session {}: unexpected message while idle: {:?}",
                            self.shared.session_of(self.index),
                            other
                        );
                    }
                    Err(_) => {
                        self.on_lost();
                        if matches!(self.reconnect().await, Err(Exit::Shutdown)) {
                            break;
                        }
                    }
                },
            }
        }
        let _ = self.stream.shutdown().await;
        debug!("Connection driver {} stopped.", self.index);
    }

    /// Writes the query text and accumulates results until the server signals
    /// the end of the query, then resolves the request's future.
    async fn execute(&mut self, mut req: Request) -> Result<(), Exit> {
        let session = self.shared.session_of(self.index);
        if let Some(log) = &self.shared.hooks.query_log {
            log(&req.text);
        }
        debug!("Session {}: dispatching: {}", session, req.text);

        if self.stream.send(&req.text).await.is_err() {
            req.resolve(Err(PoolError::ConnectionLost));
            self.on_lost();
            return Err(Exit::Lost);
        }
        self.shared.stats.record_dispatch();

        let mut batches = Vec::new();
        let mut server_error: Option<PoolError> = None;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => {
                    req.resolve(Err(PoolError::Cancelled));
                    return Err(Exit::Shutdown);
                }
                msg = self.stream.recv() => match msg {
                    Ok(WireMessage::Batch(batch)) => {
                        if let Some(chunk) = req.chunk.as_mut() {
                            chunk(batch);
                        } else {
                            batches.push(batch);
                        }
                    }
                    Ok(WireMessage::Ready) => break,
                    Ok(WireMessage::ServerError { code, message }) => {
                        server_error = Some(PoolError::Query { code, message });
                        break;
                    }
                    Ok(WireMessage::Notification { channel, payload, pid }) => {
                        self.shared.deliver(&channel, &payload, pid);
                    }
                    Err(_) => {
                        req.resolve(Err(PoolError::ConnectionLost));
                        self.on_lost();
                        return Err(Exit::Lost);
                    }
                },
            }
        }

        match server_error {
            Some(e) => {
                self.shared.apply_kind(self.index, &req.kind, false);
                self.shared.stats.record_failure();
                debug!("Session {}: query failed: {} ({:?})", session, e, req.created.elapsed());
                req.resolve(Err(e));
            }
            None => {
                self.shared.apply_kind(self.index, &req.kind, true);
                let result = QueryResult { batches };
                if req.chunk.is_none()
                    && let (Some(key), Some(ttl)) = (
                        cache_key(&req.text, req.ttl),
                        self.shared.options.ttl_for(req.ttl),
                    )
                {
                    self.shared.cache.insert(key, ttl, result.clone());
                }
                debug!(
                    "Session {}: query completed in {:?}",
                    session,
                    req.created.elapsed()
                );
                req.resolve(Ok((session, result)));
            }
        }
        Ok(())
    }

    /// Marks this connection lost. The in-flight request (if any) has already
    /// been resolved by the caller; queued statements bound to the dead
    /// session are failed here since no connection can ever take them.
    fn on_lost(&self) {
        let (session, orphaned) = {
            let mut sched = self.shared.sched.lock();
            let meta = &mut sched.conns[self.index];
            meta.state = ConnState::Lost;
            meta.in_transaction = false;
            let session = meta.session;
            (session, sched.drain_affine(session))
        };
        warn!(
            "Session {} lost; failing {} queued statements bound to it.",
            session,
            orphaned.len()
        );
        for req in orphaned {
            req.resolve(Err(PoolError::ConnectionLost));
        }
    }

    /// Repeats the connect handshake until it succeeds, with exponential
    /// backoff and jitter, then re-subscribes the previously held channels.
    async fn reconnect(&mut self) -> Result<(), Exit> {
        self.shared.set_state(self.index, ConnState::Reconnecting);
        let options = self.shared.options.clone();
        let mut delay = options.reconnect_initial;

        loop {
            let jittered = delay.mul_f64(rand::thread_rng().gen_range(0.9..1.1));
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => return Err(Exit::Shutdown),
                _ = tokio::time::sleep(jittered) => {}
            }

            let attempt = tokio::time::timeout(
                options.connect_timeout,
                self.shared.connector.connect(&options),
            );
            match attempt.await {
                Ok(Ok(stream)) => {
                    self.stream = stream;
                    // Fresh physical link, fresh session identity: stale
                    // affinity tokens must fail instead of landing here.
                    let session = self.shared.assign_session(self.index);
                    match self.resubscribe(session).await {
                        Ok(report) => {
                            self.shared.set_state(self.index, ConnState::Idle);
                            self.shared.stats.record_reconnect();
                            info!("Session {} re-established (connection {}).", session, self.index);
                            if let Some(hook) = &self.shared.hooks.on_reconnect {
                                hook(&report);
                            }
                            return Ok(());
                        }
                        Err(Exit::Shutdown) => return Err(Exit::Shutdown),
                        Err(Exit::Lost) => {
                            warn!("Connection {} dropped during re-subscription.", self.index);
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!("Reconnect attempt for connection {} failed: {}", self.index, e);
                }
                Err(_) => {
                    warn!("Reconnect attempt for connection {} timed out.", self.index);
                }
            }
            delay = (delay * 2).min(options.reconnect_max);
        }
    }

    /// Replays channel subscriptions on a fresh link. Each channel is first
    /// offered to the user's resubscribe hook, which may decline (e.g. to
    /// re-fetch missed state before listening again). Failures are collected
    /// into the reconnect report, never treated as fatal.
    async fn resubscribe(&mut self, session: u64) -> Result<ReconnectReport, Exit> {
        let mut channels: Vec<String> = {
            let sched = self.shared.sched.lock();
            sched.conns[self.index].channels.iter().cloned().collect()
        };
        channels.sort();

        let mut report = ReconnectReport {
            session,
            resubscribed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        };

        for channel in channels {
            let keep = self
                .shared
                .hooks
                .resubscribe
                .as_ref()
                .is_none_or(|decide| decide(&channel));
            if !keep {
                self.drop_channel(&channel);
                report.skipped.push(channel);
                continue;
            }
            match self.issue_listen(&channel).await? {
                Ok(()) => report.resubscribed.push(channel),
                Err(e) => {
                    self.drop_channel(&channel);
                    report.failed.push((channel, e));
                }
            }
        }
        Ok(report)
    }

    /// Sends one LISTEN statement outside the request queue (the connection
    /// is still `Reconnecting` and invisible to the scheduler). The inner
    /// result carries a server-side rejection of the subscription.
    async fn issue_listen(&mut self, channel: &str) -> Result<Result<(), PoolError>, Exit> {
        let text = format!("LISTEN {channel}");
        if self.stream.send(&text).await.is_err() {
            self.on_lost();
            return Err(Exit::Lost);
        }
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => return Err(Exit::Shutdown),
                msg = self.stream.recv() => match msg {
                    Ok(WireMessage::Ready) => return Ok(Ok(())),
                    Ok(WireMessage::ServerError { code, message }) => {
                        warn!("Re-subscribing '{}' failed: {} {}", channel, code, message);
                        return Ok(Err(PoolError::Query { code, message }));
                    }
                    Ok(WireMessage::Batch(_)) => {}
                    Ok(WireMessage::Notification { channel, payload, pid }) => {
                        self.shared.deliver(&channel, &payload, pid);
                    }
                    Err(_) => {
                        self.on_lost();
                        return Err(Exit::Lost);
                    }
                },
            }
        }
    }

    fn drop_channel(&self, channel: &str) {
        let mut sched = self.shared.sched.lock();
        sched.conns[self.index].channels.remove(channel);
    }
}
