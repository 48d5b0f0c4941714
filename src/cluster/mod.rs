// src/cluster/mod.rs

//! The connection-pool engine: owns the physical connections, the pending
//! queue, the result cache, and the notification fan-out.

mod connection;
mod notifications;
mod scheduler;

pub use notifications::NotificationHook;
pub use scheduler::ConnState;

use crate::config::ConnectOptions;
use crate::core::cache::{cache_key, ResultCache};
use crate::core::request::{Reply, Request, RequestKind, SessionId, TtlClass};
use crate::core::result::{Batch, QueryResult};
use crate::core::templates::TemplateStore;
use crate::core::PoolError;
use crate::wire::Connector;
use bytes::Bytes;
use connection::ConnDriver;
use futures::future;
use notifications::NotificationHub;
use parking_lot::Mutex;
use scheduler::{ConnMeta, Scheduler};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use strum_macros::Display;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinSet;
use tracing::info;

/// Standard transaction isolation levels, rendered into the BEGIN statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum IsolationLevel {
    #[strum(serialize = "READ UNCOMMITTED")]
    ReadUncommitted,
    #[strum(serialize = "READ COMMITTED")]
    ReadCommitted,
    #[strum(serialize = "REPEATABLE READ")]
    RepeatableRead,
    #[strum(serialize = "SERIALIZABLE")]
    Serializable,
}

/// Outcome of one completed reconnect, handed to the `on_reconnect` hook.
/// Re-subscription failures surface here, never as a fatal pool error.
#[derive(Debug, Clone, Default)]
pub struct ReconnectReport {
    /// The fresh session id of the re-established link.
    pub session: SessionId,
    pub resubscribed: Vec<String>,
    /// Channels the user's resubscribe hook declined.
    pub skipped: Vec<String>,
    pub failed: Vec<(String, PoolError)>,
}

/// Optional user hooks, fixed at pool construction.
#[derive(Default)]
pub struct ClusterHooks {
    /// Invoked with the final query text immediately before dispatch.
    pub query_log: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// Per-channel decision on whether to re-subscribe after a reconnect.
    /// Absent means re-subscribe everything. Declining lets the caller
    /// re-fetch state missed during the outage before listening again.
    pub resubscribe: Option<Box<dyn Fn(&str) -> bool + Send + Sync>>,
    /// Invoked once per completed reconnect.
    pub on_reconnect: Option<Box<dyn Fn(&ReconnectReport) + Send + Sync>>,
}

/// Monotonic pool counters.
#[derive(Default)]
pub struct ClusterStats {
    dispatched: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    reconnects: AtomicU64,
    notifications: AtomicU64,
}

impl ClusterStats {
    pub fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_notification(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub dispatched: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub reconnects: u64,
    pub notifications: u64,
}

/// State shared between the pool handle and its connection tasks.
pub(crate) struct Shared {
    pub options: ConnectOptions,
    pub connector: Arc<dyn Connector>,
    pub sched: Mutex<Scheduler>,
    pub cache: ResultCache,
    pub hub: NotificationHub,
    pub hooks: ClusterHooks,
    pub stats: ClusterStats,
    pub shutdown_tx: broadcast::Sender<()>,
    session_counter: AtomicU64,
    pub templates: Option<Arc<dyn TemplateStore>>,
    pub closed: AtomicBool,
}

impl Shared {
    pub fn pull_for(&self, index: usize) -> Option<Request> {
        self.sched.lock().pull_for(index)
    }

    pub fn set_state(&self, index: usize, state: ConnState) {
        self.sched.lock().conns[index].state = state;
    }

    pub fn session_of(&self, index: usize) -> SessionId {
        self.sched.lock().conns[index].session
    }

    /// Issues a fresh session id to a re-established link. Requests bound to
    /// the old session that slipped into the queue during the outage window
    /// are drained here; nothing could ever take them once the id changes.
    pub fn assign_session(&self, index: usize) -> SessionId {
        let session = self.next_session();
        let orphaned = {
            let mut sched = self.sched.lock();
            let old = sched.conns[index].session;
            sched.conns[index].session = session;
            sched.drain_affine(old)
        };
        for req in orphaned {
            req.resolve(Err(PoolError::ConnectionLost));
        }
        session
    }

    fn next_session(&self) -> SessionId {
        self.session_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Post-completion bookkeeping on the executing connection.
    pub fn apply_kind(&self, index: usize, kind: &RequestKind, success: bool) {
        let mut sched = self.sched.lock();
        let meta = &mut sched.conns[index];
        match kind {
            RequestKind::Query => {}
            RequestKind::Begin => {
                if success {
                    meta.in_transaction = true;
                }
            }
            // The transaction is over either way once the terminating
            // statement completes.
            RequestKind::Commit | RequestKind::Rollback => meta.in_transaction = false,
            RequestKind::Listen(names) => {
                if success {
                    meta.channels.extend(names.iter().cloned());
                }
            }
            RequestKind::Unlisten(names) => {
                if success {
                    for name in names {
                        meta.channels.remove(name);
                    }
                }
            }
        }
    }

    pub fn deliver(&self, channel: &str, payload: &Bytes, pid: u64) {
        self.hub.deliver(channel, payload, pid);
        self.stats.record_notification();
    }
}

/// The completion future of a submitted query. Resolves without blocking the
/// caller; cache hits resolve on first poll.
pub struct QueryHandle {
    inner: HandleInner,
}

enum HandleInner {
    Ready(Option<Result<QueryResult, PoolError>>),
    Pending(oneshot::Receiver<Reply>),
}

impl QueryHandle {
    fn ready(result: Result<QueryResult, PoolError>) -> Self {
        Self {
            inner: HandleInner::Ready(Some(result)),
        }
    }

    fn pending(rx: oneshot::Receiver<Reply>) -> Self {
        Self {
            inner: HandleInner::Pending(rx),
        }
    }
}

impl Future for QueryHandle {
    type Output = Result<QueryResult, PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            HandleInner::Ready(slot) => match slot.take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            },
            HandleInner::Pending(rx) => Pin::new(rx).poll(cx).map(|recv| match recv {
                Ok(Ok((_, result))) => Ok(result),
                Ok(Err(e)) => Err(e),
                // A dropped sender means the pool tore down mid-flight.
                Err(_) => Err(PoolError::Cancelled),
            }),
        }
    }
}

/// The pool engine. All methods take `&self`; the handle is cheap to share.
pub struct Cluster {
    shared: Arc<Shared>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl Cluster {
    /// Establishes `count` physical connections. Each handshake is bounded by
    /// the descriptor's connect timeout; any failure tears the partial pool
    /// down and fails the whole call.
    pub async fn connect(
        options: ConnectOptions,
        count: usize,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, PoolError> {
        Self::connect_with(options, count, connector, ClusterHooks::default(), None).await
    }

    pub async fn connect_with(
        options: ConnectOptions,
        count: usize,
        connector: Arc<dyn Connector>,
        hooks: ClusterHooks,
        templates: Option<Arc<dyn TemplateStore>>,
    ) -> Result<Self, PoolError> {
        options.validate()?;
        if count == 0 {
            return Err(PoolError::InvalidRequest(
                "connection count must be positive".into(),
            ));
        }

        let handshakes = (0..count).map(|_| {
            let connector = connector.clone();
            let options = options.clone();
            async move {
                tokio::time::timeout(options.connect_timeout, connector.connect(&options))
                    .await
                    .map_err(|_| PoolError::Timeout)?
            }
        });
        // All handshakes progress together; the first failure drops the
        // already-established links.
        let streams = future::try_join_all(handshakes).await?;
        info!(
            "Established {} connections to {}:{}.",
            count, options.host, options.port
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let session_counter = AtomicU64::new(0);
        let mut sched = Scheduler::new();
        for _ in 0..count {
            let session = session_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let mut meta = ConnMeta::new(session);
            // The handshake already finished above; the link is serviceable
            // before its driver task gets its first poll.
            meta.state = ConnState::Idle;
            sched.conns.push(meta);
        }

        let shared = Arc::new(Shared {
            options,
            connector,
            sched: Mutex::new(sched),
            cache: ResultCache::new(),
            hub: NotificationHub::new(),
            hooks,
            stats: ClusterStats::default(),
            shutdown_tx: shutdown_tx.clone(),
            session_counter,
            templates,
            closed: AtomicBool::new(false),
        });

        let mut tasks = JoinSet::new();
        for (index, stream) in streams.into_iter().enumerate() {
            let waker = shared.sched.lock().conns[index].waker.clone();
            let driver = ConnDriver::new(
                index,
                shared.clone(),
                stream,
                shutdown_tx.subscribe(),
                waker,
            );
            tasks.spawn(driver.run());
        }

        Ok(Self {
            shared,
            tasks: tokio::sync::Mutex::new(tasks),
        })
    }

    /// Gracefully tears down all connections. Every outstanding request, in
    /// flight or still queued, resolves with `PoolError::Cancelled`.
    pub async fn disconnect(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disconnecting pool; cancelling outstanding requests.");
        let _ = self.shared.shutdown_tx.send(());
        // Closing and draining under one guard: a submit racing this either
        // lands in `drained` or observes the closed flag, never neither.
        let drained = {
            let mut sched = self.shared.sched.lock();
            sched.closed = true;
            sched.drain_all()
        };
        for req in drained {
            req.resolve(Err(PoolError::Cancelled));
        }
        self.tasks.lock().await.shutdown().await;
        self.shared.cache.clear();
    }

    /// The primary operation: submits query text for asynchronous execution.
    /// Consults the cache for cache-classified queries; never blocks the
    /// caller.
    pub fn query(
        &self,
        text: impl Into<String>,
        ttl: TtlClass,
        affinity: Option<SessionId>,
    ) -> QueryHandle {
        let text = text.into();
        if text.is_empty() {
            return QueryHandle::ready(Err(PoolError::InvalidRequest(
                "query text must not be empty".into(),
            )));
        }
        if let Some(key) = cache_key(&text, ttl) {
            if let Some(hit) = self.shared.cache.get(&key) {
                self.shared.stats.record_cache_hit();
                return QueryHandle::ready(Ok(hit));
            }
            self.shared.stats.record_cache_miss();
        }
        let (req, rx) = Request::new(text, ttl, affinity);
        self.submit(req);
        QueryHandle::pending(rx)
    }

    /// Like [`Cluster::query`], but feeds each result chunk to `chunk` as it
    /// arrives instead of accumulating. Streamed results are never cached.
    pub fn query_streaming(
        &self,
        text: impl Into<String>,
        affinity: Option<SessionId>,
        chunk: impl FnMut(Batch) + Send + 'static,
    ) -> QueryHandle {
        let text = text.into();
        if text.is_empty() {
            return QueryHandle::ready(Err(PoolError::InvalidRequest(
                "query text must not be empty".into(),
            )));
        }
        let (mut req, rx) = Request::new(text, TtlClass::None, affinity);
        req.chunk = Some(Box::new(chunk));
        self.submit(req);
        QueryHandle::pending(rx)
    }

    /// Renders a positional template through the external store and forwards
    /// the constructed text to [`Cluster::query`].
    pub fn emplace_query(
        &self,
        template: &str,
        args: &[String],
        ttl: TtlClass,
        affinity: Option<SessionId>,
    ) -> QueryHandle {
        let Some(store) = &self.shared.templates else {
            return QueryHandle::ready(Err(PoolError::InvalidRequest(
                "no template store configured".into(),
            )));
        };
        match store.render_positional(template, args) {
            Ok(text) => self.query(text, ttl, affinity),
            Err(e) => QueryHandle::ready(Err(e)),
        }
    }

    /// Renders a named, pre-registered template through the external store
    /// and forwards the constructed text to [`Cluster::query`].
    pub fn template_query(
        &self,
        name: &str,
        args: &[(String, String)],
        ttl: TtlClass,
        affinity: Option<SessionId>,
    ) -> QueryHandle {
        let Some(store) = &self.shared.templates else {
            return QueryHandle::ready(Err(PoolError::InvalidRequest(
                "no template store configured".into(),
            )));
        };
        match store.render_named(name, args) {
            Ok(text) => self.query(text, ttl, affinity),
            Err(e) => QueryHandle::ready(Err(e)),
        }
    }

    /// Starts a transaction and returns the affinity token that must
    /// accompany every statement of it, including the terminating
    /// commit/rollback.
    pub async fn begin_transaction(
        &self,
        isolation: IsolationLevel,
    ) -> Result<SessionId, PoolError> {
        let text = format!("BEGIN ISOLATION LEVEL {isolation}");
        let (mut req, rx) = Request::new(text, TtlClass::None, None);
        req.kind = RequestKind::Begin;
        self.submit(req);
        let (session, _) = rx.await.map_err(|_| PoolError::Cancelled)??;
        Ok(session)
    }

    pub async fn commit(&self, token: SessionId) -> Result<(), PoolError> {
        self.finish_transaction(token, RequestKind::Commit, "COMMIT")
            .await
    }

    pub async fn rollback(&self, token: SessionId) -> Result<(), PoolError> {
        self.finish_transaction(token, RequestKind::Rollback, "ROLLBACK")
            .await
    }

    async fn finish_transaction(
        &self,
        token: SessionId,
        kind: RequestKind,
        text: &str,
    ) -> Result<(), PoolError> {
        let (mut req, rx) = Request::new(text.to_string(), TtlClass::None, Some(token));
        req.kind = kind;
        self.submit(req);
        rx.await.map_err(|_| PoolError::Cancelled)??;
        Ok(())
    }

    /// Subscribes to notification channels on one arbitrary live connection,
    /// deduplicating against channels already subscribed anywhere in the
    /// pool. Already-covered channels are a no-op.
    pub async fn listen(&self, channels: &[&str]) -> Result<(), PoolError> {
        let (new_channels, target) = {
            let sched = self.shared.sched.lock();
            let existing = sched.channels_anywhere();
            let mut new_channels: Vec<String> = Vec::new();
            for ch in channels {
                if !existing.contains(*ch) && !new_channels.iter().any(|c| c == ch) {
                    new_channels.push((*ch).to_string());
                }
            }
            let target = sched.any_live_session();
            (new_channels, target)
        };
        if new_channels.is_empty() {
            return Ok(());
        }
        let Some(target) = target else {
            return Err(PoolError::ConnectionLost);
        };
        let text = new_channels
            .iter()
            .map(|c| format!("LISTEN {c}"))
            .collect::<Vec<_>>()
            .join("; ");
        let (mut req, rx) = Request::new(text, TtlClass::None, Some(target));
        req.kind = RequestKind::Listen(new_channels);
        self.submit(req);
        rx.await.map_err(|_| PoolError::Cancelled)??;
        Ok(())
    }

    /// Unsubscribes channels, issuing the command on whichever connection
    /// holds each subscription. Channels not subscribed anywhere are a no-op.
    pub async fn unlisten(&self, channels: &[&str]) -> Result<(), PoolError> {
        let groups: Vec<(SessionId, Vec<String>)> = {
            let sched = self.shared.sched.lock();
            let mut by_session: HashMap<SessionId, Vec<String>> = HashMap::new();
            for ch in channels {
                if let Some(meta) = sched.conns.iter().find(|m| m.channels.contains(*ch)) {
                    by_session
                        .entry(meta.session)
                        .or_default()
                        .push((*ch).to_string());
                }
            }
            by_session.into_iter().collect()
        };

        let mut pending = Vec::new();
        let mut removed = Vec::new();
        for (session, names) in groups {
            let text = names
                .iter()
                .map(|c| format!("UNLISTEN {c}"))
                .collect::<Vec<_>>()
                .join("; ");
            let (mut req, rx) = Request::new(text, TtlClass::None, Some(session));
            removed.extend(names.iter().cloned());
            req.kind = RequestKind::Unlisten(names);
            self.submit(req);
            pending.push(rx);
        }
        for rx in pending {
            rx.await.map_err(|_| PoolError::Cancelled)??;
        }
        // Hooks survive an unlisten that never matched a subscription.
        for ch in removed {
            self.shared.hub.remove(&ch);
        }
        Ok(())
    }

    /// Registers a notification hook for one channel.
    pub fn on_notification(
        &self,
        channel: impl Into<String>,
        hook: impl Fn(&str, &Bytes, u64) + Send + Sync + 'static,
    ) {
        self.shared.hub.on(channel, Box::new(hook));
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Lifecycle states of all connections, in pool order.
    pub fn connection_states(&self) -> Vec<ConnState> {
        self.shared.sched.lock().conns.iter().map(|m| m.state).collect()
    }

    /// Current session ids, in pool order. Session ids change on reconnect.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.shared
            .sched
            .lock()
            .conns
            .iter()
            .map(|m| m.session)
            .collect()
    }

    /// Sorted union of channel names subscribed anywhere in the pool.
    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .shared
            .sched
            .lock()
            .channels_anywhere()
            .into_iter()
            .collect();
        channels.sort();
        channels
    }

    /// Validates affinity and enqueues. The closed check, the session check,
    /// and the push all happen under one scheduler guard so a concurrent
    /// disconnect or session loss cannot slip between them; failures resolve
    /// the future here, before any push.
    fn submit(&self, req: Request) {
        let mut sched = self.shared.sched.lock();
        if sched.closed {
            drop(sched);
            req.resolve(Err(PoolError::Cancelled));
            return;
        }
        if let Some(session) = req.affinity
            && !sched.session_live(session)
        {
            drop(sched);
            req.resolve(Err(PoolError::SessionGone(session)));
            return;
        }
        sched.push(req);
    }
}
