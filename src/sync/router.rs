//! Sync Router
//!
//! Owns the peer registry and every outbound session. Inbound connections,
//! finished sessions and the media service report to it over a command
//! channel; a single router task applies those commands in order, so
//! registry updates and session bookkeeping never race.
//!
//! At most one outbound session runs per target, explicit syncs included.
//! Work requested while one is in flight is merged into a pending scope and
//! started when it finishes.
//!
//! In push mode the router pushes to two kinds of targets: peers that
//! announced themselves on an inbound link, and peers this node opened an
//! announce link to with [`SyncRouter::connect`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::storage::{BlobKey, BlobStore};

use super::protocol::{Message, Purpose};
use super::receiver::{accept_loop, Inbound};
use super::registry::PeerRegistry;
use super::session::{self, PeerStream, SyncSession};
use super::types::{
    ConnectionId, PeerTarget, SyncError, SyncEvent, SyncMode, SyncReport, SyncScope,
};

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 256;

// ============================================================================
// Options
// ============================================================================

/// Router settings
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Name sent in `hello`/`welcome`
    pub name: String,
    pub mode: SyncMode,
    /// Port announced to peers; defaults to the port `listen` bound
    pub advertise_port: Option<u16>,
    /// Connect and per-reply timeout
    pub timeout: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            name: "media-sync".to_string(),
            mode: SyncMode::Manual,
            advertise_port: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl From<&SyncConfig> for RouterOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            name: config.name.clone(),
            mode: config.mode,
            advertise_port: config.advertise_port,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Where an explicit sync waits for its outcome
type Reply = oneshot::Sender<Result<SyncReport, SyncError>>;

/// Inputs to the router task
pub(super) enum RouterCommand {
    /// An inbound announce link opened
    Connected {
        connection: ConnectionId,
        target: PeerTarget,
    },
    /// An inbound announce link closed
    Disconnected { connection: ConnectionId },
    /// This node opened an announce link to `target`
    Linked { target: PeerTarget },
    /// The announce link to `address` is gone
    Unlinked { address: String },
    /// New blobs were written locally
    BlobsStored { keys: Vec<BlobKey> },
    /// Sweep everything to `target` and answer on `reply`
    SyncNow { target: PeerTarget, reply: Reply },
    /// A scheduled session ended
    SessionFinished {
        address: String,
        session: u64,
        outcome: Result<SyncReport, SyncError>,
    },
}

// ============================================================================
// Router Handle
// ============================================================================

/// Sync router handle
#[derive(Clone)]
pub struct SyncRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    options: RouterOptions,
    store: BlobStore,
    registry: Arc<PeerRegistry>,
    commands: mpsc::UnboundedSender<RouterCommand>,
    events: broadcast::Sender<SyncEvent>,
    listen_port: OnceLock<u16>,
    /// Outbound announce links by `host:port`
    links: Mutex<HashMap<String, PeerLink>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for RouterInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl SyncRouter {
    /// Spawn the router task
    pub fn start(options: RouterOptions, store: BlobStore) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(PeerRegistry::new());

        let task = RouterTask {
            options: options.clone(),
            store: store.clone(),
            registry: registry.clone(),
            commands: commands.clone(),
            events: events.clone(),
            outbound: HashMap::new(),
            linked: HashMap::new(),
            next_session: 0,
        };
        let handle = tokio::spawn(task.run(command_rx));

        tracing::info!(name = %options.name, mode = %options.mode, "Sync router started");

        Self {
            inner: Arc::new(RouterInner {
                options,
                store,
                registry,
                commands,
                events,
                listen_port: OnceLock::new(),
                links: Mutex::new(HashMap::new()),
                tasks: Mutex::new(vec![handle]),
            }),
        }
    }

    /// Serve inbound sync connections on `listener`
    pub fn listen(&self, listener: TcpListener) -> std::io::Result<SocketAddr> {
        let addr = listener.local_addr()?;
        let _ = self.inner.listen_port.set(addr.port());

        let inbound = Inbound::new(
            self.inner.options.name.clone(),
            self.inner.store.clone(),
            self.inner.options.timeout,
            self.inner.commands.clone(),
        );
        let handle = tokio::spawn(accept_loop(listener, inbound));
        self.inner.tasks.lock().push(handle);

        tracing::info!(addr = %addr, "Listening for sync peers");
        Ok(addr)
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn mode(&self) -> SyncMode {
        self.inner.options.mode
    }

    /// Port peers should dial back on
    pub fn advertised_port(&self) -> Option<u16> {
        self.inner
            .options
            .advertise_port
            .or_else(|| self.inner.listen_port.get().copied())
    }

    /// Currently connected peers
    pub fn targets(&self) -> Vec<PeerTarget> {
        self.inner.registry.targets()
    }

    /// Subscribe to connection and session events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Tell the router that blobs were written locally
    pub fn blobs_stored(&self, keys: Vec<BlobKey>) {
        if keys.is_empty() {
            return;
        }
        let _ = self.inner.commands.send(RouterCommand::BlobsStored { keys });
    }

    /// Push every local blob to `target` and wait for the result
    ///
    /// Shares the per-target session slot with scheduled pushes: if a session
    /// to `target` is already running, the sweep starts when it finishes.
    pub async fn sync_now(&self, target: PeerTarget) -> Result<SyncReport, SyncError> {
        let (reply, outcome) = oneshot::channel();
        let command = RouterCommand::SyncNow {
            target: target.clone(),
            reply,
        };
        if self.inner.commands.send(command).is_err() {
            return Err(SyncError::Cancelled { peer: target });
        }
        outcome
            .await
            .unwrap_or(Err(SyncError::Cancelled { peer: target }))
    }

    /// Open an announce link to `target`, registering this node with it
    ///
    /// Fails if this node has no port to announce, since the remote would
    /// have no way to dial back. Replaces an existing link to the same
    /// address.
    pub async fn connect(&self, target: PeerTarget) -> Result<(), SyncError> {
        let Some(listen_port) = self.advertised_port() else {
            return Err(SyncError::NotListening { peer: target });
        };

        let hello = Message::Hello {
            name: self.inner.options.name.clone(),
            purpose: Purpose::Announce,
            listen_port: Some(listen_port),
        };
        let (framed, remote_name) =
            session::handshake(&target, hello, self.inner.options.timeout).await?;

        tracing::info!(peer = %target, remote_name = %remote_name, "Announced to peer");

        // Linked goes out before the link task can report the link closed
        let _ = self.inner.commands.send(RouterCommand::Linked {
            target: target.clone(),
        });

        // Held across the spawn so a link that dies at once still finds its entry
        let mut links = self.inner.links.lock();
        let link = PeerLink::spawn(target.clone(), framed, Arc::downgrade(&self.inner));
        links.insert(target.address(), link);
        drop(links);
        Ok(())
    }

    /// Close the announce link to `target`; false if there was none
    pub fn disconnect(&self, target: &PeerTarget) -> bool {
        let address = target.address();
        let removed = self.inner.links.lock().remove(&address);
        if removed.is_none() {
            return false;
        }
        tracing::info!(peer = %target, "Closed announce link");
        let _ = self.inner.commands.send(RouterCommand::Unlinked { address });
        true
    }

    /// Peers this node holds announce links to
    pub fn linked_peers(&self) -> Vec<PeerTarget> {
        let mut peers: Vec<PeerTarget> = self
            .inner
            .links
            .lock()
            .values()
            .map(|link| link.peer.clone())
            .collect();
        peers.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        peers
    }
}

// ============================================================================
// Announce Links
// ============================================================================

/// Outbound announce connection; closing it signals departure
struct PeerLink {
    id: ConnectionId,
    peer: PeerTarget,
    handle: JoinHandle<()>,
}

impl PeerLink {
    /// Watch the link; when the remote closes it, drop it from `router`
    fn spawn(peer: PeerTarget, mut framed: PeerStream, router: Weak<RouterInner>) -> Self {
        let id = ConnectionId::new();
        let link_peer = peer.clone();
        let handle = tokio::spawn(async move {
            while let Some(frame) = framed.next().await {
                if frame.is_err() {
                    break;
                }
            }
            tracing::info!(peer = %link_peer, "Announce link closed by peer");
            if let Some(router) = router.upgrade() {
                router.link_closed(&link_peer.address(), id);
            }
        });
        Self { id, peer, handle }
    }
}

impl RouterInner {
    /// Forget the link to `address` unless it was already replaced
    fn link_closed(&self, address: &str, id: ConnectionId) {
        let removed = {
            let mut links = self.links.lock();
            let current = links.get(address).is_some_and(|link| link.id == id);
            if current {
                links.remove(address)
            } else {
                None
            }
        };
        if removed.is_some() {
            let _ = self.commands.send(RouterCommand::Unlinked {
                address: address.to_string(),
            });
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ============================================================================
// Router Task
// ============================================================================

struct Outbound {
    peer: PeerTarget,
    session: u64,
    handle: JoinHandle<()>,
    /// Explicit syncs answered by the running session
    waiters: Vec<Reply>,
    pending: Option<SyncScope>,
    /// Explicit syncs answered by the pending session
    pending_waiters: Vec<Reply>,
}

impl Outbound {
    fn resolve(waiters: Vec<Reply>, outcome: &Result<SyncReport, SyncError>) {
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

struct RouterTask {
    options: RouterOptions,
    store: BlobStore,
    registry: Arc<PeerRegistry>,
    commands: mpsc::UnboundedSender<RouterCommand>,
    events: broadcast::Sender<SyncEvent>,
    /// Running sessions by `host:port`
    outbound: HashMap<String, Outbound>,
    /// Targets of this node's own announce links by `host:port`
    linked: HashMap<String, PeerTarget>,
    next_session: u64,
}

impl RouterTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RouterCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command);
        }
    }

    fn handle(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Connected { connection, target } => {
                tracing::info!(peer = %target, connection = %connection, "Peer connected");
                self.registry.insert(connection, target.clone());
                self.emit(SyncEvent::PeerConnected(target.clone()));

                if self.options.mode == SyncMode::Push {
                    self.schedule(target, SyncScope::Everything, None);
                }
            }

            RouterCommand::Disconnected { connection } => {
                let Some(target) = self.registry.remove(connection) else {
                    return;
                };
                tracing::info!(peer = %target, connection = %connection, "Peer disconnected");
                self.emit(SyncEvent::PeerDisconnected(target.clone()));

                let address = target.address();
                if self.reachable(&address) {
                    return;
                }
                if let Some(outbound) = self.outbound.remove(&address) {
                    outbound.handle.abort();
                    tracing::warn!(peer = %outbound.peer, "Cancelled sync session to departed peer");

                    let outcome = Err(SyncError::Cancelled {
                        peer: outbound.peer.clone(),
                    });
                    Outbound::resolve(outbound.waiters, &outcome);
                    Outbound::resolve(outbound.pending_waiters, &outcome);
                    self.emit(SyncEvent::SessionFinished {
                        peer: outbound.peer,
                        outcome,
                    });
                }
            }

            RouterCommand::Linked { target } => {
                self.linked.insert(target.address(), target.clone());
                if self.options.mode == SyncMode::Push {
                    self.schedule(target, SyncScope::Everything, None);
                }
            }

            RouterCommand::Unlinked { address } => {
                if let Some(target) = self.linked.remove(&address) {
                    tracing::debug!(peer = %target, "No longer pushing over announce link");
                }
            }

            RouterCommand::BlobsStored { keys } => {
                if self.options.mode != SyncMode::Push {
                    return;
                }
                for target in self.push_targets() {
                    self.schedule(target, SyncScope::keys(keys.iter().cloned()), None);
                }
            }

            RouterCommand::SyncNow { target, reply } => {
                tracing::info!(peer = %target, "Explicit sync scheduled");
                self.schedule(target, SyncScope::Everything, Some(reply));
            }

            RouterCommand::SessionFinished {
                address,
                session,
                outcome,
            } => {
                // A cancelled or replaced session may still report in
                let current = self
                    .outbound
                    .get(&address)
                    .is_some_and(|outbound| outbound.session == session);
                if !current {
                    return;
                }
                let Some(outbound) = self.outbound.remove(&address) else {
                    return;
                };

                if let Err(e) = &outcome {
                    tracing::warn!(peer = %outbound.peer, error = %e, "Sync session failed");
                }
                Outbound::resolve(outbound.waiters, &outcome);
                self.emit(SyncEvent::SessionFinished {
                    peer: outbound.peer.clone(),
                    outcome,
                });

                if let Some(scope) = outbound.pending {
                    // Explicit syncs run even to targets that are not connected
                    if !outbound.pending_waiters.is_empty() || self.reachable(&address) {
                        self.spawn_session(outbound.peer, scope, outbound.pending_waiters);
                    }
                }
            }
        }
    }

    /// Whether `address` is still a connected or linked peer
    fn reachable(&self, address: &str) -> bool {
        self.registry.contains_address(address) || self.linked.contains_key(address)
    }

    /// Connected and linked targets, one per `host:port`
    fn push_targets(&self) -> Vec<PeerTarget> {
        let mut targets = self.registry.targets();
        for target in self.linked.values() {
            if !targets.iter().any(|t| t.address() == target.address()) {
                targets.push(target.clone());
            }
        }
        targets
    }

    /// Start a session to `target`, or fold `scope` into the one already queued
    fn schedule(&mut self, target: PeerTarget, scope: SyncScope, reply: Option<Reply>) {
        if let Some(outbound) = self.outbound.get_mut(&target.address()) {
            outbound.pending = Some(match outbound.pending.take() {
                Some(pending) => pending.merge(scope),
                None => scope,
            });
            outbound.pending_waiters.extend(reply);
            tracing::debug!(peer = %target, "Session in flight; queued follow-up");
            return;
        }
        self.spawn_session(target, scope, reply.into_iter().collect());
    }

    fn spawn_session(&mut self, target: PeerTarget, scope: SyncScope, waiters: Vec<Reply>) {
        let session_id = self.next_session;
        self.next_session += 1;

        let address = target.address();
        let session = SyncSession::new(
            target.clone(),
            self.store.clone(),
            self.options.name.clone(),
            self.options.timeout,
        );
        let commands = self.commands.clone();
        let report_address = address.clone();

        let handle = tokio::spawn(async move {
            let outcome = session.run(scope).await;
            let _ = commands.send(RouterCommand::SessionFinished {
                address: report_address,
                session: session_id,
                outcome,
            });
        });

        self.outbound.insert(
            address,
            Outbound {
                peer: target,
                session: session_id,
                handle,
                waiters,
                pending: None,
                pending_waiters: Vec::new(),
            },
        );
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BlobId;
    use crate::sync::protocol;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(10);

    struct Node {
        router: SyncRouter,
        store: BlobStore,
        port: u16,
        _dir: TempDir,
    }

    async fn node(name: &str, mode: SyncMode) -> Node {
        node_with_timeout(name, mode, Duration::from_secs(5)).await
    }

    async fn node_with_timeout(name: &str, mode: SyncMode, timeout: Duration) -> Node {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let options = RouterOptions {
            name: name.to_string(),
            mode,
            advertise_port: None,
            timeout,
        };
        let router = SyncRouter::start(options, store.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = router.listen(listener).unwrap().port();
        Node {
            router,
            store,
            port,
            _dir: dir,
        }
    }

    impl Node {
        fn target(&self) -> PeerTarget {
            PeerTarget::new("127.0.0.1", self.port)
        }

        async fn put(&self, data: &[u8]) -> BlobKey {
            let staged = self.store.stage(data).await.unwrap();
            let key = BlobKey::original(BlobId::new(staged.digest(), "png").unwrap());
            staged.commit(&key).await.unwrap();
            key
        }
    }

    async fn next_finished(
        events: &mut broadcast::Receiver<SyncEvent>,
    ) -> Result<SyncReport, SyncError> {
        tokio::time::timeout(WAIT, async {
            loop {
                if let SyncEvent::SessionFinished { outcome, .. } = events.recv().await.unwrap() {
                    return outcome;
                }
            }
        })
        .await
        .unwrap()
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn wait_for_targets(router: &SyncRouter, count: usize) {
        wait_until(|| router.targets().len() == count).await;
    }

    /// A peer that welcomes every connection and then never answers
    ///
    /// Returns its target and a count of transfer sessions it accepted.
    async fn silent_peer() -> (PeerTarget, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = PeerTarget::new("127.0.0.1", listener.local_addr().unwrap().port());
        let transfers = Arc::new(AtomicUsize::new(0));

        let counter = transfers.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut framed = protocol::framed(stream);
                    let Ok(Message::Hello { purpose, .. }) =
                        protocol::recv_message(&mut framed).await
                    else {
                        return;
                    };
                    let welcome = Message::Welcome {
                        name: "silent".to_string(),
                    };
                    protocol::send_message(&mut framed, welcome).await.unwrap();
                    if purpose == Purpose::Transfer {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    while let Some(Ok(_)) = framed.next().await {}
                });
            }
        });

        (target, transfers)
    }

    /// Announce a fake peer listening on `listen_port` to `node`
    async fn announce(node: &Node, listen_port: u16) -> PeerStream {
        let hello = Message::Hello {
            name: "silent".to_string(),
            purpose: Purpose::Announce,
            listen_port: Some(listen_port),
        };
        let (framed, _) = session::handshake(&node.target(), hello, WAIT).await.unwrap();
        framed
    }

    #[tokio::test]
    async fn test_connect_registers_with_remote() {
        let a = node("a", SyncMode::Manual).await;
        let b = node("b", SyncMode::Manual).await;
        let mut events = a.router.subscribe();

        b.router.connect(a.target()).await.unwrap();

        let connected = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        match connected {
            SyncEvent::PeerConnected(target) => {
                assert_eq!(target.port, b.port);
                assert_eq!(target.name.as_deref(), Some("b"));
            }
            other => panic!("expected PeerConnected, got {:?}", other),
        }
        assert_eq!(a.router.targets().len(), 1);
        assert_eq!(b.router.linked_peers(), vec![a.target()]);

        assert!(b.router.disconnect(&a.target()));
        assert!(!b.router.disconnect(&a.target()));
        wait_for_targets(&a.router, 0).await;
    }

    #[tokio::test]
    async fn test_push_mode_sweeps_new_peer() {
        let a = node("a", SyncMode::Push).await;
        let b = node("b", SyncMode::Manual).await;
        let key = a.put(b"pixels").await;
        let mut events = a.router.subscribe();

        b.router.connect(a.target()).await.unwrap();

        let report = next_finished(&mut events).await.unwrap();
        assert_eq!(report.sent, 1);
        assert!(b.store.has(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_manual_mode_waits_for_sync_now() {
        let a = node("a", SyncMode::Manual).await;
        let b = node("b", SyncMode::Manual).await;
        let key = a.put(b"pixels").await;

        b.router.connect(a.target()).await.unwrap();
        wait_for_targets(&a.router, 1).await;
        a.router.blobs_stored(vec![key.clone()]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!b.store.has(&key).await.unwrap());

        let report = a.router.sync_now(b.target()).await.unwrap();
        assert_eq!(report.sent, 1);
        assert!(b.store.has(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_blobs_stored_pushes_increment() {
        let a = node("a", SyncMode::Push).await;
        let b = node("b", SyncMode::Manual).await;
        let mut events = a.router.subscribe();

        b.router.connect(a.target()).await.unwrap();
        let initial = next_finished(&mut events).await.unwrap();
        assert_eq!(initial.sent, 0);

        let key = a.put(b"later").await;
        a.router.blobs_stored(vec![key.clone()]);

        let report = next_finished(&mut events).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.skipped, 0);
        assert!(b.store.has(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_now_unreachable() {
        let a = node("a", SyncMode::Manual).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = PeerTarget::new("127.0.0.1", listener.local_addr().unwrap().port());
        drop(listener);

        let err = a.router.sync_now(dead.clone()).await.unwrap_err();
        assert!(matches!(err, SyncError::Unreachable { .. }));
        assert_eq!(err.peer(), &dead);
    }

    #[tokio::test]
    async fn test_sync_now_waits_for_session_in_flight() {
        let a = node_with_timeout("a", SyncMode::Push, Duration::from_secs(2)).await;
        a.put(b"pixels").await;
        let (peer, transfers) = silent_peer().await;
        let mut events = a.router.subscribe();

        // The push sweep to the peer stalls until it times out
        let _link = announce(&a, peer.port).await;
        wait_until(|| transfers.load(Ordering::SeqCst) == 1).await;

        let router = a.router.clone();
        let explicit = tokio::spawn(async move { router.sync_now(peer).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(transfers.load(Ordering::SeqCst), 1);

        let push = next_finished(&mut events).await;
        assert!(matches!(push, Err(SyncError::Timeout { .. })));

        let outcome = tokio::time::timeout(WAIT, explicit).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(SyncError::Timeout { .. })));
        assert_eq!(transfers.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_departed_peer_cancels_session() {
        let a = node_with_timeout("a", SyncMode::Push, Duration::from_secs(30)).await;
        a.put(b"pixels").await;
        let (peer, transfers) = silent_peer().await;
        let mut events = a.router.subscribe();

        let link = announce(&a, peer.port).await;
        wait_until(|| transfers.load(Ordering::SeqCst) == 1).await;

        drop(link);

        match next_finished(&mut events).await {
            Err(SyncError::Cancelled { peer: cancelled }) => assert_eq!(cancelled.port, peer.port),
            other => panic!("expected Cancelled, got {:?}", other),
        }
        assert!(a.router.targets().is_empty());
    }

    #[tokio::test]
    async fn test_push_mode_pushes_to_linked_peer() {
        let a = node("a", SyncMode::Push).await;
        let b = node("b", SyncMode::Manual).await;
        let before = a.put(b"before").await;
        let mut events = a.router.subscribe();

        a.router.connect(b.target()).await.unwrap();

        let sweep = next_finished(&mut events).await.unwrap();
        assert_eq!(sweep.sent, 1);
        assert!(b.store.has(&before).await.unwrap());

        let after = a.put(b"after").await;
        a.router.blobs_stored(vec![after.clone()]);

        let push = next_finished(&mut events).await.unwrap();
        assert_eq!(push.sent, 1);
        assert!(b.store.has(&after).await.unwrap());

        // Linked peers are pushed to but are not connected targets
        assert!(a.router.targets().is_empty());
    }

    #[tokio::test]
    async fn test_link_closed_by_remote_is_pruned() {
        let a = node("a", SyncMode::Manual).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = PeerTarget::new("127.0.0.1", listener.local_addr().unwrap().port());

        // Welcomes the announce, then hangs up
        let remote = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = protocol::framed(stream);
            protocol::recv_message(&mut framed).await.unwrap();
            let welcome = Message::Welcome {
                name: "brief".to_string(),
            };
            protocol::send_message(&mut framed, welcome).await.unwrap();
        });

        a.router.connect(target.clone()).await.unwrap();
        remote.await.unwrap();

        wait_until(|| a.router.linked_peers().is_empty()).await;
        assert!(!a.router.disconnect(&target));
    }

    #[tokio::test]
    async fn test_connect_requires_listener() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let router = SyncRouter::start(RouterOptions::default(), store);

        let target = PeerTarget::new("127.0.0.1", 9);
        let err = router.connect(target.clone()).await.unwrap_err();
        assert!(matches!(err, SyncError::NotListening { .. }));
        assert_eq!(err.peer(), &target);
        assert!(router.linked_peers().is_empty());
    }
}
