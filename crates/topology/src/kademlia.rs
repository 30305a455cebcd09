use std::{
    cmp::Ordering,
    collections::HashMap,
    convert::Infallible,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use libp2p::Multiaddr;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{timeout, Instant},
};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use voyager_addressbook::AddressBookError;
use voyager_p2p::{ConnectError, P2pService};
use voyager_primitives::{distance_cmp, SwarmAddress, HASH_SIZE, MAX_BINS, MAX_PO};

use crate::{BinIter, ClosestPeerer, Discovery, DiscoveryError, PSlice, PeerBook, TopologyError};

/// Ceiling on draining detached announce tasks at shutdown.
const ANNOUNCE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Ceiling on waiting for the manage loop at shutdown.
const MANAGE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Bootnode connections to aim for when the connected set is empty.
const BOOTNODE_TARGET: usize = 3;

/// Configuration of the topology driver.
#[derive(Debug, Clone)]
pub struct KademliaConfig {
    /// Connected peers per shallow bin before it counts as saturated.
    pub saturation_peers: usize,
    /// Connected peers per shallow bin before inbound dials are refused.
    pub oversaturation_peers: usize,
    /// Peers in the deepest bins that constitute a neighborhood.
    pub nn_low_watermark: usize,
    /// Consecutive failed dials before a peer is pruned.
    pub max_conn_attempts: usize,
    /// Dial attempts per bootnode before giving up on it.
    pub max_bootnode_attempts: usize,
    /// Extra prefix bits used for balanced dialing; 0 disables the pass.
    pub bit_suffix_length: u8,
    /// Backoff after a failed dial.
    pub time_to_retry: Duration,
    /// Backoff after a successful dial.
    pub short_retry: Duration,
    /// Period of the unsolicited manage wake-up.
    pub manage_tick: Duration,
    /// Budget of a single dial.
    pub connect_timeout: Duration,
    /// Budget of a whole bootnode discovery round.
    pub bootnode_timeout: Duration,
    /// Underlays to fall back to with an empty connected set.
    pub bootnodes: Vec<Multiaddr>,
    /// Accept every inbound connection, regardless of saturation.
    pub bootnode_mode: bool,
    /// Do not dial anybody.
    pub standalone_mode: bool,
}

impl Default for KademliaConfig {
    fn default() -> Self {
        Self {
            saturation_peers: 4,
            oversaturation_peers: 16,
            nn_low_watermark: 2,
            max_conn_attempts: 3,
            max_bootnode_attempts: 3,
            bit_suffix_length: 2,
            time_to_retry: Duration::from_secs(60),
            short_retry: Duration::from_secs(30),
            manage_tick: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            bootnode_timeout: Duration::from_secs(15),
            bootnodes: Vec::new(),
            bootnode_mode: false,
            standalone_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryInfo {
    try_after: Instant,
    failed_attempts: usize,
}

enum ConnectStatus {
    /// A fresh connection; `announce` is false when the transport reported
    /// an existing one with the expected overlay.
    Connected { announce: bool },
    /// The authenticated overlay is not the peer we dialed.
    Mismatch,
    /// The dial failed; the transport may have supplied a retry hint.
    Failed { backoff: Option<Instant> },
}

/// The Kademlia topology driver.
///
/// One long-lived manage task keeps shallow bins saturated and the keyspace
/// prefix-balanced; all other methods are callbacks from the transport or
/// queries from the forwarding protocols.
pub struct Kademlia {
    base: SwarmAddress,
    config: KademliaConfig,
    book: Arc<dyn PeerBook>,
    discovery: Arc<dyn Discovery>,
    p2p: Arc<dyn P2pService>,
    connected_peers: PSlice,
    known_peers: PSlice,
    common_bin_prefixes: Vec<Vec<SwarmAddress>>,
    depth: RwLock<u8>,
    wait_next: Mutex<HashMap<SwarmAddress, RetryInfo>>,
    manage_tx: mpsc::Sender<()>,
    manage_rx: Mutex<Option<mpsc::Receiver<()>>>,
    subscribers: Mutex<Vec<mpsc::Sender<()>>>,
    quit: watch::Sender<bool>,
    announce_tasks: TaskTracker,
    manage_handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Kademlia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kademlia")
            .field("base", &self.base)
            .field("depth", &self.neighborhood_depth())
            .field("connected", &self.connected_peers.len())
            .field("known", &self.known_peers.len())
            .finish_non_exhaustive()
    }
}

impl Kademlia {
    /// Creates the driver. Call [`Kademlia::start`] to run the manage loop.
    pub fn new(
        base: SwarmAddress,
        book: Arc<dyn PeerBook>,
        discovery: Arc<dyn Discovery>,
        p2p: Arc<dyn P2pService>,
        config: KademliaConfig,
    ) -> Self {
        let (manage_tx, manage_rx) = mpsc::channel(1);
        let (quit, _) = watch::channel(false);
        let common_bin_prefixes = generate_common_bin_prefixes(&base, config.bit_suffix_length);
        Self {
            base,
            config,
            book,
            discovery,
            p2p,
            connected_peers: PSlice::new(),
            known_peers: PSlice::new(),
            common_bin_prefixes,
            depth: RwLock::new(0),
            wait_next: Mutex::new(HashMap::new()),
            manage_tx,
            manage_rx: Mutex::new(Some(manage_rx)),
            subscribers: Mutex::new(Vec::new()),
            quit,
            announce_tasks: TaskTracker::new(),
            manage_handle: Mutex::new(None),
        }
    }

    /// The node's own overlay address.
    pub fn base(&self) -> &SwarmAddress {
        &self.base
    }

    /// Spawns the manage loop and seeds the known set from the book.
    pub fn start(self: &Arc<Self>) -> Result<(), TopologyError> {
        let rx = self
            .manage_rx
            .lock()
            .take()
            .expect("kademlia started twice");
        let this = Arc::clone(self);
        *self.manage_handle.lock() = Some(tokio::spawn(this.manage(rx)));

        let overlays = self.book.overlays()?;
        self.add_peers(overlays);
        Ok(())
    }

    /// Adds peers to the known set and wakes the manage loop.
    pub fn add_peers(&self, peers: impl IntoIterator<Item = SwarmAddress>) {
        for peer in peers {
            if peer == self.base || self.known_peers.exists(&peer) {
                continue;
            }
            let po = self.base.proximity(&peer);
            self.known_peers.add(peer, po);
        }
        self.wake();
    }

    /// Whether an inbound dial from `peer` should be accepted.
    pub fn pick(&self, peer: &SwarmAddress) -> bool {
        if self.config.bootnode_mode {
            return true;
        }
        let po = self.base.proximity(peer);
        let (_, oversaturated) = self.bin_saturated(po);
        !oversaturated
    }

    /// Transport callback: `peer` dialed us and authenticated.
    pub async fn connected(&self, peer: SwarmAddress) -> Result<(), TopologyError> {
        if !self.config.bootnode_mode {
            let po = self.base.proximity(&peer);
            let (_, oversaturated) = self.bin_saturated(po);
            if oversaturated {
                return Err(TopologyError::Oversaturated);
            }
        }
        self.wait_next.lock().remove(&peer);
        self.make_connected(peer, true).await?;
        self.wake();
        Ok(())
    }

    /// Transport callback: the connection to `peer` is gone.
    pub fn disconnected(&self, peer: &SwarmAddress) {
        debug!(%peer, "peer disconnected");
        self.connected_peers.remove(peer);
        self.set_retry(*peer, self.config.time_to_retry, 0);
        self.update_depth();
        self.wake();
        self.notify_peers_change();
    }

    /// Iterates connected peers, closest bin first.
    pub fn each_peer<E>(
        &self,
        f: impl FnMut(&SwarmAddress, u8) -> Result<BinIter, E>,
    ) -> Result<(), E> {
        self.connected_peers.each_bin(f)
    }

    /// Iterates connected peers, farthest bin first.
    pub fn each_peer_rev<E>(
        &self,
        f: impl FnMut(&SwarmAddress, u8) -> Result<BinIter, E>,
    ) -> Result<(), E> {
        self.connected_peers.each_bin_rev(f)
    }

    /// Subscribes to connected-set changes. Dropping the receiver
    /// unsubscribes; notifications never block and are collapsed while the
    /// receiver lags.
    pub fn subscribe_peers_change(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.lock().push(tx);
        rx
    }

    /// The current neighborhood depth.
    pub fn neighborhood_depth(&self) -> u8 {
        *self.depth.read()
    }

    /// Whether every pseudo-address of `bin` has a close-enough connected
    /// representative.
    pub fn is_balanced(&self, bin: u8) -> bool {
        let Some(prefixes) = self.common_bin_prefixes.get(bin as usize) else {
            return false;
        };
        let wanted = bin + self.config.bit_suffix_length + 1;
        for pseudo in prefixes {
            let Some(closest) = closest_in(&self.connected_peers, pseudo, |_| false) else {
                return false;
            };
            if closest.extended_proximity(pseudo) < wanted {
                return false;
            }
        }
        true
    }

    /// Number of connected peers.
    pub fn connected_count(&self) -> usize {
        self.connected_peers.len()
    }

    /// Number of known peers.
    pub fn known_count(&self) -> usize {
        self.known_peers.len()
    }

    /// A serializable snapshot for introspection.
    pub fn snapshot(&self) -> KademliaSnapshot {
        let mut bins: Vec<BinInfo> = (0..MAX_BINS).map(|_| BinInfo::default()).collect();
        let _ = self.connected_peers.each_bin(|peer, po| {
            let info = &mut bins[po as usize];
            info.connected += 1;
            info.connected_peers.push(peer.to_string());
            Ok::<_, Infallible>(BinIter::Continue)
        });
        let _ = self.known_peers.each_bin(|peer, po| {
            let info = &mut bins[po as usize];
            info.population += 1;
            let name = peer.to_string();
            if !info.connected_peers.contains(&name) {
                info.disconnected_peers.push(name);
            }
            Ok::<_, Infallible>(BinIter::Continue)
        });
        KademliaSnapshot {
            base: self.base.to_string(),
            population: self.known_peers.len(),
            connected: self.connected_peers.len(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            nn_low_watermark: self.config.nn_low_watermark,
            depth: self.neighborhood_depth(),
            bins,
        }
    }

    /// The snapshot as JSON bytes.
    pub fn marshal_snapshot(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.snapshot())
    }

    /// Stops the manage loop and drains announce tasks.
    pub async fn close(&self) {
        info!("kademlia shutting down");
        let _ = self.quit.send(true);

        self.announce_tasks.close();
        if timeout(ANNOUNCE_DRAIN_TIMEOUT, self.announce_tasks.wait())
            .await
            .is_err()
        {
            warn!("kademlia shutting down with announce tasks still running");
        }

        let handle = self.manage_handle.lock().take();
        if let Some(handle) = handle {
            if timeout(MANAGE_DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("kademlia manage loop did not shut down properly");
            }
        }
    }

    // ------------------------------------------------------------------
    // Manage loop
    // ------------------------------------------------------------------

    async fn manage(self: Arc<Self>, mut rx: mpsc::Receiver<()>) {
        let mut quit = self.quit.subscribe();
        loop {
            tokio::select! {
                _ = quit.changed() => return,
                _ = tokio::time::sleep(self.config.manage_tick) => {}
                _ = rx.recv() => {}
            }
            if *quit.borrow() {
                return;
            }
            if self.config.standalone_mode {
                continue;
            }

            tokio::select! {
                _ = quit.changed() => return,
                _ = self.manage_round() => {}
            }

            if self.connected_peers.is_empty() && !self.config.bootnodes.is_empty() {
                debug!("no connected peers, trying bootnodes");
                tokio::select! {
                    _ = quit.changed() => return,
                    _ = self.connect_bootnodes() => {}
                }
            }
        }
    }

    async fn manage_round(&self) {
        let start = Instant::now();
        if let Err(err) = self.balanced_dial_pass().await {
            warn!(%err, "balanced dial pass aborted");
        }
        if let Err(err) = self.bin_fill_pass().await {
            warn!(%err, "bin fill pass aborted");
        }
        trace!(elapsed = ?start.elapsed(), "manage round done");
    }

    /// For each bin and pseudo-address, makes sure some connected peer
    /// shares the pseudo-address's extended prefix, dialing the closest
    /// known candidate when none does.
    async fn balanced_dial_pass(&self) -> Result<(), AddressBookError> {
        for (bin, prefixes) in self.common_bin_prefixes.iter().enumerate() {
            let wanted = bin as u8 + self.config.bit_suffix_length + 1;
            for pseudo in prefixes {
                // Balancing refines an existing connected set; an empty one
                // is the bin-fill pass's problem.
                let Some(closest) = closest_in(&self.connected_peers, pseudo, |_| false) else {
                    return Ok(());
                };
                if closest.extended_proximity(pseudo) >= wanted {
                    continue;
                }
                let Some(candidate) =
                    closest_in(&self.known_peers, pseudo, |peer| self.waiting(peer))
                else {
                    return Ok(());
                };
                if self.connected_peers.exists(&candidate) {
                    continue;
                }
                if candidate.extended_proximity(pseudo) < wanted {
                    continue;
                }
                self.attempt_connect(candidate).await?;
            }
        }
        Ok(())
    }

    /// Walks known peers farthest bin first and dials everything eligible
    /// in unsaturated bins.
    async fn bin_fill_pass(&self) -> Result<(), AddressBookError> {
        let mut candidates = Vec::new();
        let _ = self.known_peers.each_bin_rev(|peer, po| {
            candidates.push((*peer, po));
            Ok::<_, Infallible>(BinIter::Continue)
        });

        for (peer, po) in candidates {
            if *self.quit.subscribe().borrow() {
                return Ok(());
            }
            if self.connected_peers.exists(&peer) || self.waiting(&peer) {
                continue;
            }
            let (saturated, _) = self.bin_saturated(po);
            if saturated {
                continue;
            }
            self.attempt_connect(peer).await?;
        }
        Ok(())
    }

    async fn connect_bootnodes(&self) {
        let _ = timeout(self.config.bootnode_timeout, async {
            let mut connected = 0usize;
            for underlay in &self.config.bootnodes {
                if connected >= BOOTNODE_TARGET {
                    return;
                }
                for _ in 0..self.config.max_bootnode_attempts {
                    trace!(%underlay, "connecting to bootnode");
                    match self.p2p.connect(underlay).await {
                        Ok(overlay) => {
                            self.wait_next.lock().remove(&overlay);
                            if self.make_connected(overlay, true).await.is_ok() {
                                connected += 1;
                            }
                            break;
                        }
                        Err(ConnectError::AlreadyConnected(_)) => break,
                        Err(err) => {
                            debug!(%underlay, %err, "bootnode connect failed");
                        }
                    }
                }
            }
        })
        .await;
    }

    /// Resolves the peer's underlay and dials it, with all retry and
    /// pruning bookkeeping. `Ok(true)` means the peer ended up connected.
    async fn attempt_connect(&self, peer: SwarmAddress) -> Result<bool, AddressBookError> {
        let record = match self.book.get(&peer) {
            Ok(record) => record,
            Err(AddressBookError::NotFound) => {
                // A known peer without a book entry is stale.
                debug!(%peer, "no address book entry for peer, removing");
                self.known_peers.remove(&peer);
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        match self.dial(&peer, record.underlay()).await {
            ConnectStatus::Connected { announce } => {
                self.set_retry(peer, self.config.short_retry, 0);
                if self.make_connected(peer, announce).await.is_err() {
                    return Ok(false);
                }
                debug!(%peer, "connected to peer");
                Ok(true)
            }
            ConnectStatus::Mismatch => {
                warn!(%peer, "overlay mismatch, removing peer");
                self.known_peers.remove(&peer);
                if let Err(err) = self.book.remove(&peer) {
                    debug!(%peer, %err, "could not remove peer from addressbook");
                }
                Ok(false)
            }
            ConnectStatus::Failed { backoff } => {
                debug!(%peer, "peer not reachable when attempting to connect");
                let mut wait = self.wait_next.lock();
                let previous = wait.get(&peer).map(|r| r.failed_attempts).unwrap_or(0);
                let (try_after, failed_attempts) = match backoff {
                    Some(try_after) => (try_after, previous),
                    None => (
                        Instant::now() + self.config.time_to_retry,
                        previous + 1,
                    ),
                };
                if failed_attempts > self.config.max_conn_attempts {
                    wait.remove(&peer);
                    drop(wait);
                    self.known_peers.remove(&peer);
                    if let Err(err) = self.book.remove(&peer) {
                        debug!(%peer, %err, "could not remove peer from addressbook");
                    }
                    debug!(%peer, "pruned peer from address book");
                } else {
                    wait.insert(
                        peer,
                        RetryInfo {
                            try_after,
                            failed_attempts,
                        },
                    );
                }
                Ok(false)
            }
        }
    }

    async fn dial(&self, peer: &SwarmAddress, underlay: &Multiaddr) -> ConnectStatus {
        match timeout(self.config.connect_timeout, self.p2p.connect(underlay)).await {
            Err(_) => ConnectStatus::Failed { backoff: None },
            Ok(Ok(overlay)) if overlay == *peer => ConnectStatus::Connected { announce: true },
            Ok(Ok(overlay)) => {
                let _ = self.p2p.disconnect(peer).await;
                let _ = self.p2p.disconnect(&overlay).await;
                ConnectStatus::Mismatch
            }
            Ok(Err(ConnectError::AlreadyConnected(overlay))) if overlay == *peer => {
                ConnectStatus::Connected { announce: false }
            }
            Ok(Err(ConnectError::AlreadyConnected(_))) => ConnectStatus::Mismatch,
            Ok(Err(ConnectError::Backoff { try_after })) => ConnectStatus::Failed {
                backoff: Some(try_after),
            },
            Ok(Err(_)) => ConnectStatus::Failed { backoff: None },
        }
    }

    /// Adds the peer to the connected set and, when asked, announces it.
    /// The peer is visible to closest-peer queries before any gossip about
    /// it leaves the node.
    async fn make_connected(
        &self,
        peer: SwarmAddress,
        announce: bool,
    ) -> Result<(), TopologyError> {
        let po = self.base.proximity(&peer);
        self.known_peers.add(peer, po);
        self.connected_peers.add(peer, po);
        self.update_depth();
        self.notify_peers_change();

        if announce {
            if let Err(err) = self.announce(&peer).await {
                debug!(%peer, %err, "announce failed, disconnecting peer");
                let _ = self.p2p.disconnect(&peer).await;
                self.connected_peers.remove(&peer);
                self.update_depth();
                self.notify_peers_change();
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Gossips a new peer to every other connected peer from detached
    /// tasks, and synchronously sends the connected set to the new peer.
    async fn announce(&self, peer: &SwarmAddress) -> Result<(), DiscoveryError> {
        let mut addrs = Vec::new();
        let _ = self.connected_peers.each_bin_rev(|connected_peer, _| {
            if connected_peer == peer {
                return Ok::<_, Infallible>(BinIter::Continue);
            }
            addrs.push(*connected_peer);

            // A slow recipient must never stall the connect path.
            let discovery = Arc::clone(&self.discovery);
            let addressee = *connected_peer;
            let new_peer = *peer;
            let _ = self.announce_tasks.spawn(async move {
                if let Err(err) = discovery.broadcast_peers(&addressee, vec![new_peer]).await {
                    debug!(%addressee, %err, "could not gossip new peer");
                }
            });
            Ok(BinIter::Continue)
        });

        if addrs.is_empty() {
            return Ok(());
        }
        self.discovery.broadcast_peers(peer, addrs).await
    }

    // ------------------------------------------------------------------
    // State helpers
    // ------------------------------------------------------------------

    fn wake(&self) {
        let _ = self.manage_tx.try_send(());
    }

    fn waiting(&self, peer: &SwarmAddress) -> bool {
        self.wait_next
            .lock()
            .get(peer)
            .is_some_and(|info| Instant::now() < info.try_after)
    }

    fn set_retry(&self, peer: SwarmAddress, after: Duration, failed_attempts: usize) {
        self.wait_next.lock().insert(
            peer,
            RetryInfo {
                try_after: Instant::now() + after,
                failed_attempts,
            },
        );
    }

    fn update_depth(&self) {
        *self.depth.write() = depth_of(&self.connected_peers, self.config.nn_low_watermark);
    }

    /// Saturation of `bin`: bins at or past the potential depth always want
    /// more neighbors.
    fn bin_saturated(&self, bin: u8) -> (bool, bool) {
        let potential_depth = depth_of(&self.known_peers, self.config.nn_low_watermark);
        if bin >= potential_depth {
            return (false, false);
        }
        let size = self.connected_peers.bin_size(bin);
        (
            size >= self.config.saturation_peers,
            size >= self.config.oversaturation_peers,
        )
    }

    fn notify_peers_change(&self) {
        self.subscribers.lock().retain(|tx| match tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        });
    }
}

impl ClosestPeerer for Kademlia {
    fn closest_peer(
        &self,
        target: &SwarmAddress,
        skip: &[SwarmAddress],
    ) -> Result<SwarmAddress, TopologyError> {
        if self.connected_peers.is_empty() {
            return Err(TopologyError::NotFound);
        }
        let mut closest = self.base;
        let _ = self.connected_peers.each_bin_rev(|peer, _| {
            if skip.contains(peer) {
                return Ok::<_, Infallible>(BinIter::Continue);
            }
            if distance_cmp(target, peer, &closest) == Ordering::Greater {
                closest = *peer;
            }
            Ok(BinIter::Continue)
        });
        if closest == self.base {
            return Err(TopologyError::WantSelf);
        }
        Ok(closest)
    }
}

impl fmt::Display for Kademlia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string_pretty(&self.snapshot()) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}

/// Population info of a single bin.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BinInfo {
    /// Known peers in the bin.
    pub population: usize,
    /// Connected peers in the bin.
    pub connected: usize,
    /// Known but not connected peers.
    pub disconnected_peers: Vec<String>,
    /// Connected peers.
    pub connected_peers: Vec<String>,
}

/// Introspection snapshot of the topology.
#[derive(Debug, Clone, Serialize)]
pub struct KademliaSnapshot {
    /// Base overlay address.
    pub base: String,
    /// Total known peers.
    pub population: usize,
    /// Total connected peers.
    pub connected: usize,
    /// Seconds since the epoch at capture time.
    pub timestamp: u64,
    /// Depth watermark parameter.
    pub nn_low_watermark: usize,
    /// Current neighborhood depth.
    pub depth: u8,
    /// Per-bin details, shallowest first.
    pub bins: Vec<BinInfo>,
}

/// The closest peer to `target` in `slice`, skipping filtered peers.
fn closest_in(
    slice: &PSlice,
    target: &SwarmAddress,
    mut skip: impl FnMut(&SwarmAddress) -> bool,
) -> Option<SwarmAddress> {
    let mut closest: Option<SwarmAddress> = None;
    let _ = slice.each_bin_rev(|peer, _| {
        if skip(peer) {
            return Ok::<_, Infallible>(BinIter::Continue);
        }
        match closest {
            None => closest = Some(*peer),
            Some(current) => {
                if distance_cmp(target, peer, &current) == Ordering::Greater {
                    closest = Some(*peer);
                }
            }
        }
        Ok(BinIter::Continue)
    });
    closest
}

/// The depth formula: the lower of the shallowest empty bin and the PO at
/// which, walking closest bin first, the cumulative peer count reaches the
/// nearest-neighbor watermark. Below the watermark the depth is 0.
fn depth_of(slice: &PSlice, nn_low: usize) -> u8 {
    if slice.len() < nn_low {
        return 0;
    }
    let (shallowest_empty, none_empty) = slice.shallowest_empty();
    let mut count = 0usize;
    let mut candidate = 0u8;
    let _ = slice.each_bin(|_, po| {
        count += 1;
        if count >= nn_low {
            candidate = po;
            return Ok::<_, Infallible>(BinIter::Stop);
        }
        Ok(BinIter::Continue)
    });
    if none_empty || shallowest_empty > candidate {
        candidate
    } else {
        shallowest_empty
    }
}

/// For every bin, the deterministic pseudo-addresses whose sub-prefixes the
/// balanced dialer keeps covered: the base with bit `bin` flipped, the
/// suffix enumeration written into the following bits, zeroes after.
fn generate_common_bin_prefixes(
    base: &SwarmAddress,
    bit_suffix_length: u8,
) -> Vec<Vec<SwarmAddress>> {
    if bit_suffix_length == 0 {
        return Vec::new();
    }
    let suffixes = 1usize << bit_suffix_length;
    (0..MAX_PO as usize)
        .map(|bin| {
            (0..suffixes)
                .map(|suffix| {
                    let mut pseudo = *base;
                    pseudo.set_bit(bin, !base.bit(bin));
                    for l in 0..bit_suffix_length as usize {
                        let bit = (suffix >> (bit_suffix_length as usize - 1 - l)) & 1 == 1;
                        pseudo.set_bit(bin + 1 + l, bit);
                    }
                    for l in (bin + bit_suffix_length as usize + 1)..(HASH_SIZE * 8) {
                        pseudo.set_bit(l, false);
                    }
                    pseudo
                })
                .collect()
        })
        .collect()
}
