use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use crate::{
    block::{Block, BlockInfo},
    config::Config,
    disk::DiskHandle,
    events::{DisconnectReason, Event, EventBus, EventPayload},
    ext::{pex::PexPeer, ssl::TlsContext, webseed::WebSeed, ExtensionRegistry},
    metainfo::MetaInfo,
    p2p::{state::SessionState, PeerCommand, PeerHandle},
    picker::{ChokeAction, Choker, PeerChokeInfo, Picker},
    piece::{PieceReader, PieceState, PieceStore, VerifyOutcome},
    store::StoreInfo,
    stats::ThroughputStats,
    tracker::{AnnounceParams, TrackersHandle},
    Bitfield, InfoHash, PeerId, BLOCK_SIZE,
};

// Sentinel address the scheduler uses for web seeds; they hold every piece
// and are never choked, so they fit the peer-shaped interfaces.
const WEBSEED_ADDR: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);

// How long a misbehaving peer stays blacklisted.
const BLACKLIST_COOLDOWN: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("disk error: {0}")]
    Disk(#[from] crate::disk::DiskError),

    #[error("store error: {0}")]
    Store(#[from] crate::piece::StoreError),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<TorrentCommand>;
pub type TorrentRx = mpsc::UnboundedReceiver<TorrentCommand>;

// Commands from peer sessions, verify tasks, trackers and the client.
pub enum TorrentCommand {

    PeerConnected { address: SocketAddr, id: PeerId },

    PeerState { address: SocketAddr, state: SessionState },

    PeerDisconnected { address: SocketAddr, reason: DisconnectReason },

    // A fresh block arrived; `cancels` are the endgame duplicates other
    // peers should withdraw.
    BlockReceived {
        address: SocketAddr,
        block: Block,
        cancels: Vec<(SocketAddr, BlockInfo)>,
    },

    // From trackers and PEX.
    PeersDiscovered(Vec<SocketAddr>),

    // A whole piece fetched over HTTP.
    WebSeedPiece { piece_idx: usize, data: Vec<u8> },

    VerifyResult(VerifyOutcome),

    Shutdown,

}

// Read-only state shared with every peer session of the torrent.
pub struct TorrentContext {

    pub info_hash: InfoHash,

    pub client_id: PeerId,

    pub picker: Picker,

    pub torrent_tx: TorrentTx,

    pub disk: DiskHandle,

    pub events: EventBus,

    pub info: StoreInfo,

    pub reader: PieceReader,

    pub extensions: ExtensionRegistry,

    pub tls: Option<TlsContext>,

    pub config: Config,

    pub listen_port: u16,

}

pub struct TorrentParams {
    pub metainfo: MetaInfo,
    pub config: Config,
    pub disk: DiskHandle,
    pub events: EventBus,
    pub tls: Option<TlsContext>,
    pub listen_port: u16,
}

pub struct TorrentHandle {
    pub torrent_tx: TorrentTx,
    pub handle: JoinHandle<()>,
}

impl TorrentHandle {
    pub fn start_torrent(params: TorrentParams) -> Self {
        let (mut torrent, torrent_tx) = Torrent::new(params);
        let info_hash = torrent.ctx.info_hash;
        let handle = tokio::spawn(async move {
            if let Err(e) = torrent.start().await {
                tracing::error!("torrent {} failed: {}", hex::encode(info_hash), e);
                torrent.ctx.events.emit(Event::new(EventPayload::SystemError {
                    message: format!("torrent {}: {}", hex::encode(info_hash), e),
                }));
            }
        });
        Self { torrent_tx, handle }
    }
}

pub struct Torrent {

    ctx: Arc<TorrentContext>,

    store: PieceStore,

    // Peers with active sessions.
    peers: HashMap<SocketAddr, PeerHandle>,

    // Peers we know about but aren't connected to.
    available: Vec<SocketAddr>,

    // Misbehaving peers and when their cooldown ends.
    blacklist: HashMap<SocketAddr, Instant>,

    bad_blocks: HashMap<SocketAddr, u32>,

    torrent_rx: TorrentRx,

    trackers: TrackersHandle,

    choker: Choker,

    webseeds: Vec<url::Url>,

    // Throughput of departed peers folded into the totals.
    departed: ThroughputStats,

    last_pex: Option<Instant>,

    last_announce_refresh: Option<Instant>,

    start_time: Option<Instant>,

    completed_announced: bool,

}

impl Torrent {

    pub fn new(params: TorrentParams) -> (Self, TorrentTx) {

        let TorrentParams { metainfo, config, disk, events, tls, listen_port } = params;
        let info = StoreInfo::new(&metainfo, config.output_dir.clone());
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();

        let picker = Picker::new(
            info.num_pieces,
            info.piece_len,
            info.last_piece_len,
            config.scheduler.clone(),
        );
        let store = PieceStore::new(
            info.clone(),
            metainfo.piece_hashes(),
            disk.clone(),
            events.clone(),
        );
        // Adaptive read-ahead keeps two pieces in flight regardless of the
        // torrent's piece size.
        let read_ahead = if config.disk.read_ahead_adaptive {
            info.piece_len * 2
        } else {
            config.disk.read_ahead
        };
        let reader = PieceReader::new(info.clone(), disk.clone(), config.disk.read_cache_pieces, read_ahead);
        let extensions = ExtensionRegistry::new(&config.extensions);
        let trackers = TrackersHandle::new(metainfo.trackers());
        let webseeds = if config.extensions.webseed_enabled {
            metainfo.webseeds()
        } else {
            Vec::new()
        };
        let choker = Choker::new(config.scheduler.clone());

        let ctx = Arc::new(TorrentContext {
            info_hash: metainfo.info_hash(),
            client_id: config.client_id,
            picker,
            torrent_tx: torrent_tx.clone(),
            disk,
            events,
            reader,
            extensions,
            tls,
            listen_port,
            info,
            config,
        });

        (
            Torrent {
                ctx,
                store,
                peers: HashMap::new(),
                available: Vec::new(),
                blacklist: HashMap::new(),
                bad_blocks: HashMap::new(),
                torrent_rx,
                trackers,
                choker,
                webseeds,
                departed: ThroughputStats::default(),
                last_pex: None,
                last_announce_refresh: None,
                start_time: None,
                completed_announced: false,
            },
            torrent_tx,
        )
    }

    #[tracing::instrument(skip_all, name = "torrent", fields(info_hash = %hex::encode(&self.ctx.info_hash[..4])))]
    pub async fn start(&mut self) -> Result<()> {

        tracing::info!("starting torrent");
        self.start_time = Some(Instant::now());
        self.ctx.events.emit(Event::new(EventPayload::TorrentStarted {
            info_hash: self.ctx.info_hash,
        }));

        // Resume: hash whatever is already on disk before creating files,
        // so a missing file skips instantly.
        let found = self.store.verify_existing(&self.ctx.reader).await;
        if found > 0 {
            self.ctx
                .picker
                .piece_picker
                .write()
                .await
                .set_own_bitfield(self.store.bitfield());
            if self.store.is_complete() {
                self.completed_announced = true;
                tracing::info!("torrent already complete, seeding");
            }
        }

        self.preallocate().await?;

        // Warm the mmap cache over the torrent's files when asked to.
        if self.ctx.config.disk.mmap_cache_warmup {
            let files = (0..self.ctx.info.files.len())
                .map(|i| (self.ctx.info.abs_path(i), 0))
                .collect();
            self.ctx.disk.warmup(files).await;
        }

        self.trackers.start(self.ctx.torrent_tx.clone()).await;
        self.announce(Some(crate::tracker::Event::Started));

        for url in self.webseeds.clone() {
            tokio::spawn(webseed_task(self.ctx.clone(), url));
        }

        self.run().await
    }

    async fn preallocate(&mut self) -> Result<()> {
        for (idx, file) in self.ctx.info.files.iter().enumerate() {
            self.ctx
                .disk
                .preallocate(self.ctx.info.abs_path(idx), file.length)
                .await?;
        }
        Ok(())
    }

    fn announce(&mut self, event: Option<crate::tracker::Event>) {
        let totals = self.throughput_totals();
        let downloaded = totals.down.total();
        let uploaded = totals.up.total();
        let left = self.bytes_left();

        // Only beg for peers while under the configured floor.
        let known = self.peers.len() + self.available.len();
        let network = &self.ctx.config.network;
        let num_want = if known < network.min_peers {
            network.max_peers.saturating_sub(known)
        } else {
            0
        };

        self.trackers.tracker_tx.send(Some(AnnounceParams {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            port: self.ctx.listen_port,
            uploaded,
            downloaded,
            left,
            event,
            num_want: Some(num_want),
        })).ok();
    }

    fn throughput_totals(&self) -> ThroughputStats {
        let mut totals = self.departed;
        for peer in self.peers.values() {
            totals.up += peer.state.throughput.up.total();
            totals.down += peer.state.throughput.down.total();
        }
        totals
    }

    fn bytes_left(&self) -> u64 {
        let missing = self.store.missing_count() as u64;
        // Close enough for announces; the final piece may be shorter.
        missing.saturating_mul(self.ctx.info.piece_len as u64)
            .min(self.ctx.info.total_len)
    }

    fn connect_to_peers(&mut self) {
        let now = Instant::now();
        self.blacklist.retain(|_, until| *until > now);

        let want = self
            .ctx
            .config
            .network
            .max_peers
            .saturating_sub(self.peers.len())
            .min(self.ctx.config.network.max_connect_rate);
        if want == 0 || self.available.is_empty() {
            return;
        }

        let count = want.min(self.available.len());
        tracing::debug!("connecting to {} peers", count);
        for address in self.available.drain(0..count) {
            if self.peers.contains_key(&address) || self.blacklist.contains_key(&address) {
                continue;
            }
            let handle = PeerHandle::start_session(address, self.ctx.clone(), None);
            self.peers.insert(address, handle);
        }
    }

    async fn run(&mut self) -> Result<()> {

        let listener = tokio::net::TcpListener::bind(
            SocketAddr::new(self.ctx.config.listen_address.ip(), self.ctx.listen_port),
        ).await?;
        tracing::info!("listening on {}", listener.local_addr()?);

        self.connect_to_peers();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        loop { tokio::select! {

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, address)) => {
                        if self.peers.len() >= self.ctx.config.network.max_peers
                            || self.blacklist.contains_key(&address)
                        {
                            tracing::debug!("rejecting inbound connection from {}", address);
                            continue;
                        }
                        let handle = PeerHandle::start_session(address, self.ctx.clone(), Some(stream));
                        self.peers.insert(address, handle);
                    }
                    Err(e) => tracing::warn!("inbound peer connection error: {}", e),
                }
            }

            Some(cmd) = self.torrent_rx.recv() => {
                if self.handle_command(cmd).await? {
                    return Ok(());
                }
            }

            _ = ticker.tick() => self.tick().await?,

        }}
    }

    async fn handle_command(&mut self, cmd: TorrentCommand) -> Result<bool> {
        match cmd {

            TorrentCommand::PeerConnected { address, id } => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.id = Some(id);
                }
            }

            TorrentCommand::PeerState { address, state } => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.state = state;
                }
            }

            TorrentCommand::PeerDisconnected { address, reason } => {
                if let Some(peer) = self.peers.remove(&address) {
                    self.departed.up += peer.state.throughput.up.total();
                    self.departed.down += peer.state.throughput.down.total();
                }
                if matches!(reason, DisconnectReason::ProtocolViolation | DisconnectReason::BadBlocks) {
                    self.blacklist.insert(address, Instant::now() + BLACKLIST_COOLDOWN);
                }
            }

            TorrentCommand::BlockReceived { address, block, cancels } => {
                for (peer, cancel) in cancels {
                    if let Some(handle) = self.peers.get(&peer) {
                        handle.peer_tx.send(PeerCommand::SendCancel(cancel)).ok();
                    }
                }
                self.apply_block(block, Some(address)).await?;
            }

            TorrentCommand::WebSeedPiece { piece_idx, data } => {
                self.apply_webseed_piece(piece_idx, data).await?;
            }

            TorrentCommand::VerifyResult(outcome) => {
                self.handle_verify(outcome).await?;
            }

            TorrentCommand::PeersDiscovered(peers) => {
                let connected: HashSet<SocketAddr> = self.peers.keys().copied().collect();
                for addr in peers {
                    if !connected.contains(&addr)
                        && !self.available.contains(&addr)
                        && !self.blacklist.contains_key(&addr)
                        && addr != WEBSEED_ADDR
                    {
                        self.available.push(addr);
                    }
                }
            }

            TorrentCommand::Shutdown => {
                self.shutdown().await?;
                return Ok(true);
            }

        }
        Ok(false)
    }

    async fn apply_block(&mut self, block: Block, from: Option<SocketAddr>) -> Result<()> {
        let piece_idx = block.piece_idx;
        match self.store.write_block(block, from) {
            Ok(crate::piece::WriteOutcome::PieceComplete) => {
                if let Some(job) = self.store.take_verify_job(piece_idx) {
                    let torrent_tx = self.ctx.torrent_tx.clone();
                    tokio::spawn(async move {
                        let outcome = job.run().await;
                        torrent_tx.send(TorrentCommand::VerifyResult(outcome)).ok();
                    });
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("dropping block for piece {}: {}", piece_idx, e),
        }
        Ok(())
    }

    // A web seed delivers whole pieces; run them through the same receive
    // path block by block so duplicates and cancels behave identically.
    async fn apply_webseed_piece(&mut self, piece_idx: usize, data: Vec<u8>) -> Result<()> {
        if piece_idx >= self.ctx.info.num_pieces as usize
            || data.len() != self.ctx.info.piece_len(piece_idx)
        {
            tracing::warn!("webseed delivered bad piece {}", piece_idx);
            return Ok(());
        }

        for (block_idx, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            let info = BlockInfo {
                piece_idx,
                offset: block_idx * BLOCK_SIZE,
                len: chunk.len(),
            };
            let receipt = self.ctx.picker.block_received(WEBSEED_ADDR, info).await;
            for (peer, cancel) in receipt.cancels {
                if let Some(handle) = self.peers.get(&peer) {
                    handle.peer_tx.send(PeerCommand::SendCancel(cancel)).ok();
                }
            }
            if !receipt.duplicate {
                self.apply_block(
                    Block { piece_idx, offset: info.offset, data: chunk.to_vec() },
                    None,
                ).await?;
            }
        }
        Ok(())
    }

    async fn handle_verify(&mut self, outcome: VerifyOutcome) -> Result<()> {
        let piece_idx = outcome.piece_idx;

        match self.store.apply_verify(&outcome) {

            PieceState::Verified => {
                self.ctx.picker.piece_done(piece_idx).await;
                for peer in self.peers.values() {
                    peer.peer_tx.send(PeerCommand::PieceWritten(piece_idx)).ok();
                }
                self.store.mark_available(piece_idx);

                let missing = self.store.missing_count();
                tracing::info!("piece {} verified, {} pieces remain", piece_idx, missing);
                if missing == 0 && !self.completed_announced {
                    self.completed_announced = true;
                    tracing::info!("torrent download complete, seeding");
                    self.ctx.events.emit(Event::new(EventPayload::TorrentCompleted {
                        info_hash: self.ctx.info_hash,
                    }));
                    self.announce(Some(crate::tracker::Event::Completed));
                }
            }

            PieceState::Paused => {
                self.ctx.picker.pause_piece(piece_idx).await;
            }

            _ => {
                self.ctx.picker.piece_failed(piece_idx).await;
                self.penalize_contributors(&outcome.contributors);
            }
        }
        Ok(())
    }

    fn penalize_contributors(&mut self, contributors: &[SocketAddr]) {
        let threshold = self.ctx.config.scheduler.bad_blocks_threshold;
        for addr in contributors {
            let count = self.bad_blocks.entry(*addr).or_insert(0);
            *count += 1;
            if *count >= threshold {
                tracing::warn!("peer {} crossed the bad-block threshold, dropping", addr);
                self.blacklist.insert(*addr, Instant::now() + BLACKLIST_COOLDOWN);
                if let Some(peer) = self.peers.get(addr) {
                    peer.peer_tx.send(PeerCommand::Shutdown).ok();
                }
            }
        }
    }

    async fn tick(&mut self) -> Result<()> {
        let now = Instant::now();

        // Missing -> Requested transitions planned by the scheduler.
        for idx in self.ctx.picker.drain_started() {
            self.store.note_requested(idx);
        }

        // Choke rounds.
        let seeding = self.store.is_complete();
        let infos: Vec<PeerChokeInfo> = self
            .peers
            .iter()
            .map(|(addr, peer)| PeerChokeInfo {
                addr: *addr,
                choked: peer.state.am_choking,
                interested: peer.state.peer_interested,
                down_rate: peer.state.throughput.down.avg(),
                up_rate: peer.state.throughput.up.avg(),
            })
            .collect();
        for action in self.choker.tick(now, &infos, seeding) {
            match action {
                ChokeAction::Choke(addr) => {
                    if let Some(peer) = self.peers.get(&addr) {
                        peer.peer_tx.send(PeerCommand::Choke).ok();
                    }
                }
                ChokeAction::Unchoke(addr) => {
                    if let Some(peer) = self.peers.get(&addr) {
                        peer.peer_tx.send(PeerCommand::Unchoke).ok();
                    }
                }
            }
        }

        // Request timeouts.
        let sweep = self.ctx.picker.sweep_timeouts(now).await;
        for (addr, block) in &sweep.expired {
            if let Some(peer) = self.peers.get(addr) {
                peer.peer_tx.send(PeerCommand::SendCancel(*block)).ok();
            }
        }
        for addr in &sweep.slow {
            if self.ctx.config.scheduler.slow_peer_disconnect {
                tracing::info!("disconnecting slow peer {}", addr);
                if let Some(peer) = self.peers.get(addr) {
                    peer.peer_tx.send(PeerCommand::Shutdown).ok();
                }
            } else {
                tracing::debug!("peer {} flagged slow", addr);
            }
        }

        // PEX gossip.
        let pex_due = self
            .last_pex
            .map_or(true, |at| now.duration_since(at) >= self.ctx.config.extensions.pex_interval);
        if pex_due && self.ctx.config.extensions.pex_enabled {
            self.last_pex = Some(now);
            let num_pieces = self.ctx.info.num_pieces as usize;
            let connected: Vec<PexPeer> = self
                .peers
                .iter()
                .map(|(addr, peer)| {
                    PexPeer::new(*addr, peer.state.num_pieces == num_pieces, true)
                })
                .collect();
            for peer in self.peers.values() {
                peer.peer_tx.send(PeerCommand::PexTick(connected.clone())).ok();
            }
        }

        // Refresh announce parameters so trackers re-announce on schedule.
        let refresh_due = self
            .last_announce_refresh
            .map_or(true, |at| now.duration_since(at) >= Duration::from_secs(30));
        if refresh_due {
            self.last_announce_refresh = Some(now);
            self.announce(None);
        }

        self.connect_to_peers();
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {

        tracing::info!("disconnecting from {} peers", self.peers.len());
        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::Shutdown).ok();
        }
        for peer in self.peers.values_mut() {
            if let Some(handle) = peer.session_handle.take() {
                if let Err(e) = handle.await {
                    tracing::warn!("session shutdown: {}", e);
                }
            }
        }
        self.peers.clear();

        self.announce(Some(crate::tracker::Event::Stopped));
        self.trackers.shutdown().await;

        // Wait (bounded) for in-flight block writes to land.
        let pending = self.store.drain_pending_writes();
        if !pending.is_empty() {
            let flush = async {
                for rx in pending {
                    rx.await.ok();
                }
            };
            if tokio::time::timeout(Duration::from_secs(10), flush).await.is_err() {
                tracing::warn!("timed out waiting for outstanding writes");
            }
        }

        // Release our mappings so the files can be moved or removed.
        for idx in 0..self.ctx.info.files.len() {
            self.ctx.disk.drop_mmap(&self.ctx.info.abs_path(idx));
        }

        self.ctx.events.emit(Event::new(EventPayload::TorrentStopped {
            info_hash: self.ctx.info_hash,
        }));
        if let Some(start) = self.start_time {
            tracing::info!("torrent stopped after {:?}", start.elapsed());
        }
        Ok(())
    }
}


// Treats an HTTP seed as a virtual peer that has everything and is never
// choked: keep asking the scheduler for work and fetch whole pieces.
async fn webseed_task(ctx: Arc<TorrentContext>, url: url::Url) {

    let mut seed = WebSeed::new(url.clone());
    let all = Bitfield::repeat(true, ctx.info.num_pieces as usize);
    let mut held: HashSet<BlockInfo> = HashSet::new();

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let requests = ctx.picker.pick_blocks(WEBSEED_ADDR, &held, &all).await;
        if requests.is_empty() {
            if ctx.picker.piece_picker.read().await.all() {
                tracing::debug!("webseed idle, torrent complete");
                return;
            }
            continue;
        }
        held.extend(requests.iter().copied());

        let pieces: HashSet<usize> = requests.iter().map(|b| b.piece_idx).collect();
        for piece_idx in pieces {
            match seed.fetch_piece(&ctx.info, piece_idx).await {
                Ok(data) => {
                    ctx.events.emit(Event::new(EventPayload::WebSeedDownloadSuccess {
                        url: url.to_string(),
                        piece_idx,
                    }));
                    held.retain(|b| b.piece_idx != piece_idx);
                    if ctx
                        .torrent_tx
                        .send(TorrentCommand::WebSeedPiece { piece_idx, data })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("webseed fetch failed: {}", e);
                    ctx.events.emit(Event::new(EventPayload::WebSeedDownloadFailed {
                        url: url.to_string(),
                        error: e.to_string(),
                    }));
                    let freed: Vec<BlockInfo> =
                        held.iter().filter(|b| b.piece_idx == piece_idx).copied().collect();
                    ctx.picker.free_peer_requests(WEBSEED_ADDR, freed.iter()).await;
                    held.retain(|b| b.piece_idx != piece_idx);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}
