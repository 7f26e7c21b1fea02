use std::collections::HashSet;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::Framed;
use crate::{
    block::{Block, BlockInfo},
    buffers::RingBuffer,
    events::{DisconnectReason, Event, EventPayload},
    ext::{pex::{PexMessage, PexPeer, PexTracker}, ssl::{SslDisposition, SslMessage, SslNegotiation}, PEX_NAME, SSL_NAME},
    picker::allowed_fast_set,
    torrent::{TorrentCommand, TorrentContext},
    Bitfield,
};
use super::{*, handshake::*, state::*};

// Pieces granted to a choked peer via allowed-fast.
const ALLOWED_FAST_COUNT: usize = 10;

const CONNECT_TIMEOUT: time::Duration = time::Duration::from_secs(10);

// Anything that can carry the peer wire, before or after a TLS upgrade.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type Conn = Box<dyn AsyncStream>;

enum Verdict {
    Stopped,
    Upgrade { server: bool },
}

pub struct PeerSession {

    // The peer's address; with the info hash, the session's identity.
    address: SocketAddr,

    // Read-only torrent state shared by all sessions.
    ctx: Arc<TorrentContext>,

    peer_rx: PeerRx,

    // Kept for handing to disk-read tasks.
    peer_tx: PeerTx,

    state: SessionState,

    // Pieces the peer advertises.
    bitfield: Bitfield,

    // Receive path: raw bytes land here and frames are parsed out in place.
    ring: RingBuffer,

    // Send path: frames are coalesced here and flushed in one write.
    out: BytesMut,

    // Blocks we asked the peer for (the request window).
    pending: HashSet<BlockInfo>,

    // Blocks the peer asked us for.
    peer_requests: HashSet<BlockInfo>,

    // Fast extension grants, both directions.
    allowed_fast_out: HashSet<u32>,
    allowed_fast_in: HashSet<u32>,

    // The peer's extended handshake, once received.
    peer_exts: Option<crate::ext::PeerExtensions>,

    ssl: SslNegotiation,

    pex: PexTracker,

    // Bitfield (or have_all/have_none) is only legal as the first message.
    introducing: bool,

    // Post-handshake burst already sent; a TLS upgrade must not repeat it.
    greeted: bool,

    // We initiated the connection (and therefore SSL negotiation).
    initiator: bool,

    max_frame: usize,

    last_rx: Instant,
    last_tx: Instant,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let num_pieces = ctx.info.num_pieces as usize;
        let bitfield = Bitfield::repeat(false, num_pieces);

        // The ring must hold the largest legal frame in one piece.
        let ring_capacity = (128 * 1024).max(num_pieces / 8 + 4096);
        let max_frame = ctx.config.network.max_frame_size.min(ring_capacity - 4);

        let ssl = SslNegotiation::new(
            ctx.config.extensions.ssl_opportunistic,
            ctx.tls.as_ref().map_or(false, |tls| tls.acceptor.is_some()),
        );

        (
            PeerSession {
                address,
                peer_rx,
                peer_tx: peer_tx.clone(),
                state: SessionState::default(),
                bitfield,
                ring: RingBuffer::new(ring_capacity),
                out: BytesMut::with_capacity(16 * 1024),
                pending: HashSet::new(),
                peer_requests: HashSet::new(),
                allowed_fast_out: HashSet::new(),
                allowed_fast_in: HashSet::new(),
                peer_exts: None,
                ssl,
                pex: PexTracker::default(),
                introducing: true,
                greeted: false,
                initiator: false,
                max_frame,
                last_rx: Instant::now(),
                last_tx: Instant::now(),
                ctx,
            },
            peer_tx,
        )
    }

    pub async fn start(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Connecting);
        self.initiator = inbound_stream.is_none();
        let inbound = inbound_stream.is_some();
        let mut socket = match inbound_stream {
            Some(stream) => Framed::new(stream, HandshakeCodec),
            None => {
                let stream = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.address))
                    .await
                    .map_err(|_| PeerError::Timeout)??;
                tracing::trace!("outbound connection successful");
                Framed::new(stream, HandshakeCodec)
            }
        };

        self.exchange_handshake(&mut socket, inbound).await?;

        // Bytes that followed the handshake in the same read belong to the
        // message stream.
        let parts = socket.into_parts();
        if !parts.read_buf.is_empty() {
            self.ring.write(&parts.read_buf);
        }
        let conn: Conn = Box::new(parts.io);
        self.run(conn).await
    }

    pub async fn disconnect(&mut self, reason: DisconnectReason) {
        self.state.update(|state| state.conn_state = ConnState::Closing);

        // Give outstanding requests back to the scheduler and unwind our
        // contribution to the rarity histogram.
        self.ctx.picker.free_peer_requests(self.address, self.pending.iter()).await;
        self.pending.clear();
        self.ctx.picker.piece_picker.write().await.peer_gone(&self.bitfield);
        self.bitfield.fill(false);

        self.ctx.events.emit(Event::new(EventPayload::PeerDisconnected {
            address: self.address,
            reason,
        }));
        self.ctx
            .torrent_tx
            .send(TorrentCommand::PeerDisconnected { address: self.address, reason })
            .ok();
    }

    async fn exchange_handshake(
        &mut self,
        socket: &mut Framed<TcpStream, HandshakeCodec>,
        inbound: bool,
    ) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let fast = self.ctx.config.extensions.fast_enabled;
        let extensions = !self.ctx.extensions.is_empty();
        let ours = Handshake::new(self.ctx.info_hash, self.ctx.client_id, extensions, fast);

        if !inbound {
            tracing::debug!("send handshake");
            socket.send(ours).await?;
        }

        tracing::trace!("waiting for handshake");
        let Some(Ok(theirs)) = socket.next().await else {
            return Err(PeerError::NoHandshake);
        };
        tracing::debug!("read: {:?}", theirs);

        if theirs.protocol != PROTOCOL {
            return Err(PeerError::IncorrectProtocol);
        }
        if theirs.info_hash != self.ctx.info_hash {
            return Err(PeerError::IncorrectInfoHash);
        }

        if inbound {
            let ours = Handshake::new(self.ctx.info_hash, self.ctx.client_id, extensions, fast);
            socket.send(ours).await?;
        }

        self.state.update(|state| {
            state.peer_extension_protocol = theirs.supports_extension_protocol() && extensions;
            state.peer_fast = theirs.supports_fast() && fast;
        });

        tracing::debug!("handshake successful, peer connected");
        self.ctx.events.emit(Event::new(EventPayload::PeerHandshakeComplete {
            address: self.address,
        }));
        self.ctx.torrent_tx.send(TorrentCommand::PeerConnected {
            address: self.address,
            id: theirs.peer_id,
        })?;
        Ok(())
    }

    async fn run(&mut self, mut conn: Conn) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Established);
        self.last_rx = Instant::now();
        self.last_tx = Instant::now();

        loop {
            let (mut rd, mut wr) = tokio::io::split(conn);
            match self.drive(&mut rd, &mut wr).await? {
                Verdict::Stopped => {
                    tracing::debug!("session shutdown");
                    return Ok(());
                }
                Verdict::Upgrade { server } => {
                    let plain = rd.unsplit(wr);
                    conn = self.upgrade_tls(plain, server).await?;
                    self.ssl.secured();
                    self.ctx.events.emit(Event::new(EventPayload::SslUpgraded {
                        address: self.address,
                    }));
                    tracing::info!("stream upgraded to tls");
                }
            }
        }
    }

    // The established-session loop: read frames, apply commands, tick
    // timers. Returns on shutdown or when the stream must be upgraded.
    async fn drive(
        &mut self,
        rd: &mut ReadHalf<Conn>,
        wr: &mut WriteHalf<Conn>,
    ) -> Result<Verdict> {

        if !self.greeted {
            self.greeted = true;
            self.queue_post_handshake().await;
            self.flush(wr).await?;
        }

        let mut ticker = time::interval(time::Duration::from_secs(1));
        let mut chunk = vec![0u8; 32 * 1024];

        loop {
            tokio::select! {

                read = rd.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Err(PeerError::ConnectionClosed);
                    }
                    self.last_rx = Instant::now();
                    let control = self.ingest(&chunk[..n]).await?;
                    self.flush(wr).await?;
                    if let Some(Control::Upgrade { server }) = control {
                        return Ok(Verdict::Upgrade { server });
                    }
                }

                Some(cmd) = self.peer_rx.recv() => {
                    let stop = self.handle_command(cmd).await?;
                    self.flush(wr).await?;
                    if stop {
                        return Ok(Verdict::Stopped);
                    }
                }

                tick = ticker.tick() => {
                    self.tick(tick.into_std()).await?;
                    self.flush(wr).await?;
                }

            }
        }
    }

    // Appends pending frames to the wire in one write; messages queued in
    // the same event are coalesced into a single syscall.
    async fn flush(&mut self, wr: &mut WriteHalf<Conn>) -> Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        wr.write_all(&self.out).await?;
        self.out.clear();
        self.last_tx = Instant::now();
        Ok(())
    }

    fn queue(&mut self, msg: Message) {
        tracing::trace!("send: {}", msg);
        msg.encode(&mut self.out);
    }

    // Extended handshake, our bitfield and the allowed-fast grants.
    async fn queue_post_handshake(&mut self) {

        if self.state.peer_extension_protocol {
            let payload = self.ctx.extensions.handshake_payload(
                self.ctx.listen_port,
                self.ctx.picker.window(),
            );
            self.queue(Message::Extended { ext_id: 0, payload });
        }

        let own = self.ctx.picker.piece_picker.read().await.own_bitfield().clone();
        if self.state.peer_fast && own.all() {
            self.queue(Message::HaveAll);
        } else if self.state.peer_fast && own.not_any() {
            self.queue(Message::HaveNone);
        } else if own.any() {
            self.queue(Message::Bitfield(own));
        }

        if self.state.peer_fast {
            let grants = allowed_fast_set(
                &self.ctx.info_hash,
                self.address.ip(),
                self.ctx.info.num_pieces,
                ALLOWED_FAST_COUNT,
            );
            for idx in grants {
                self.allowed_fast_out.insert(idx);
                self.queue(Message::AllowedFast { idx });
            }
        }
    }

    // Feeds raw bytes through the ring and handles every complete frame.
    async fn ingest(&mut self, mut data: &[u8]) -> Result<Option<Control>> {
        loop {
            let written = self.ring.write(data);
            data = &data[written..];

            while let Some(msg) = Message::decode(&mut self.ring, self.max_frame)? {
                if let Some(control) = self.handle_msg(msg).await? {
                    // On an upgrade the rest of the bytes belong to TLS;
                    // stash them so the handshake sees them.
                    while !data.is_empty() {
                        let n = self.ring.write(data);
                        if n == 0 {
                            return Err(PeerError::OversizedMessage(self.ring.capacity()));
                        }
                        data = &data[n..];
                    }
                    return Ok(Some(control));
                }
            }

            if data.is_empty() {
                return Ok(None);
            }
            if written == 0 {
                // A frame bigger than the ring can never complete.
                return Err(PeerError::OversizedMessage(self.ring.capacity()));
            }
        }
    }

    async fn handle_msg(&mut self, msg: Message) -> Result<Option<Control>> {
        tracing::trace!("read: {}", msg);

        // The bitfield family is only legal directly after the handshake;
        // keep-alives and the extended handshake may precede it.
        let introducing = self.introducing;
        if !matches!(msg, Message::KeepAlive | Message::Extended { .. }) {
            self.introducing = false;
        }

        match msg {

            Message::KeepAlive => {}

            Message::Bitfield(bitfield) => {
                if introducing {
                    self.apply_bitfield(bitfield).await?;
                } else {
                    // Late bitfields are ignored, not fatal.
                    tracing::warn!("ignoring bitfield mid-session");
                }
            }

            Message::HaveAll => {
                if !self.state.peer_fast {
                    return Err(PeerError::InvalidMessage);
                }
                if introducing {
                    let all = Bitfield::repeat(true, self.ctx.info.num_pieces as usize);
                    self.apply_bitfield(all).await?;
                }
            }

            Message::HaveNone => {
                if !self.state.peer_fast {
                    return Err(PeerError::InvalidMessage);
                }
                // Nothing to apply; the empty bitfield is the default.
            }

            Message::Have { idx } => self.handle_have(idx).await?,

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = true);
                    self.handle_peer_choke().await;
                }
            }

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = false);
                    if self.state.am_interested {
                        self.make_requests().await;
                    }
                }
            }

            Message::Interested => {
                if !self.state.peer_interested {
                    self.state.update(|state| state.peer_interested = true);
                }
            }

            Message::NotInterested => {
                if self.state.peer_interested {
                    self.state.update(|state| state.peer_interested = false);
                }
            }

            Message::Block(block) => {
                self.handle_block(block).await?;
                self.make_requests().await;
            }

            Message::Request(request) => self.handle_request(request)?,

            Message::Cancel(request) => {
                self.peer_requests.remove(&request);
            }

            Message::RejectRequest(request) => {
                if !self.state.peer_fast {
                    return Err(PeerError::InvalidMessage);
                }
                if self.pending.remove(&request) {
                    self.ctx
                        .picker
                        .free_peer_requests(self.address, std::iter::once(&request))
                        .await;
                }
            }

            Message::AllowedFast { idx } => {
                if !self.state.peer_fast {
                    return Err(PeerError::InvalidMessage);
                }
                if idx < self.ctx.info.num_pieces {
                    self.allowed_fast_in.insert(idx);
                    // Granted pieces are requestable right away, choked or
                    // not.
                    if self.state.am_interested && self.state.peer_choking {
                        self.make_requests().await;
                    }
                }
            }

            Message::SuggestPiece { idx } => {
                tracing::trace!("peer suggests piece {}", idx);
            }

            Message::Port { port } => {
                self.state.update(|state| state.dht_port = Some(port));
            }

            Message::Extended { ext_id, payload } => {
                return self.handle_extended(ext_id, payload).await;
            }
        }

        Ok(None)
    }

    async fn apply_bitfield(&mut self, mut bitfield: Bitfield) -> Result<()> {
        let num_pieces = self.ctx.info.num_pieces as usize;
        if bitfield.len() < num_pieces {
            return Err(PeerError::InvalidMessage);
        }
        // Trailing pad bits must be zero-extended away.
        bitfield.resize(num_pieces, false);
        tracing::debug!("peer has {}/{} pieces", bitfield.count_ones(), num_pieces);

        let interested = self
            .ctx
            .picker
            .piece_picker
            .write()
            .await
            .bitfield_update(&bitfield);
        self.state.update(|state| state.num_pieces = bitfield.count_ones() as usize);
        self.bitfield = bitfield;
        self.update_interest(interested).await;
        Ok(())
    }

    async fn handle_have(&mut self, idx: u32) -> Result<()> {
        if idx >= self.ctx.info.num_pieces {
            tracing::warn!("have msg with invalid idx: {}", idx);
            return Err(PeerError::InvalidMessage);
        }
        // A repeated have from the same peer must not move the histogram.
        if self.bitfield[idx as usize] {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.state.update(|state| state.num_pieces += 1);

        let interested = self
            .ctx
            .picker
            .piece_picker
            .write()
            .await
            .increment_piece(idx as usize);
        self.update_interest(interested).await;
        Ok(())
    }

    // A choke implicitly cancels our outstanding requests, except those in
    // the allowed-fast set when the peer speaks the fast extension; those
    // the peer must reject explicitly.
    async fn handle_peer_choke(&mut self) {
        let freed: Vec<BlockInfo> = if self.state.peer_fast {
            self.pending
                .iter()
                .filter(|b| !self.allowed_fast_in.contains(&(b.piece_idx as u32)))
                .copied()
                .collect()
        } else {
            self.pending.iter().copied().collect()
        };

        self.ctx.picker.free_peer_requests(self.address, freed.iter()).await;
        for block in &freed {
            self.pending.remove(block);
        }
    }

    async fn handle_block(&mut self, block: Block) -> Result<()> {
        let info = block.info();
        if !info.is_valid(&self.ctx.info) {
            return Err(PeerError::InvalidMessage);
        }
        if !self.pending.remove(&info) {
            // Arrived after a cancel or timeout; the data is still usable.
            tracing::trace!("unrequested block: {:?}", info);
        }

        let receipt = self.ctx.picker.block_received(self.address, info).await;
        if receipt.duplicate {
            tracing::trace!("duplicate block: {:?}", info);
            return Ok(());
        }

        self.state.update(|state| state.throughput.down += block.data.len() as u64);
        self.ctx.torrent_tx.send(TorrentCommand::BlockReceived {
            address: self.address,
            block,
            cancels: receipt.cancels,
        })?;
        Ok(())
    }

    fn handle_request(&mut self, request: BlockInfo) -> Result<()> {

        if !request.is_valid(&self.ctx.info) {
            tracing::warn!("invalid request: {:?}", request);
            return Err(PeerError::InvalidMessage);
        }

        if self.state.am_choking {
            let allowed = self.state.peer_fast
                && self.allowed_fast_out.contains(&(request.piece_idx as u32));
            if !allowed {
                if self.state.peer_fast {
                    self.queue(Message::RejectRequest(request));
                } else {
                    tracing::warn!("request while choked, ignoring");
                }
                return Ok(());
            }
        }

        if !self.peer_requests.insert(request) {
            tracing::warn!("duplicate request: {:?}", request);
            return Ok(());
        }

        // Serve from a detached task so a disk stall can't block the
        // session loop.
        let ctx = self.ctx.clone();
        let peer_tx = self.peer_tx.clone();
        tokio::spawn(async move {
            match ctx.reader.read_block(request).await {
                Ok(data) => {
                    peer_tx
                        .send(PeerCommand::BlockRead(Block {
                            piece_idx: request.piece_idx,
                            offset: request.offset,
                            data,
                        }))
                        .ok();
                }
                Err(e) => tracing::error!("block read for upload failed: {}", e),
            }
        });
        Ok(())
    }

    async fn handle_extended(&mut self, ext_id: u8, payload: Vec<u8>) -> Result<Option<Control>> {

        if !self.state.peer_extension_protocol {
            return Err(PeerError::InvalidMessage);
        }

        // Id 0 is the extended handshake itself.
        if ext_id == 0 {
            let exts = crate::ext::PeerExtensions::parse(&payload)
                .map_err(|_| PeerError::InvalidMessage)?;
            tracing::debug!("peer extensions: {:?}", exts.names());
            self.ctx.events.emit(Event::new(EventPayload::ExtensionHandshake {
                address: self.address,
                extensions: exts.names(),
            }));

            // Initiate the SSL upgrade once we know the peer's ids.
            if self.initiator
                && self.ctx.config.extensions.ssl_peers_enabled
                && self.ctx.tls.is_some()
                && !self.ssl.is_secured()
            {
                if let Some(remote_id) = exts.remote_id(SSL_NAME) {
                    let request = self.ssl.begin();
                    self.queue(Message::Extended {
                        ext_id: remote_id,
                        payload: request.encode().to_vec(),
                    });
                }
            }
            self.peer_exts = Some(exts);
            return Ok(None);
        }

        // Inbound messages carry the ids we assigned in our own handshake.
        match self.ctx.extensions.name_for(ext_id) {
            Some(PEX_NAME) => {
                let msg = PexMessage::decode(&payload).map_err(|_| PeerError::InvalidMessage)?;
                tracing::debug!("pex: {} added, {} dropped", msg.added.len(), msg.dropped.len());
                for peer in &msg.added {
                    self.ctx.events.emit(Event::new(EventPayload::PeerDiscovered {
                        address: peer.addr,
                        source: "pex",
                    }));
                }
                let added = msg.added.iter().map(|p| p.addr).collect();
                self.ctx.torrent_tx.send(TorrentCommand::PeersDiscovered(added))?;
            }
            Some(SSL_NAME) => {
                let msg = SslMessage::decode(&payload).map_err(|_| PeerError::InvalidMessage)?;
                return self.handle_ssl(msg);
            }
            _ => {
                tracing::debug!("unknown extension message id {}", ext_id);
                self.ctx.events.emit(Event::new(EventPayload::UnknownExtensionMessage {
                    address: self.address,
                    ext_id,
                }));
            }
        }
        Ok(None)
    }

    fn handle_ssl(&mut self, msg: SslMessage) -> Result<Option<Control>> {
        let Some(remote_id) = self
            .peer_exts
            .as_ref()
            .and_then(|e| e.remote_id(SSL_NAME))
        else {
            // The m dict is authoritative; no entry, no negotiation.
            return Ok(None);
        };

        match self.ssl.on_message(msg) {
            SslDisposition::Send(reply) => {
                self.ctx.events.emit(Event::new(EventPayload::SslRejected {
                    address: self.address,
                }));
                self.queue(Message::Extended {
                    ext_id: remote_id,
                    payload: reply.encode().to_vec(),
                });
                Ok(None)
            }
            SslDisposition::AcceptAndUpgrade(reply) => {
                self.queue(Message::Extended {
                    ext_id: remote_id,
                    payload: reply.encode().to_vec(),
                });
                Ok(Some(Control::Upgrade { server: true }))
            }
            SslDisposition::Upgrade => Ok(Some(Control::Upgrade { server: false })),
            SslDisposition::Fallback => {
                self.ctx.events.emit(Event::new(EventPayload::SslRejected {
                    address: self.address,
                }));
                Ok(None)
            }
            SslDisposition::Close => Err(PeerError::TlsFailed("peer rejected upgrade".into())),
            SslDisposition::Ignore => Ok(None),
        }
    }

    async fn handle_command(&mut self, cmd: PeerCommand) -> Result<bool> {
        match cmd {

            PeerCommand::PieceWritten(idx) => {
                if !self.bitfield[idx] {
                    self.queue(Message::Have { idx: idx as u32 });
                } else {
                    // Both sides have it now; withdraw anything dangling.
                    let stale: Vec<BlockInfo> = self
                        .pending
                        .iter()
                        .filter(|b| b.piece_idx == idx)
                        .copied()
                        .collect();
                    for block in stale {
                        self.pending.remove(&block);
                        self.queue(Message::Cancel(block));
                    }
                }
            }

            PeerCommand::BlockRead(block) => {
                let info = block.info();
                if self.peer_requests.remove(&info) {
                    self.state.update(|state| state.throughput.up += block.data.len() as u64);
                    self.queue(Message::Block(block));
                } else {
                    // Cancelled while the read was in flight.
                    tracing::trace!("block read but no request: {:?}", info);
                }
            }

            PeerCommand::SendCancel(block) => {
                if self.pending.remove(&block) {
                    self.queue(Message::Cancel(block));
                }
            }

            PeerCommand::Choke => {
                if !self.state.am_choking {
                    self.state.update(|state| state.am_choking = true);
                    self.queue(Message::Choke);
                    // With the fast extension every pending request gets an
                    // explicit reject.
                    let dangling: Vec<BlockInfo> = self.peer_requests.drain().collect();
                    if self.state.peer_fast {
                        for request in dangling {
                            self.queue(Message::RejectRequest(request));
                        }
                    }
                }
            }

            PeerCommand::Unchoke => {
                if self.state.am_choking {
                    self.state.update(|state| state.am_choking = false);
                    self.queue(Message::Unchoke);
                }
            }

            PeerCommand::PexTick(connected) => {
                if let Some(remote_id) = self
                    .peer_exts
                    .as_ref()
                    .and_then(|e| e.remote_id(PEX_NAME))
                {
                    let connected: Vec<PexPeer> = connected
                        .into_iter()
                        .filter(|p| p.addr != self.address)
                        .collect();
                    if let Some(delta) = self.pex.delta(&connected) {
                        self.queue(Message::Extended {
                            ext_id: remote_id,
                            payload: delta.encode(),
                        });
                    }
                }
            }

            PeerCommand::Shutdown => return Ok(true),
        }
        Ok(false)
    }

    async fn make_requests(&mut self) {

        if !self.state.am_interested {
            return;
        }

        let requests = if !self.state.peer_choking {
            self.ctx
                .picker
                .pick_blocks(self.address, &self.pending, &self.bitfield)
                .await
        } else if self.state.peer_fast && !self.allowed_fast_in.is_empty() {
            // Allowed-fast pieces may be requested while choked.
            let mut mask = Bitfield::repeat(false, self.bitfield.len());
            for &idx in &self.allowed_fast_in {
                if (idx as usize) < mask.len() && self.bitfield[idx as usize] {
                    mask.set(idx as usize, true);
                }
            }
            self.ctx
                .picker
                .pick_blocks(self.address, &self.pending, &mask)
                .await
        } else {
            return;
        };

        for block in requests {
            self.pending.insert(block);
            self.queue(Message::Request(block));
        }
    }

    // We become interested the moment the peer has a piece we lack, and
    // say so; losing interest is announced too.
    async fn update_interest(&mut self, interested: bool) {
        if !self.state.am_interested && interested {
            self.state.update(|state| state.am_interested = true);
            self.queue(Message::Interested);
            self.make_requests().await;
        } else if self.state.am_interested && !interested {
            self.state.update(|state| state.am_interested = false);
            self.queue(Message::NotInterested);
        }
    }

    async fn tick(&mut self, now: Instant) -> Result<()> {

        if now.duration_since(self.last_rx) >= self.ctx.config.network.idle_disconnect {
            tracing::info!("disconnecting idle peer");
            return Err(PeerError::Timeout);
        }

        if now.duration_since(self.last_tx) >= self.ctx.config.network.keepalive {
            self.queue(Message::KeepAlive);
        }

        if let Some(disposition) = self.ssl.check_timeout(now) {
            if disposition == SslDisposition::Close {
                return Err(PeerError::TlsFailed("negotiation timed out".into()));
            }
        }

        if self.state.changed {
            self.state.changed = false;
            self.ctx.torrent_tx.send(TorrentCommand::PeerState {
                address: self.address,
                state: self.state,
            })?;
        }
        self.state.tick();
        Ok(())
    }

    async fn upgrade_tls(&mut self, plain: Conn, server: bool) -> Result<Conn> {

        let tls = self
            .ctx
            .tls
            .as_ref()
            .ok_or_else(|| PeerError::TlsFailed("no tls context installed".into()))?;

        // Bytes already pulled into the ring belong to the TLS handshake.
        let buffered = self.ring.read(self.ring.len());
        let plain: Conn = Box::new(Prefixed::new(buffered, plain));

        if server {
            let acceptor = tls
                .acceptor
                .clone()
                .ok_or_else(|| PeerError::TlsFailed("no tls acceptor installed".into()))?;
            let stream = acceptor
                .accept(plain)
                .await
                .map_err(|e| PeerError::TlsFailed(e.to_string()))?;
            Ok(Box::new(stream))
        } else {
            let name = rustls::ServerName::IpAddress(self.address.ip());
            let stream = tls
                .connector
                .connect(name, plain)
                .await
                .map_err(|e| PeerError::TlsFailed(e.to_string()))?;
            Ok(Box::new(stream))
        }
    }
}

enum Control {
    Upgrade { server: bool },
}

// Replays buffered bytes before reading from the inner stream; writes pass
// straight through.
struct Prefixed<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Prefixed<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self { prefix, pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let n = (self.prefix.len() - self.pos).min(buf.remaining());
            let pos = self.pos;
            buf.put_slice(&self.prefix[pos..pos + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
