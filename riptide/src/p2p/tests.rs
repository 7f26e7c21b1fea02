use std::sync::Arc;
use std::time::Duration;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tempfile::TempDir;
use crate::{
    buffers::RingBuffer,
    config::Config,
    disk::DiskManager,
    events::{DisconnectReason, EventBus, EventKind, EventPayload},
    ext::ExtensionRegistry,
    picker::Picker,
    piece::PieceReader,
    store::{FileInfo, StoreInfo},
    torrent::{TorrentCommand, TorrentContext, TorrentRx},
    Bitfield,
};
use super::{*, handshake::PROTOCOL, message::Message};

struct Fixture {
    ctx: Arc<TorrentContext>,
    torrent_rx: TorrentRx,
    _disk: DiskManager,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let num_pieces = 4u32;
    let piece_len = crate::BLOCK_SIZE * 2;

    let mut config = Config::default();
    // Keep the wire minimal: base protocol only.
    config.extensions.fast_enabled = false;
    config.extensions.pex_enabled = false;
    config.extensions.ssl_peers_enabled = false;
    config.extensions.webseed_enabled = false;
    config.output_dir = dir.path().to_path_buf();

    let info = StoreInfo {
        total_len: (num_pieces as u64) * piece_len as u64,
        piece_len,
        last_piece_len: piece_len,
        num_pieces,
        files: vec![FileInfo {
            path: "data.bin".into(),
            length: (num_pieces as u64) * piece_len as u64,
            offset: 0,
            md5sum: None,
        }],
        output_dir: dir.path().to_path_buf(),
    };

    let disk = DiskManager::start(config.disk.clone());
    let (events, _bus) = EventBus::start(&config.event_bus);
    let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();

    let ctx = Arc::new(TorrentContext {
        info_hash: [7; 20],
        client_id: *b"-RP0010-abcdefghijkl",
        picker: Picker::new(num_pieces, piece_len, piece_len, config.scheduler.clone()),
        torrent_tx,
        disk: disk.handle(),
        events,
        reader: PieceReader::new(info.clone(), disk.handle(), 8, 0),
        extensions: ExtensionRegistry::new(&config.extensions),
        tls: None,
        listen_port: 0,
        info,
        config,
    });

    Fixture { ctx, torrent_rx, _disk: disk, _dir: dir }
}

fn raw_handshake(info_hash: [u8; 20]) -> Vec<u8> {
    let mut out = vec![19];
    out.extend_from_slice(&PROTOCOL);
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(&info_hash);
    out.extend_from_slice(b"-XX0001-000000000000");
    out
}

// Reads wire messages from the remote end of the session under test.
struct RemotePeer {
    stream: TcpStream,
    ring: RingBuffer,
}

impl RemotePeer {

    async fn accept_and_handshake(listener: TcpListener, info_hash: [u8; 20]) -> Self {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut their_handshake = [0u8; 68];
        stream.read_exact(&mut their_handshake).await.unwrap();
        assert_eq!(their_handshake[0], 19);
        assert_eq!(&their_handshake[28..48], &info_hash);

        stream.write_all(&raw_handshake(info_hash)).await.unwrap();
        Self {
            stream,
            ring: RingBuffer::new(256 * 1024),
        }
    }

    async fn send(&mut self, msg: Message) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        self.stream.write_all(&buf).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        loop {
            if let Some(msg) = Message::decode(&mut self.ring, 1024 * 1024).unwrap() {
                return msg;
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "session closed unexpectedly");
            self.ring.write(&chunk[..n]);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_rejected_on_info_hash_mismatch() {
    let fixture = fixture();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let mut handle = PeerHandle::start_session(address, fixture.ctx.clone(), None);

    let (mut stream, _) = listener.accept().await.unwrap();
    let mut their_handshake = [0u8; 68];
    stream.read_exact(&mut their_handshake).await.unwrap();

    // Reply with an info hash that differs in a single bit.
    let mut bad_hash = fixture.ctx.info_hash;
    bad_hash[0] ^= 0x01;
    stream.write_all(&raw_handshake(bad_hash)).await.unwrap();

    // The session must close without sending anything further.
    tokio::time::timeout(Duration::from_secs(5), handle.session_handle.take().unwrap())
        .await
        .expect("session did not close")
        .unwrap();

    let mut post = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut post))
        .await
        .expect("read blocked")
        .unwrap();
    assert_eq!(n, 0, "session sent data after a mismatched handshake");

    // Disconnect reason is reported on both channels.
    let mut torrent_rx = fixture.torrent_rx;
    let mut saw_disconnect = false;
    while let Ok(cmd) = torrent_rx.try_recv() {
        if let TorrentCommand::PeerDisconnected { reason, .. } = cmd {
            assert_eq!(reason, DisconnectReason::InfoHashMismatch);
            saw_disconnect = true;
        }
    }
    assert!(saw_disconnect);

    let replay = fixture.ctx.events.replay(Some(EventKind::PeerDisconnected), 10);
    assert_eq!(replay.len(), 1);
    match &replay[0].payload {
        EventPayload::PeerDisconnected { reason, .. } => {
            assert_eq!(*reason, DisconnectReason::InfoHashMismatch);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_requests_after_bitfield_and_unchoke() {
    let fixture = fixture();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let _handle = PeerHandle::start_session(address, fixture.ctx.clone(), None);
    let mut remote = RemotePeer::accept_and_handshake(listener, fixture.ctx.info_hash).await;

    // Advertise everything; the session must become interested.
    let bitfield = Bitfield::repeat(true, fixture.ctx.info.num_pieces as usize);
    remote.send(Message::Bitfield(bitfield)).await;
    assert_eq!(remote.recv().await, Message::Interested);

    // Unchoking opens the request window; the whole torrent is 8 blocks,
    // all of which fit inside it.
    remote.send(Message::Unchoke).await;
    let mut requests = Vec::new();
    for _ in 0..8 {
        match remote.recv().await {
            Message::Request(block) => requests.push(block),
            other => panic!("expected request, got {}", other),
        }
    }
    let distinct: std::collections::HashSet<_> = requests.iter().collect();
    assert_eq!(distinct.len(), 8);

    // Serve one block; the session reports it upstream.
    let first = requests[0];
    remote
        .send(Message::Block(crate::block::Block {
            piece_idx: first.piece_idx,
            offset: first.offset,
            data: vec![0xab; first.len],
        }))
        .await;

    let mut torrent_rx = fixture.torrent_rx;
    let received = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match torrent_rx.recv().await.expect("torrent channel closed") {
                TorrentCommand::BlockReceived { block, .. } => return block,
                _ => continue,
            }
        }
    })
    .await
    .expect("block never reported");
    assert_eq!(received.info(), first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_serves_requests_when_unchoked() {
    let fixture = fixture();

    // Pretend we already have piece 0 on disk.
    let content = vec![0x5a; fixture.ctx.info.piece_len];
    std::fs::write(fixture.ctx.info.abs_path(0), &content).unwrap();
    {
        let mut picker = fixture.ctx.picker.piece_picker.write().await;
        let mut own = Bitfield::repeat(false, fixture.ctx.info.num_pieces as usize);
        own.set(0, true);
        picker.set_own_bitfield(own);
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let handle = PeerHandle::start_session(address, fixture.ctx.clone(), None);
    let mut remote = RemotePeer::accept_and_handshake(listener, fixture.ctx.info_hash).await;

    // The session opens with its bitfield.
    match remote.recv().await {
        Message::Bitfield(bf) => assert!(bf[0]),
        other => panic!("expected bitfield, got {}", other),
    }

    // Choker grants an unchoke, then the peer requests a block.
    remote.send(Message::Interested).await;
    handle.peer_tx.send(PeerCommand::Unchoke).unwrap();
    assert_eq!(remote.recv().await, Message::Unchoke);

    let request = crate::block::BlockInfo { piece_idx: 0, offset: 0, len: crate::BLOCK_SIZE };
    remote.send(Message::Request(request)).await;

    match remote.recv().await {
        Message::Block(block) => {
            assert_eq!(block.info(), request);
            assert_eq!(block.data, &content[..crate::BLOCK_SIZE]);
        }
        other => panic!("expected block, got {}", other),
    }
}
