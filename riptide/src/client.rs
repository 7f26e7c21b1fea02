use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use crate::{
    config::Config,
    disk::DiskManager,
    events::EventBus,
    ext::ssl::TlsContext,
    metainfo::MetaInfo,
    torrent::{TorrentCommand, TorrentHandle, TorrentParams},
    InfoHash,
};

const DISK_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum ClientError {

    #[error("client has been unexpectedly dropped")]
    ClientDropped(#[from] mpsc::error::SendError<ClientCommand>),

}

pub type Result<T> = std::result::Result<T, ClientError>;
pub type ClientRx = mpsc::UnboundedReceiver<ClientCommand>;
pub type ClientTx = mpsc::UnboundedSender<ClientCommand>;

pub enum ClientCommand {

    AddTorrent(MetaInfo),

    RemoveTorrent(InfoHash),

    Shutdown,

}

// Process-level owner: one disk manager and one event bus shared by every
// torrent, plus the torrent lifecycle.
pub struct Client {

    client_rx: ClientRx,

    torrents: HashMap<InfoHash, TorrentHandle>,

    config: Config,

    disk: Option<DiskManager>,

    events: EventBus,

    bus_task: JoinHandle<()>,

    tls: Option<TlsContext>,

    // Each torrent listens on its own port, counted up from the configured
    // one.
    current_port: u16,

}

impl Client {

    pub fn new(config: Config) -> (Self, ClientTx) {

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (events, bus_task) = EventBus::start(&config.event_bus);
        let disk = DiskManager::start(config.disk.clone());
        let tls = if config.extensions.ssl_peers_enabled {
            Some(TlsContext::insecure_client())
        } else {
            None
        };
        let current_port = config.listen_address.port();

        (
            Client {
                client_rx,
                torrents: HashMap::new(),
                disk: Some(disk),
                events,
                bus_task,
                tls,
                current_port,
                config,
            },
            client_tx,
        )
    }

    // The bus handle, for subscribing observers before torrents start.
    pub fn event_bus(&self) -> EventBus {
        self.events.clone()
    }

    pub async fn run(&mut self) -> Result<()> {

        while let Some(cmd) = self.client_rx.recv().await {
            match cmd {

                ClientCommand::AddTorrent(metainfo) => self.add_torrent(metainfo),

                ClientCommand::RemoveTorrent(info_hash) => {
                    match self.torrents.remove(&info_hash) {
                        Some(torrent) => {
                            torrent.torrent_tx.send(TorrentCommand::Shutdown).ok();
                            if let Err(e) = torrent.handle.await {
                                tracing::error!("torrent {} panicked: {}", hex::encode(info_hash), e);
                            }
                        }
                        None => {
                            tracing::warn!(
                                "attempted to remove unknown torrent: {}",
                                hex::encode(info_hash),
                            );
                        }
                    }
                }

                ClientCommand::Shutdown => {
                    self.shutdown().await;
                    return Ok(());
                }

            }
        }

        Ok(())
    }

    fn add_torrent(&mut self, metainfo: MetaInfo) {
        let info_hash = metainfo.info_hash();
        if self.torrents.contains_key(&info_hash) {
            tracing::warn!("torrent {} already added", hex::encode(info_hash));
            return;
        }

        let Some(disk) = &self.disk else { return };
        let handle = TorrentHandle::start_torrent(TorrentParams {
            metainfo,
            config: self.config.clone(),
            disk: disk.handle(),
            events: self.events.clone(),
            tls: self.tls.clone(),
            listen_port: self.current_port,
        });
        self.current_port = self.current_port.wrapping_add(1);
        self.torrents.insert(info_hash, handle);
    }

    async fn shutdown(&mut self) {

        for torrent in self.torrents.values() {
            torrent.torrent_tx.send(TorrentCommand::Shutdown).ok();
        }
        for (info_hash, torrent) in self.torrents.drain() {
            if let Err(e) = torrent.handle.await {
                tracing::error!("torrent {} panicked: {}", hex::encode(info_hash), e);
            }
        }

        // Outstanding writes flush within a bound before the disk goes away.
        if let Some(disk) = self.disk.take() {
            disk.shutdown(DISK_FLUSH_TIMEOUT).await;
        }

        self.events.shutdown();
        self.bus_task.abort();
    }
}
