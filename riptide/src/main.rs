use riptide::{Client, ClientCommand, Config, MetaInfo};

#[tokio::main]
async fn main() {

    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(sub).expect("logging setup");

    let mut args = std::env::args().skip(1);
    let Some(torrent_path) = args.next() else {
        eprintln!("usage: riptide <file.torrent> [output-dir]");
        std::process::exit(2);
    };

    let metainfo = match MetaInfo::load(&torrent_path) {
        Ok(metainfo) => metainfo,
        Err(e) => {
            eprintln!("failed to load {}: {}", torrent_path, e);
            std::process::exit(1);
        }
    };

    let mut config = Config::default();
    if let Some(output_dir) = args.next() {
        config.output_dir = output_dir.into();
    }

    let (mut client, client_tx) = Client::new(config);
    client_tx
        .send(ClientCommand::AddTorrent(metainfo))
        .expect("client just started");

    let shutdown_tx = client_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("interrupt received, shutting down");
        shutdown_tx.send(ClientCommand::Shutdown).ok();
    });

    if let Err(e) = client.run().await {
        tracing::error!("client error: {}", e);
    }
}
