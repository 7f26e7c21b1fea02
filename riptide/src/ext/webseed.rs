use url::Url;
use crate::store::StoreInfo;

// HTTP seeding, BEP 19. A web seed behaves like a peer that is always
// unchoked, never choking, has every piece and never requests anything; the
// scheduler treats it exactly that way and this client just fetches ranges.
pub struct WebSeed {
    url: Url,
    client: reqwest::Client,
    pub bytes_downloaded: u64,
    pub failures: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum WebSeedError {

    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),

    #[error("short body: wanted {wanted} bytes, got {got}")]
    ShortBody { wanted: usize, got: usize },

    #[error("cannot build file url")]
    BadUrl,

}

impl WebSeed {

    pub fn new(url: Url) -> Self {
        Self {
            url,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            bytes_downloaded: 0,
            failures: 0,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    // Maps a torrent file onto the web seed's URL space: the URL itself for
    // single-file torrents, url/name/<path> when the URL is a directory.
    fn file_url(&self, info: &StoreInfo, file_idx: usize) -> Result<Url, WebSeedError> {
        let multi = info.files.len() > 1;
        if !multi && !self.url.path().ends_with('/') {
            return Ok(self.url.clone());
        }

        let mut url = self.url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| WebSeedError::BadUrl)?;
            segments.pop_if_empty();
            if multi {
                // output_dir ends with the torrent name for multi-file
                // torrents.
                if let Some(name) = info.output_dir.file_name() {
                    segments.push(&name.to_string_lossy());
                }
            }
            for component in info.files[file_idx].path.components() {
                segments.push(&component.as_os_str().to_string_lossy());
            }
        }
        Ok(url)
    }

    // Fetches one whole piece with HTTP range requests, one per file slice.
    pub async fn fetch_piece(&mut self, info: &StoreInfo, piece_idx: usize) -> Result<Vec<u8>, WebSeedError> {
        let piece_len = info.piece_len(piece_idx);
        let mut data = Vec::with_capacity(piece_len);

        for slice in info.file_slices(piece_idx, 0, piece_len) {
            let url = self.file_url(info, slice.file_idx)?;
            match self.fetch_range(url, slice.offset, slice.len).await {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(e) => {
                    self.failures += 1;
                    return Err(e);
                }
            }
        }

        self.bytes_downloaded += data.len() as u64;
        Ok(data)
    }

    async fn fetch_range(&self, url: Url, offset: u64, len: usize) -> Result<Vec<u8>, WebSeedError> {
        let range = format!("bytes={}-{}", offset, offset + len as u64 - 1);
        tracing::debug!("webseed get {} range {}", url, range);

        let response = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, range)
            .send()
            .await?;

        let status = response.status();
        if !(status == reqwest::StatusCode::PARTIAL_CONTENT || status == reqwest::StatusCode::OK) {
            return Err(WebSeedError::Status(status));
        }

        let body = response.bytes().await?;
        // A server ignoring the range header returns the whole file.
        let bytes = if status == reqwest::StatusCode::OK && body.len() as u64 > offset {
            let start = offset as usize;
            let end = (start + len).min(body.len());
            body[start..end].to_vec()
        } else {
            body[..body.len().min(len)].to_vec()
        };

        if bytes.len() < len {
            return Err(WebSeedError::ShortBody { wanted: len, got: bytes.len() });
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use crate::store::FileInfo;
    use super::*;

    fn single_file_info(len: u64) -> StoreInfo {
        StoreInfo {
            total_len: len,
            piece_len: 16_384,
            last_piece_len: (len % 16_384) as usize,
            num_pieces: ((len + 16_383) / 16_384) as u32,
            files: vec![FileInfo { path: "file.bin".into(), length: len, offset: 0, md5sum: None }],
            output_dir: "out".into(),
        }
    }

    fn multi_file_info() -> StoreInfo {
        StoreInfo {
            total_len: 20_000,
            piece_len: 16_384,
            last_piece_len: 20_000 - 16_384,
            num_pieces: 2,
            files: vec![
                FileInfo { path: "sub/a.bin".into(), length: 12_000, offset: 0, md5sum: None },
                FileInfo { path: "b.bin".into(), length: 8_000, offset: 12_000, md5sum: None },
            ],
            output_dir: "out/torrent-name".into(),
        }
    }

    #[test]
    fn test_file_url_single_file() {
        let seed = WebSeed::new(Url::parse("http://seed.example/file.bin").unwrap());
        let url = seed.file_url(&single_file_info(100_000), 0).unwrap();
        assert_eq!(url.as_str(), "http://seed.example/file.bin");

        // A directory URL gets the file path appended.
        let seed = WebSeed::new(Url::parse("http://seed.example/data/").unwrap());
        let url = seed.file_url(&single_file_info(100_000), 0).unwrap();
        assert_eq!(url.as_str(), "http://seed.example/data/file.bin");
    }

    #[test]
    fn test_file_url_multi_file() {
        let seed = WebSeed::new(Url::parse("http://seed.example/data/").unwrap());
        let info = multi_file_info();
        assert_eq!(
            seed.file_url(&info, 0).unwrap().as_str(),
            "http://seed.example/data/torrent-name/sub/a.bin",
        );
        assert_eq!(
            seed.file_url(&info, 1).unwrap().as_str(),
            "http://seed.example/data/torrent-name/b.bin",
        );
    }

    // Serves a fixed buffer honoring Range: bytes=a-b.
    async fn spawn_range_server(content: Vec<u8>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let content = content.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let content = content.clone();
                        async move {
                            let range = req
                                .headers()
                                .get(hyper::header::RANGE)
                                .and_then(|v| v.to_str().ok())
                                .and_then(|v| v.strip_prefix("bytes="))
                                .and_then(|v| {
                                    let (a, b) = v.split_once('-')?;
                                    Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?))
                                });
                            let response = match range {
                                Some((start, end)) if start < content.len() => {
                                    let end = end.min(content.len() - 1);
                                    hyper::Response::builder()
                                        .status(hyper::StatusCode::PARTIAL_CONTENT)
                                        .body(Full::new(Bytes::copy_from_slice(&content[start..=end])))
                                        .unwrap()
                                }
                                _ => hyper::Response::new(Full::new(Bytes::copy_from_slice(&content))),
                            };
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_fetch_piece_over_http() {
        let content: Vec<u8> = (0..40_000u32).map(|i| (i % 256) as u8).collect();
        let addr = spawn_range_server(content.clone()).await;

        let info = single_file_info(40_000);
        let mut seed = WebSeed::new(Url::parse(&format!("http://{}/file.bin", addr)).unwrap());

        let piece = seed.fetch_piece(&info, 0).await.unwrap();
        assert_eq!(piece, &content[..16_384]);

        // Truncated final piece.
        let piece = seed.fetch_piece(&info, 2).await.unwrap();
        assert_eq!(piece, &content[32_768..]);
        assert_eq!(seed.bytes_downloaded, 16_384 + (40_000 - 32_768) as u64);
    }
}
