use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::{Duration, Instant},
};
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;
use super::{AnnounceParams, Result, Tracker, TrackerError, DEFAULT_MIN_ANNOUNCE_INTERVAL};

pub struct HttpTracker {

    client: reqwest::Client,

    url: Url,

    // Opaque id some trackers want echoed back.
    id: Option<String>,

    last_announce: Option<Instant>,

    interval: Option<Duration>,

    min_interval: Option<Duration>,

}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            id: None,
            last_announce: None,
            interval: None,
            min_interval: None,
        }
    }
}

#[async_trait::async_trait]
impl Tracker for HttpTracker {

    async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>> {

        // info_hash and peer_id are raw bytes and must be percent-encoded
        // by hand; reqwest's query encoder would mangle them.
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url.as_str(),
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.peer_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(num_want) = params.num_want {
            url.push_str(&format!("&numwant={}", num_want));
        }
        if let Some(tracker_id) = &self.id {
            url.push_str(&format!("&trackerid={}", tracker_id));
        }
        tracing::debug!("announce url: {}", url);

        let raw = self.client.get(url).send().await?.bytes().await?;
        let resp: HttpResponse = bencode::from_bytes(&raw)?;
        tracing::debug!("announce response: {:?}", resp);

        if let Some(failure) = resp.failure_reason {
            return Err(TrackerError::ResponseError(failure));
        }
        if let Some(warning) = resp.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }

        if let Some(interval) = resp.interval {
            self.interval = Some(Duration::from_secs(interval));
        }
        if let Some(min_interval) = resp.min_interval {
            self.min_interval = Some(Duration::from_secs(min_interval));
        }
        if let Some(tracker_id) = resp.tracker_id {
            self.id = Some(tracker_id);
        }

        self.last_announce = Some(Instant::now());

        let mut peers = resp.peers;
        peers.extend(resp.peers6);
        tracing::info!("tracker provided {} peers", peers.len());
        Ok(peers)
    }

    fn can_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => {
                time.duration_since(last)
                    >= self.min_interval.unwrap_or(Duration::from_secs(DEFAULT_MIN_ANNOUNCE_INTERVAL))
            }
            None => true,
        }
    }

    fn should_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => {
                time.duration_since(last)
                    >= self.interval.unwrap_or(Duration::from_secs(DEFAULT_MIN_ANNOUNCE_INTERVAL))
            }
            None => true,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct HttpResponse {

    // If present, no other keys matter.
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    pub interval: Option<u64>,

    #[serde(rename = "min interval")]
    pub min_interval: Option<u64>,

    #[serde(rename = "tracker id")]
    pub tracker_id: Option<String>,

    // Seeders and leechers.
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "peers_deserialize")]
    pub peers: Vec<SocketAddr>,

    // BEP 7 compact IPv6 peers.
    #[serde(default)]
    #[serde(deserialize_with = "peers6_deserialize")]
    pub peers6: Vec<SocketAddr>,

}

// Trackers answer compact=1 with a byte string of 6-byte entries, but may
// still fall back to the legacy list-of-dicts model.
fn peers_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact peer string or a list of peer dictionaries")
        }

        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not a multiple of 6"));
            }

            let mut peers = Vec::with_capacity(v.len() / 6);
            while v.has_remaining() {
                peers.push(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                    v.get_u16(),
                ));
            }
            Ok(peers)
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                match peer.ip.parse::<IpAddr>() {
                    Ok(ip) => peers.push(SocketAddr::new(ip, peer.port)),
                    Err(_) => continue,
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

fn peers6_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Peer6Visitor;

    impl<'de> de::Visitor<'de> for Peer6Visitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact ipv6 peer string")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 18 != 0 {
                return Err(E::custom("peer string not a multiple of 18"));
            }

            Ok(v.chunks_exact(18)
                .map(|c| {
                    let octets: [u8; 16] = c[..16].try_into().expect("chunk is 18 bytes");
                    let port = u16::from_be_bytes([c[16], c[17]]);
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
                })
                .collect())
        }
    }

    deserializer.deserialize_any(Peer6Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_compact() {
        let s = "64383a636f6d706c65746569396531303a696e636f6d706c657465693165383a696e74657276616c69313830306531323a6d696e20696e74657276616c693138303065353a706565727336303a52454d051ae1ca2f2a2ec00884937726decc61759ab8138851ab05e8f6bb5062f69770469247493ad4d005879f2ec8d54237ce44ea6043db8806c8d565";
        let response: HttpResponse = bencode::from_bytes(&hex::decode(s).unwrap()).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.min_interval, Some(1800));
        assert_eq!(response.complete, Some(9));
        assert_eq!(response.incomplete, Some(1));
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(97, 117, 154, 184)), 5000)));
        assert!(response.peers.contains(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(5, 135, 159, 46)), 51413)));
    }

    #[test]
    fn test_parse_response_failure() {
        let raw = b"d14:failure reason9:forbiddene";
        let response: HttpResponse = bencode::from_bytes(raw).unwrap();
        assert_eq!(response.failure_reason.as_deref(), Some("forbidden"));
        assert!(response.peers.is_empty());
    }

    #[test]
    fn test_parse_response_peers6() {
        // One IPv6 peer, [::1]:6881.
        let mut raw = b"d6:peers618:".to_vec();
        let mut entry = [0u8; 18];
        entry[15] = 1;
        entry[16..].copy_from_slice(&6881u16.to_be_bytes());
        raw.extend_from_slice(&entry);
        raw.push(b'e');

        let response: HttpResponse = bencode::from_bytes(&raw).unwrap();
        assert_eq!(response.peers6, vec!["[::1]:6881".parse().unwrap()]);
    }
}
