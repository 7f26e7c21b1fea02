use std::{
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    time::{Duration, Instant},
};
use bytes::{Buf, BufMut, BytesMut};
use tokio::{net::UdpSocket, time};
use url::Url;
use super::{AnnounceParams, Event, Result, Tracker, TrackerError, DEFAULT_MIN_ANNOUNCE_INTERVAL};

// Reference: BEP 15.

const PROTOCOL_ID: i64 = 0x41727101980;
const ACTION_CONNECT: i32 = 0;
const ACTION_ANNOUNCE: i32 = 1;
const ACTION_ERROR: i32 = 3;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct UdpTracker {

    socket: UdpSocket,

    url: Url,

    conn_id: Option<(i64, Instant)>,

    last_announce: Option<Instant>,

    interval: Option<Duration>,

}

impl UdpTracker {

    pub async fn new(url: Url) -> Result<Self> {
        // First available local port.
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket,
            url,
            conn_id: None,
            last_announce: None,
            interval: None,
        })
    }

    async fn connect(&mut self) -> Result<i64> {

        // Connection ids stay valid for a minute.
        if let Some((id, at)) = self.conn_id {
            if at.elapsed() < Duration::from_secs(60) {
                return Ok(id);
            }
        }

        let host = self.url.host_str().ok_or(TrackerError::InvalidUrl)?;
        let port = self.url.port().ok_or(TrackerError::InvalidUrl)?;
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(TrackerError::InvalidUrl)?;
        time::timeout(REQUEST_TIMEOUT, self.socket.connect(addr)).await??;

        let trans_id: i32 = rand::random();

        let mut buf = BytesMut::with_capacity(16);
        buf.put_i64(PROTOCOL_ID);
        buf.put_i32(ACTION_CONNECT);
        buf.put_i32(trans_id);
        self.socket.send(&buf).await?;

        let mut resp_buf = [0u8; 16];
        let n = time::timeout(REQUEST_TIMEOUT, self.socket.recv(&mut resp_buf)).await??;
        if n < 16 {
            return Err(TrackerError::ResponseError("short connect response".to_string()));
        }
        let mut resp = &resp_buf[..];
        if resp.get_i32() != ACTION_CONNECT {
            return Err(TrackerError::ResponseError("expected action 0".to_string()));
        }
        if resp.get_i32() != trans_id {
            return Err(TrackerError::ResponseError("transaction id mismatch".to_string()));
        }
        let id = resp.get_i64();
        self.conn_id = Some((id, Instant::now()));

        tracing::trace!("connected to tracker");
        Ok(id)
    }
}

#[async_trait::async_trait]
impl Tracker for UdpTracker {

    async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>> {

        let conn_id = self.connect().await?;
        let trans_id: i32 = rand::random();

        let mut buf = BytesMut::with_capacity(98);
        buf.put_i64(conn_id);
        buf.put_i32(ACTION_ANNOUNCE);
        buf.put_i32(trans_id);
        buf.put(&params.info_hash[..]);
        buf.put(&params.peer_id[..]);
        buf.put_u64(params.downloaded);
        buf.put_u64(params.left);
        buf.put_u64(params.uploaded);
        buf.put_i32(match params.event {
            Some(Event::Completed) => 1,
            Some(Event::Started) => 2,
            Some(Event::Stopped) => 3,
            None => 0,
        });
        buf.put_i32(0); // IP address, default.
        buf.put_i32(rand::random()); // Key.
        buf.put_i32(match params.num_want {
            Some(num_want) => num_want as i32,
            None => -1,
        });
        buf.put_u16(params.port);

        self.socket.send(&buf).await?;

        let mut resp_buf = [0u8; 4096];
        let n = time::timeout(REQUEST_TIMEOUT, self.socket.recv(&mut resp_buf)).await??;
        if n < 8 {
            return Err(TrackerError::ResponseError("short announce response".to_string()));
        }
        let mut resp = &resp_buf[..n];
        let action = resp.get_i32();
        let resp_trans_id = resp.get_i32();
        if action == ACTION_ERROR {
            let message = String::from_utf8_lossy(resp.chunk()).into_owned();
            return Err(TrackerError::ResponseError(message));
        }
        if action != ACTION_ANNOUNCE {
            return Err(TrackerError::ResponseError("expected action 1".to_string()));
        }
        if resp_trans_id != trans_id {
            return Err(TrackerError::ResponseError("transaction id mismatch".to_string()));
        }
        if n < 20 {
            return Err(TrackerError::ResponseError("short announce response".to_string()));
        }

        let interval = resp.get_i32();
        if interval > 0 {
            self.interval = Some(Duration::from_secs(interval as u64));
        }
        let _leechers = resp.get_i32();
        let _seeders = resp.get_i32();

        let num_peers = (n - 20) / 6;
        let mut peers = Vec::with_capacity(num_peers);
        for _ in 0..num_peers {
            let ip = resp.get_u32();
            let port = resp.get_u16();
            peers.push(SocketAddr::new(Ipv4Addr::from(ip).into(), port));
        }

        tracing::info!("tracker provided {} peers", peers.len());
        self.last_announce = Some(Instant::now());
        Ok(peers)
    }

    fn can_announce(&self, time: Instant) -> bool {
        match self.last_announce {
            Some(last) => {
                time.duration_since(last)
                    >= Duration::from_secs(DEFAULT_MIN_ANNOUNCE_INTERVAL)
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
