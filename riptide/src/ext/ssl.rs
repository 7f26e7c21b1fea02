use std::sync::Arc;
use std::time::{Duration, Instant};
use super::{ExtensionError, Result};

// BEP 47 negotiation frames are fixed 5 bytes: type + request id.
const TYPE_REQUEST: u8 = 0x01;
const TYPE_ACCEPT: u8 = 0x03;
const TYPE_REJECT: u8 = 0x04;

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMessage {
    Request { request_id: u32 },
    Accept { request_id: u32 },
    Reject { request_id: u32 },
}

impl SslMessage {

    pub fn encode(&self) -> [u8; 5] {
        let (kind, id) = match self {
            SslMessage::Request { request_id } => (TYPE_REQUEST, request_id),
            SslMessage::Accept { request_id } => (TYPE_ACCEPT, request_id),
            SslMessage::Reject { request_id } => (TYPE_REJECT, request_id),
        };
        let mut out = [0; 5];
        out[0] = kind;
        out[1..].copy_from_slice(&id.to_be_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != 5 {
            return Err(ExtensionError::Malformed("ssl"));
        }
        let request_id = u32::from_be_bytes(payload[1..5].try_into().expect("payload is 5 bytes"));
        match payload[0] {
            TYPE_REQUEST => Ok(SslMessage::Request { request_id }),
            TYPE_ACCEPT => Ok(SslMessage::Accept { request_id }),
            TYPE_REJECT => Ok(SslMessage::Reject { request_id }),
            _ => Err(ExtensionError::Malformed("ssl")),
        }
    }
}

// What the session should do with the connection after processing one
// negotiation message or a timeout check.
#[derive(Debug, PartialEq, Eq)]
pub enum SslDisposition {
    // Send the frame, nothing else changes yet.
    Send(SslMessage),
    // Send accept, then upgrade as the TLS server.
    AcceptAndUpgrade(SslMessage),
    // Our request was accepted; upgrade as the TLS client.
    Upgrade,
    // Negotiation failed but plaintext is acceptable.
    Fallback,
    // Strict mode and no TLS; drop the session.
    Close,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Requested { request_id: u32, at: Instant },
    Secured,
    Rejected,
}

// Per-session negotiation state machine. Whether we accept an inbound
// request is policy: SSL must be enabled and an acceptor installed, never
// a hardwired yes.
pub struct SslNegotiation {
    state: State,
    counter: u32,
    opportunistic: bool,
    can_accept: bool,
}

impl SslNegotiation {

    pub fn new(opportunistic: bool, can_accept: bool) -> Self {
        Self {
            state: State::Idle,
            counter: 0,
            opportunistic,
            can_accept,
        }
    }

    pub fn is_secured(&self) -> bool {
        self.state == State::Secured
    }

    // Starts an outbound upgrade request.
    pub fn begin(&mut self) -> SslMessage {
        self.counter += 1;
        self.state = State::Requested {
            request_id: self.counter,
            at: Instant::now(),
        };
        SslMessage::Request { request_id: self.counter }
    }

    pub fn secured(&mut self) {
        self.state = State::Secured;
    }

    pub fn on_message(&mut self, msg: SslMessage) -> SslDisposition {
        match msg {

            SslMessage::Request { request_id } => {
                if self.can_accept {
                    SslDisposition::AcceptAndUpgrade(SslMessage::Accept { request_id })
                } else {
                    SslDisposition::Send(SslMessage::Reject { request_id })
                }
            }

            SslMessage::Accept { request_id } => match self.state {
                State::Requested { request_id: expected, .. } if expected == request_id => {
                    SslDisposition::Upgrade
                }
                _ => SslDisposition::Ignore,
            },

            SslMessage::Reject { request_id } => match self.state {
                State::Requested { request_id: expected, .. } if expected == request_id => {
                    self.state = State::Rejected;
                    if self.opportunistic {
                        SslDisposition::Fallback
                    } else {
                        SslDisposition::Close
                    }
                }
                _ => SslDisposition::Ignore,
            },
        }
    }

    // Requested but unanswered negotiations eventually resolve like a
    // reject.
    pub fn check_timeout(&mut self, now: Instant) -> Option<SslDisposition> {
        if let State::Requested { at, .. } = self.state {
            if now.duration_since(at) >= NEGOTIATION_TIMEOUT {
                self.state = State::Rejected;
                return Some(if self.opportunistic {
                    SslDisposition::Fallback
                } else {
                    SslDisposition::Close
                });
            }
        }
        None
    }
}

// TLS material for upgrades: a connector for the client side and,
// optionally, an acceptor when we can terminate TLS ourselves.
#[derive(Clone)]
pub struct TlsContext {
    pub connector: tokio_rustls::TlsConnector,
    pub acceptor: Option<tokio_rustls::TlsAcceptor>,
}

impl TlsContext {

    // BEP 47 peers present torrent-scoped certificates that public roots
    // cannot vouch for, so the client side accepts any chain; the
    // encryption is opportunistic, not authenticating.
    pub fn insecure_client() -> Self {
        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();
        Self {
            connector: tokio_rustls::TlsConnector::from(Arc::new(config)),
            acceptor: None,
        }
    }

    pub fn with_identity(
        mut self,
        certs: Vec<rustls::Certificate>,
        key: rustls::PrivateKey,
    ) -> std::result::Result<Self, rustls::Error> {
        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        self.acceptor = Some(tokio_rustls::TlsAcceptor::from(Arc::new(config)));
        Ok(self)
    }
}

struct AcceptAnyCert;

impl rustls::client::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        for msg in [
            SslMessage::Request { request_id: 1 },
            SslMessage::Accept { request_id: 0xdead_beef },
            SslMessage::Reject { request_id: 7 },
        ] {
            let raw = msg.encode();
            assert_eq!(raw.len(), 5);
            assert_eq!(SslMessage::decode(&raw).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(SslMessage::decode(&[TYPE_REQUEST, 0, 0, 0]).is_err());
        assert!(SslMessage::decode(&[0x02, 0, 0, 0, 1]).is_err());
        assert!(SslMessage::decode(&[0x09, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_accept_matches_request_id() {
        let mut negotiation = SslNegotiation::new(true, false);
        let request = negotiation.begin();
        let SslMessage::Request { request_id } = request else { panic!() };

        // A stray accept for some other id is ignored.
        assert_eq!(
            negotiation.on_message(SslMessage::Accept { request_id: request_id + 9 }),
            SslDisposition::Ignore,
        );
        assert_eq!(
            negotiation.on_message(SslMessage::Accept { request_id }),
            SslDisposition::Upgrade,
        );
    }

    #[test]
    fn test_reject_falls_back_or_closes() {
        let mut opportunistic = SslNegotiation::new(true, false);
        let SslMessage::Request { request_id } = opportunistic.begin() else { panic!() };
        assert_eq!(
            opportunistic.on_message(SslMessage::Reject { request_id }),
            SslDisposition::Fallback,
        );

        let mut strict = SslNegotiation::new(false, false);
        let SslMessage::Request { request_id } = strict.begin() else { panic!() };
        assert_eq!(
            strict.on_message(SslMessage::Reject { request_id }),
            SslDisposition::Close,
        );
    }

    #[test]
    fn test_inbound_request_respects_policy() {
        let mut without_acceptor = SslNegotiation::new(true, false);
        assert_eq!(
            without_acceptor.on_message(SslMessage::Request { request_id: 3 }),
            SslDisposition::Send(SslMessage::Reject { request_id: 3 }),
        );

        let mut with_acceptor = SslNegotiation::new(true, true);
        assert_eq!(
            with_acceptor.on_message(SslMessage::Request { request_id: 3 }),
            SslDisposition::AcceptAndUpgrade(SslMessage::Accept { request_id: 3 }),
        );
    }

    #[test]
    fn test_timeout_resolves_like_reject() {
        let mut negotiation = SslNegotiation::new(false, false);
        negotiation.begin();
        assert!(negotiation.check_timeout(Instant::now()).is_none());
        let later = Instant::now() + NEGOTIATION_TIMEOUT;
        assert_eq!(negotiation.check_timeout(later), Some(SslDisposition::Close));
        // Resolved; no second verdict.
        assert!(negotiation.check_timeout(later).is_none());
    }
}
