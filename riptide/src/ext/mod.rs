use std::collections::HashMap;
use bencode::Value;
use crate::config::ExtensionsConfig;

pub mod pex;
pub mod ssl;
pub mod webseed;

// Extension names as they appear in the BEP 10 `m` dictionary.
pub const PEX_NAME: &str = "ut_pex";
pub const SSL_NAME: &str = "ssl";

#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {

    #[error("bencode error in extension payload: {0}")]
    Bencode(#[from] bencode::Error),

    #[error("malformed {0} message")]
    Malformed(&'static str),

    #[error("extension {0} not negotiated with peer")]
    NotNegotiated(&'static str),

}

pub type Result<T> = std::result::Result<T, ExtensionError>;

// Extensions we registered locally, with the ids we advertise in our own
// extended handshake's `m` dictionary.
#[derive(Debug, Clone)]
pub struct ExtensionRegistry {
    by_name: HashMap<&'static str, u8>,
    by_id: HashMap<u8, &'static str>,
}

impl ExtensionRegistry {

    pub fn new(config: &ExtensionsConfig) -> Self {
        let mut registry = Self {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
        };
        let mut next_id = 1;
        let mut register = |name| {
            registry.by_name.insert(name, next_id);
            registry.by_id.insert(next_id, name);
            next_id += 1;
        };
        if config.pex_enabled {
            register(PEX_NAME);
        }
        if config.ssl_peers_enabled {
            register(SSL_NAME);
        }
        registry
    }

    pub fn local_id(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    pub fn name_for(&self, id: u8) -> Option<&'static str> {
        self.by_id.get(&id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    // Our extended handshake payload: {m: {...}, v, p, reqq}.
    pub fn handshake_payload(&self, listen_port: u16, reqq: usize) -> Vec<u8> {
        let mut m = Value::dict();
        for (name, id) in &self.by_name {
            m.insert(name.as_bytes(), Value::Int(*id as i64));
        }
        let mut root = Value::dict();
        root.insert("m", m);
        root.insert("v", Value::bytes(concat!("riptide ", env!("CARGO_PKG_VERSION"))));
        root.insert("p", Value::Int(listen_port as i64));
        root.insert("reqq", Value::Int(reqq as i64));
        bencode::encode(&root)
    }
}

// What the peer's extended handshake told us. The `m` dictionary is the
// authoritative capability list.
#[derive(Debug, Clone, Default)]
pub struct PeerExtensions {
    m: HashMap<String, u8>,
    pub version: Option<String>,
    pub listen_port: Option<u16>,
    pub request_queue: Option<usize>,
}

impl PeerExtensions {

    pub fn parse(payload: &[u8]) -> Result<Self> {
        let root = bencode::decode(payload)?;
        let mut out = PeerExtensions::default();

        if let Some(m) = root.get_dict(b"m") {
            for (name, id) in m {
                if let Value::Int(id) = id {
                    // An id of 0 withdraws the extension.
                    if (1..=255i64).contains(id) {
                        out.m.insert(
                            String::from_utf8_lossy(name).into_owned(),
                            *id as u8,
                        );
                    }
                }
            }
        }
        out.version = root.get_bytes(b"v").map(|v| String::from_utf8_lossy(v).into_owned());
        out.listen_port = root.get_int(b"p").and_then(|p| u16::try_from(p).ok());
        out.request_queue = root.get_int(b"reqq").and_then(|q| usize::try_from(q).ok());
        Ok(out)
    }

    pub fn supports(&self, name: &str) -> bool {
        self.m.contains_key(name)
    }

    // The id to put on the wire when sending this extension to the peer.
    pub fn remote_id(&self, name: &str) -> Option<u8> {
        self.m.get(name).copied()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.m.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExtensionsConfig {
        ExtensionsConfig {
            ssl_peers_enabled: true,
            ..ExtensionsConfig::default()
        }
    }

    #[test]
    fn test_registry_assigns_distinct_ids() {
        let registry = ExtensionRegistry::new(&config());
        let pex = registry.local_id(PEX_NAME).unwrap();
        let ssl = registry.local_id(SSL_NAME).unwrap();
        assert_ne!(pex, ssl);
        assert_eq!(registry.name_for(pex), Some(PEX_NAME));
        assert_eq!(registry.name_for(ssl), Some(SSL_NAME));
    }

    #[test]
    fn test_handshake_roundtrip() {
        let registry = ExtensionRegistry::new(&config());
        let payload = registry.handshake_payload(6881, 64);

        let peer = PeerExtensions::parse(&payload).unwrap();
        assert!(peer.supports(PEX_NAME));
        assert!(peer.supports(SSL_NAME));
        assert_eq!(peer.remote_id(PEX_NAME), registry.local_id(PEX_NAME));
        assert_eq!(peer.listen_port, Some(6881));
        assert_eq!(peer.request_queue, Some(64));
        assert!(peer.version.unwrap().starts_with("riptide"));
    }

    #[test]
    fn test_zero_id_withdraws_extension() {
        let mut m = Value::dict();
        m.insert("ut_pex", Value::Int(0));
        let mut root = Value::dict();
        root.insert("m", m);

        let peer = PeerExtensions::parse(&bencode::encode(&root)).unwrap();
        assert!(!peer.supports(PEX_NAME));
    }

    #[test]
    fn test_disabled_extensions_not_advertised() {
        let registry = ExtensionRegistry::new(&ExtensionsConfig {
            pex_enabled: false,
            ssl_peers_enabled: false,
            ..ExtensionsConfig::default()
        });
        assert!(registry.is_empty());
        let peer = PeerExtensions::parse(&registry.handshake_payload(1, 1)).unwrap();
        assert!(!peer.supports(PEX_NAME));
    }
}
