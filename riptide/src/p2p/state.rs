use crate::stats::ThroughputStats;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Handshaking,
    Established,
    Closing,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are refusing the peer's requests.
    pub am_choking: bool,

    // Whether we want pieces the peer has.
    pub am_interested: bool,

    // Whether the peer is refusing our requests.
    pub peer_choking: bool,

    // Whether the peer wants pieces we have.
    pub peer_interested: bool,

    // Negotiated capabilities from the handshake reserved bits.
    pub peer_extension_protocol: bool,
    pub peer_fast: bool,

    // DHT port from a port message, recorded but otherwise unused here.
    pub dht_port: Option<u16>,

    pub throughput: ThroughputStats,

    pub num_pieces: usize,

    pub changed: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Disconnected,
            // (am_choking, am_interested, peer_choking, peer_interested)
            // start as (true, false, true, false).
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_extension_protocol: false,
            peer_fast: false,
            dht_port: None,
            throughput: ThroughputStats::default(),
            num_pieces: 0,
            changed: false,
        }
    }
}

impl SessionState {

    pub fn tick(&mut self) {
        self.throughput.reset();
    }

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        self.changed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_choke_state() {
        let state = SessionState::default();
        assert!(state.am_choking);
        assert!(!state.am_interested);
        assert!(state.peer_choking);
        assert!(!state.peer_interested);
    }
}
