use rand::seq::SliceRandom;
use crate::Bitfield;

// The first picks of a fresh torrent are random to bootstrap upload
// capacity; after that selection is rarest-first.
const RANDOM_BOOTSTRAP_PICKS: usize = 4;

#[derive(Clone, Copy, Default, Debug)]
struct PieceInfo {
    // Number of connected peers that have this piece.
    frequency: usize,
    // A partial piece is already being downloaded.
    partial: bool,
    // Parked after repeated hash failures.
    paused: bool,
}

#[derive(Debug)]
pub struct PiecePicker {
    pieces: Vec<PieceInfo>,
    // The pieces we have.
    have: Bitfield,
    picks: usize,
}

impl PiecePicker {

    pub fn new(num_pieces: usize) -> Self {
        let mut have = Bitfield::new();
        have.resize(num_pieces, false);
        Self {
            pieces: vec![PieceInfo::default(); num_pieces],
            have,
            picks: 0,
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn set_own_bitfield(&mut self, bf: Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        self.have = bf;
    }

    pub fn all(&self) -> bool {
        self.have.all()
    }

    pub fn missing_count(&self) -> usize {
        self.have.count_zeros()
    }

    pub fn frequency(&self, idx: usize) -> usize {
        self.pieces[idx].frequency
    }

    // Applies a have message. Returns whether the peer now has a piece we
    // lack. Idempotence is the caller's concern: a session applies each
    // have once against its own bitfield before calling in.
    pub fn increment_piece(&mut self, idx: usize) -> bool {
        assert!(idx < self.pieces.len());
        self.pieces[idx].frequency += 1;
        !self.have[idx]
    }

    // Folds a whole peer bitfield into the rarity histogram. Returns true
    // if the peer has at least one piece we don't.
    pub fn bitfield_update(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.have.len());
        let mut interested = false;
        bf.iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .for_each(|(i, _)| {
                self.pieces[i].frequency += 1;
                if !self.have[i] {
                    interested = true;
                }
            });
        interested
    }

    // Unwinds a disconnected peer's contribution to the histogram.
    pub fn peer_gone(&mut self, bf: &Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        bf.iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .for_each(|(i, _)| {
                self.pieces[i].frequency = self.pieces[i].frequency.saturating_sub(1);
            });
    }

    pub fn received_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.have.set(idx, true);
        self.pieces[idx].partial = false;
    }

    pub fn hash_failed(&mut self, idx: usize) {
        self.pieces[idx].partial = false;
    }

    pub fn pause_piece(&mut self, idx: usize) {
        self.pieces[idx].partial = false;
        self.pieces[idx].paused = true;
    }

    // Picks the next piece to start downloading from this peer: random
    // during bootstrap, then rarest-first with a uniform draw among the
    // rarest candidates.
    pub fn pick_new_piece(&mut self, bf: &Bitfield) -> Option<usize> {

        let candidates: Vec<usize> = (0..self.pieces.len())
            .filter(|&i| {
                let piece = &self.pieces[i];
                !self.have[i] && !piece.partial && !piece.paused && piece.frequency > 0 && bf[i]
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let idx = if self.picks < RANDOM_BOOTSTRAP_PICKS {
            *candidates.choose(&mut rand::thread_rng())?
        } else {
            let min_freq = candidates
                .iter()
                .map(|&i| self.pieces[i].frequency)
                .min()?;
            let rarest: Vec<usize> = candidates
                .into_iter()
                .filter(|&i| self.pieces[i].frequency == min_freq)
                .collect();
            *rarest.choose(&mut rand::thread_rng())?
        };

        self.pieces[idx].partial = true;
        self.picks += 1;
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bf(bits: &[bool]) -> Bitfield {
        let mut out = Bitfield::new();
        for &b in bits {
            out.push(b);
        }
        out
    }

    // Skips the random bootstrap so rarest-first is observable.
    fn picker_past_bootstrap(num_pieces: usize) -> PiecePicker {
        let mut picker = PiecePicker::new(num_pieces);
        picker.picks = RANDOM_BOOTSTRAP_PICKS;
        picker
    }

    #[test]
    fn test_rarest_first_three_peers() {
        // A has {p0, p1}, B has {p1, p2}, C has {p2}.
        // Rarity: p0 = 1, p1 = 2, p2 = 2; p0 must be picked first.
        let mut picker = picker_past_bootstrap(3);
        let a = bf(&[true, true, false]);
        let b = bf(&[false, true, true]);
        let c = bf(&[false, false, true]);
        picker.bitfield_update(&a);
        picker.bitfield_update(&b);
        picker.bitfield_update(&c);

        assert_eq!(picker.pick_new_piece(&a), Some(0));
        // p0 is now partial; next pick from A is p1.
        assert_eq!(picker.pick_new_piece(&a), Some(1));
        // Nothing further available from A.
        assert_eq!(picker.pick_new_piece(&a), None);
    }

    #[test]
    fn test_have_is_idempotent_on_histogram() {
        let mut picker = picker_past_bootstrap(2);
        picker.increment_piece(1);
        assert_eq!(picker.frequency(1), 1);
        // A second have from the same peer is filtered by the session's own
        // bitfield, so the histogram only moves once per peer.
    }

    #[test]
    fn test_peer_gone_unwinds_histogram() {
        let mut picker = picker_past_bootstrap(3);
        let peer = bf(&[true, false, true]);
        picker.bitfield_update(&peer);
        assert_eq!(picker.frequency(0), 1);
        picker.peer_gone(&peer);
        assert_eq!(picker.frequency(0), 0);
        assert_eq!(picker.pick_new_piece(&peer), None);
    }

    #[test]
    fn test_bootstrap_picks_are_among_candidates() {
        let mut picker = PiecePicker::new(8);
        let peer = bf(&[true; 8]);
        picker.bitfield_update(&peer);
        for _ in 0..4 {
            let idx = picker.pick_new_piece(&peer).unwrap();
            assert!(idx < 8);
        }
    }

    #[test]
    fn test_paused_piece_is_skipped() {
        let mut picker = picker_past_bootstrap(2);
        let peer = bf(&[true, true]);
        picker.bitfield_update(&peer);
        picker.pause_piece(0);
        assert_eq!(picker.pick_new_piece(&peer), Some(1));
        assert_eq!(picker.pick_new_piece(&peer), None);
    }

    #[test]
    fn test_hash_failed_reopens_piece() {
        let mut picker = picker_past_bootstrap(1);
        let peer = bf(&[true]);
        picker.bitfield_update(&peer);
        assert_eq!(picker.pick_new_piece(&peer), Some(0));
        assert_eq!(picker.pick_new_piece(&peer), None);
        picker.hash_failed(0);
        assert_eq!(picker.pick_new_piece(&peer), Some(0));
    }
}
