//! Reorg detection over a sliding window of recent canonical headers.
//!
//! The detector owns the canonical tail: the most recent `K` committed block
//! headers, contiguous by parent-hash linkage. Each candidate block is
//! checked against the tail tip; a mismatch starts a fork resolution in which
//! the driving loop fetches the candidate's ancestor headers one by one and
//! feeds them to [`ReorgDetector::match_ancestor`] until a common ancestor is
//! found inside the window. The detector itself is synchronous — the RPC
//! walk belongs to the orchestrator's loop.

use std::collections::VecDeque;

use crate::types::{BlockHeader, Cursor};

/// Decision for a single candidate block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Candidate extends the canonical chain; process and commit it.
    Accept,
    /// Candidate is already in the tail (e.g. a head replayed after a
    /// WebSocket reconnect); drop it silently.
    Skip,
    /// Candidate does not extend the tip. The caller must resolve the fork
    /// point via the ancestor walk before anything is committed.
    ForkSuspected,
}

/// Maintains the canonical tail and classifies candidates.
pub struct ReorgDetector {
    /// Sliding window of recent canonical headers, oldest first.
    tail: VecDeque<BlockHeader>,
    /// Maximum window length `K`; must exceed the chain's expected max reorg
    /// depth.
    window: usize,
}

impl ReorgDetector {
    pub fn new(window: usize) -> Self {
        Self {
            tail: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Rebuild the tail from committed headers (ascending by number), e.g.
    /// after a restart. Keeps at most the newest `K` entries.
    pub fn seed(&mut self, headers: Vec<BlockHeader>) {
        self.tail.clear();
        for header in headers {
            self.accept(header);
        }
    }

    pub fn tip(&self) -> Option<&BlockHeader> {
        self.tail.back()
    }

    pub fn oldest(&self) -> Option<&BlockHeader> {
        self.tail.front()
    }

    pub fn len(&self) -> usize {
        self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tail.is_empty()
    }

    /// Returns the tail header at `number`, if inside the window.
    pub fn get(&self, number: u64) -> Option<&BlockHeader> {
        self.tail.iter().find(|h| h.number == number)
    }

    /// Classify a candidate against the tail tip (or, for an empty tail, the
    /// committed cursor).
    pub fn evaluate(&self, candidate: &BlockHeader, cursor: Option<&Cursor>) -> Directive {
        if let Some(tip) = self.tail.back() {
            if candidate.extends(tip) {
                return Directive::Accept;
            }
            if self
                .get(candidate.number)
                .is_some_and(|h| h.hash == candidate.hash)
            {
                return Directive::Skip;
            }
            return Directive::ForkSuspected;
        }
        match cursor {
            // Nothing committed yet: the very first candidate has no parent
            // to check against.
            None => Directive::Accept,
            Some(cursor) => {
                if candidate.number == cursor.block_number + 1
                    && candidate.parent_hash == cursor.block_hash
                {
                    Directive::Accept
                } else {
                    Directive::ForkSuspected
                }
            }
        }
    }

    /// One step of the fork walk: given an ancestor header of the candidate
    /// (fetched at decreasing numbers), return the fork point if the ancestor
    /// reconnects to the tail.
    ///
    /// The fork point is the first rolled-back block: everything with
    /// `number >= fork_point` belongs to the abandoned branch.
    pub fn match_ancestor(&self, ancestor: &BlockHeader) -> Option<u64> {
        // The new branch's block at this height is ours — divergence starts
        // right above it.
        if let Some(ours) = self.get(ancestor.number) {
            if ours.hash == ancestor.hash {
                return Some(ancestor.number + 1);
            }
        }
        // The ancestor links onto a tail block — divergence starts at the
        // ancestor's own height.
        if ancestor.number > 0 {
            if let Some(ours) = self.get(ancestor.number - 1) {
                if ours.hash == ancestor.parent_hash {
                    return Some(ancestor.number);
                }
            }
        }
        None
    }

    /// Append an accepted header, evicting from the front past the window.
    pub fn accept(&mut self, header: BlockHeader) {
        if self.tail.len() >= self.window {
            self.tail.pop_front();
        }
        self.tail.push_back(header);
    }

    /// Drop every tail entry with `number >= from_block` after a rollback.
    pub fn truncate_from(&mut self, from_block: u64) {
        while let Some(back) = self.tail.back() {
            if back.number >= from_block {
                self.tail.pop_back();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockStatus;

    fn header(number: u64, hash: &str, parent: &str) -> BlockHeader {
        BlockHeader {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: number,
            status: BlockStatus::Accepted,
        }
    }

    fn chain(from: u64, to: u64) -> Vec<BlockHeader> {
        (from..=to)
            .map(|n| header(n, &format!("0x{n:x}a"), &format!("0x{:x}a", n.wrapping_sub(1))))
            .collect()
    }

    fn seeded(from: u64, to: u64, window: usize) -> ReorgDetector {
        let mut det = ReorgDetector::new(window);
        det.seed(chain(from, to));
        det
    }

    #[test]
    fn accept_on_linear_extension() {
        let det = seeded(100, 105, 64);
        let next = header(106, "0x6ab", "0x69a");
        assert_eq!(det.evaluate(&next, None), Directive::Accept);
    }

    #[test]
    fn skip_on_duplicate_head() {
        let det = seeded(100, 105, 64);
        let dup = header(105, "0x69a", "0x68a");
        assert_eq!(det.evaluate(&dup, None), Directive::Skip);
    }

    #[test]
    fn fork_on_parent_mismatch() {
        let det = seeded(100, 105, 64);
        let forked = header(106, "0x6ab", "0xdead");
        assert_eq!(det.evaluate(&forked, None), Directive::ForkSuspected);
    }

    #[test]
    fn fork_on_replaced_tip() {
        let det = seeded(100, 105, 64);
        // Same height as the tip but a different hash.
        let replaced = header(105, "0x69b", "0x68b");
        assert_eq!(det.evaluate(&replaced, None), Directive::ForkSuspected);
    }

    #[test]
    fn empty_tail_checks_cursor_linkage() {
        let det = ReorgDetector::new(64);
        let cursor = Cursor::new(500, "0x1f4a");

        let good = header(501, "0x1f5a", "0x1f4a");
        assert_eq!(det.evaluate(&good, Some(&cursor)), Directive::Accept);

        let bad = header(501, "0x1f5b", "0x1f4b");
        assert_eq!(det.evaluate(&bad, Some(&cursor)), Directive::ForkSuspected);
    }

    #[test]
    fn empty_tail_no_cursor_accepts_first() {
        let det = ReorgDetector::new(64);
        assert_eq!(
            det.evaluate(&header(100, "0x64a", "0x63a"), None),
            Directive::Accept
        );
    }

    #[test]
    fn match_ancestor_finds_fork_point() {
        let det = seeded(100, 105, 64);
        // New branch diverges at 104: its block 103 is still ours.
        let shared = header(103, "0x67a", "0x66a");
        assert_eq!(det.match_ancestor(&shared), Some(104));
        // Its block 104 is new but links to our 103.
        let diverged = header(104, "0x68b", "0x67a");
        assert_eq!(det.match_ancestor(&diverged), Some(104));
        // A fully foreign ancestor matches nothing.
        let foreign = header(102, "0x66b", "0x65b");
        assert_eq!(det.match_ancestor(&foreign), None);
    }

    #[test]
    fn window_evicts_oldest() {
        let mut det = ReorgDetector::new(4);
        for h in chain(100, 110) {
            det.accept(h);
        }
        assert_eq!(det.len(), 4);
        assert_eq!(det.oldest().unwrap().number, 107);
        assert_eq!(det.tip().unwrap().number, 110);
    }

    #[test]
    fn truncate_from_drops_rolled_back_entries() {
        let mut det = seeded(100, 110, 64);
        det.truncate_from(105);
        assert_eq!(det.tip().unwrap().number, 104);
        assert!(det.get(105).is_none());
        assert!(det.get(104).is_some());
    }
}
