//! **Session Memory** — bounded, ordered log of conversation turns.
//!
//! One instance per session, mutated only by the session's event loop.
//! `append` is the sole mutator; eviction is FIFO and happens atomically
//! with the append that exceeds the bound, always removing whole turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One complete utterance by either party. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Strictly increasing, gap-free within a session.
    pub seq: u64,
}

/// Bounded ordered turn log for one conversation.
#[derive(Debug)]
pub struct SessionMemory {
    turns: VecDeque<Turn>,
    max_turns: usize,
    next_seq: u64,
}

impl SessionMemory {
    /// Create a memory holding at most `max_turns` turns (oldest evicted first).
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turns.min(64)),
            max_turns: max_turns.max(1),
            next_seq: 0,
        }
    }

    /// Append a completed turn, minting its sequence number.
    /// Evicts the oldest turn in the same call when the bound is exceeded.
    pub fn append(&mut self, role: Role, text: impl Into<String>) -> &Turn {
        let turn = Turn {
            role,
            text: text.into(),
            timestamp: Utc::now(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
        self.turns.back().expect("just pushed")
    }

    /// Ordered (oldest-first) owned copy for generation input.
    /// Never hands out a mutable reference to the log.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    /// Sequence number the next appended turn will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Drop all turns. Sequence numbers keep counting so ordering stays total
    /// across a client-initiated reset.
    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_is_gap_free_and_increasing() {
        let mut mem = SessionMemory::new(10);
        for i in 0..5 {
            let turn = mem.append(Role::User, format!("turn {i}"));
            assert_eq!(turn.seq, i);
        }
        let snap = mem.snapshot();
        for pair in snap.windows(2) {
            assert_eq!(pair[1].seq, pair[0].seq + 1);
        }
    }

    #[test]
    fn eviction_is_fifo_and_bounded() {
        let mut mem = SessionMemory::new(3);
        for i in 0..7 {
            mem.append(Role::Assistant, format!("t{i}"));
            assert!(mem.len() <= 3);
        }
        let snap = mem.snapshot();
        assert_eq!(snap.len(), 3);
        // Oldest were evicted first; survivors are the newest, still whole and ordered.
        assert_eq!(snap[0].text, "t4");
        assert_eq!(snap[2].text, "t6");
        assert_eq!(snap[0].seq, 4);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let mut mem = SessionMemory::new(5);
        mem.append(Role::User, "hello");
        let snap = mem.snapshot();
        mem.append(Role::Assistant, "hi");
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn clear_keeps_seq_counting() {
        let mut mem = SessionMemory::new(5);
        mem.append(Role::User, "a");
        mem.append(Role::Assistant, "b");
        mem.clear();
        assert!(mem.is_empty());
        let turn = mem.append(Role::User, "c");
        assert_eq!(turn.seq, 2);
    }
}
