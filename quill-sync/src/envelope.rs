//! Per-connection message counters and the replay buffer.
//!
//! Both sides count the messages they send. Every inbound message carries
//! the client's count `c` and the last server count `s` it has seen, which
//! lets the server detect duplicates, gaps and messages that crossed in
//! flight:
//!
//! ```text
//!  c <= client      → duplicate, drop
//!  c >  client + 1  → gap, ask the client to resend from `client`
//!  s <  server      → crossed, resend server messages from `s`, reject
//!  otherwise        → process
//! ```

use std::collections::VecDeque;

use crate::protocol::ServerMessage;

pub const DEFAULT_REPLAY_CAPACITY: usize = 30;

/// Verdict on an inbound message's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Duplicate,
    /// Messages were lost; the client should resend from `from`.
    Gap { from: u64 },
    /// The client had not seen server messages from `from` on.
    Stale { from: u64 },
}

/// Outcome of a resend request.
#[derive(Debug, Clone, PartialEq)]
pub enum Resend {
    Replay(Vec<ServerMessage>),
    /// More messages were requested than the buffer retains.
    Snapshot,
}

/// Counters of one connection plus the last server messages it was sent.
#[derive(Debug)]
pub struct MessageCounters {
    client: u64,
    server: u64,
    replay: VecDeque<ServerMessage>,
    capacity: usize,
}

impl Default for MessageCounters {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}

impl MessageCounters {
    pub fn new(capacity: usize) -> Self {
        Self {
            client: 0,
            server: 0,
            replay: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn client(&self) -> u64 {
        self.client
    }

    pub fn server(&self) -> u64 {
        self.server
    }

    /// Checks an inbound message's counters. Accepted and stale messages
    /// advance the client counter.
    pub fn admit(&mut self, c: u64, s: u64) -> Admission {
        if c <= self.client {
            Admission::Duplicate
        } else if c > self.client + 1 {
            Admission::Gap { from: self.client }
        } else if s < self.server {
            self.client += 1;
            Admission::Stale { from: s }
        } else {
            self.client += 1;
            Admission::Accept
        }
    }

    /// Assigns the next server counter to `message` and keeps it for replay.
    /// Returns the `(c, s)` pair to stamp on the envelope.
    pub fn record(&mut self, message: ServerMessage) -> (u64, u64) {
        self.server += 1;
        if self.capacity > 0 {
            if self.replay.len() == self.capacity {
                self.replay.pop_front();
            }
            self.replay.push_back(message);
        }
        (self.client, self.server)
    }

    /// Rewinds the server counter to `from` and hands back the messages sent
    /// after it, oldest first, for re-sending under fresh counters.
    pub fn rewind(&mut self, from: u64) -> Resend {
        let count = self.server.saturating_sub(from);
        self.server -= count;
        let count = count as usize;
        if count > self.replay.len() {
            self.replay.clear();
            return Resend::Snapshot;
        }
        let keep = self.replay.len() - count;
        Resend::Replay(self.replay.drain(keep..).collect())
    }
}
