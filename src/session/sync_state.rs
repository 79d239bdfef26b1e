/// Number of recent state hashes retained for comparison. The peer's beacon hash is matched
///  against all of them, so the check tolerates the two simulations being a few frames
///  apart.
pub const HASH_NUM: usize = 5;

/// Ring of the most recent application state hashes, newest at index 0.
#[derive(Debug)]
pub struct HashRing {
    entries: [u32; HASH_NUM],
}

impl HashRing {
    pub fn new() -> HashRing {
        HashRing { entries: [0; HASH_NUM] }
    }

    pub fn push(&mut self, hash: u32) {
        self.entries.copy_within(0..HASH_NUM - 1, 1);
        self.entries[0] = hash;
    }

    pub fn newest(&self) -> u32 {
        self.entries[0]
    }

    pub fn contains(&self, hash: u32) -> bool {
        self.entries.contains(&hash)
    }
}

/// Tracks whether the two applications agree on their deterministic state. A peer hash that
///  matches nothing in the local ring counts as a failure; more than three consecutive
///  failures flip the session out of sync, and any later match flips it back. While the
///  session is paused the accounting is suspended.
#[derive(Debug)]
pub struct SyncTracker {
    fail_count: u32,
    in_sync: bool,
}

impl SyncTracker {
    const MAX_CONSECUTIVE_FAILURES: u32 = 3;

    pub fn new() -> SyncTracker {
        SyncTracker {
            fail_count: 0,
            in_sync: true,
        }
    }

    pub fn on_peer_hash(&mut self, ring: &HashRing, peer_hash: u32, paused: bool) -> bool {
        if paused {
            self.fail_count = 0;
            return self.in_sync;
        }

        if ring.contains(peer_hash) {
            self.fail_count = 0;
            self.in_sync = true;
        }
        else {
            self.fail_count += 1;
            if self.fail_count > Self::MAX_CONSECUTIVE_FAILURES {
                self.in_sync = false;
            }
        }
        self.in_sync
    }
}

/// Round-trip estimate as an exponentially weighted moving average, weight 1/16 for a new
///  sample. The first sample initializes the estimate directly.
#[derive(Debug)]
pub struct PingTracker {
    ping_ms: f32,
}

impl PingTracker {
    pub fn new() -> PingTracker {
        PingTracker { ping_ms: 0.0 }
    }

    pub fn on_sample(&mut self, rtt_ms: f32) {
        if self.ping_ms == 0.0 {
            self.ping_ms = rtt_ms;
        }
        else {
            self.ping_ms = (self.ping_ms * 15.0 + rtt_ms) / 16.0;
        }
    }

    pub fn ping_ms(&self) -> f32 {
        self.ping_ms
    }
}
