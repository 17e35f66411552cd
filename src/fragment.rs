//! Per-device reassembly of fragmented utterances
//!
//! Devices with small MQTT buffers split one utterance across several
//! fragment frames followed by a last frame. The manager accumulates the
//! fragment payloads per device serial number until the last frame moves the
//! buffer out. A background sweep reaps buffers whose last frame never
//! arrived.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Sweep cadence for idle buffers
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Buffers idle longer than this are evicted
const MAX_IDLE: Duration = Duration::from_secs(120);

struct ReassemblyBuffer {
    data: Vec<u8>,
    last_seen: Instant,
}

/// Concurrent map of in-progress utterance reassemblies, keyed by device SN
#[derive(Default)]
pub struct FragmentManager {
    buffers: Mutex<HashMap<String, ReassemblyBuffer>>,
}

impl FragmentManager {
    /// Create an empty manager; call [`FragmentManager::spawn_sweeper`] to
    /// start idle eviction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append fragment bytes for a device, creating the buffer on first use.
    ///
    /// Returns the accumulated byte count after the append.
    pub fn append(&self, device_sn: &str, data: &[u8]) -> usize {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = buffers
            .entry(device_sn.to_string())
            .or_insert_with(|| ReassemblyBuffer {
                data: Vec::new(),
                last_seen: Instant::now(),
            });
        entry.data.extend_from_slice(data);
        entry.last_seen = Instant::now();
        entry.data.len()
    }

    /// Remove a device's buffer and hand its bytes to the caller.
    ///
    /// Returns `None` when no reassembly is in progress for the device.
    pub fn take(&self, device_sn: &str) -> Option<Vec<u8>> {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.remove(device_sn).map(|b| b.data)
    }

    /// Number of in-progress reassemblies
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether no reassembly is in progress
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop buffers idle longer than `max_idle`; returns how many were removed
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let before = buffers.len();
        let now = Instant::now();
        buffers.retain(|_, b| now.duration_since(b.last_seen) <= max_idle);
        before - buffers.len()
    }

    /// Run the idle sweep on a 60-second cadence until `shutdown` fires
    pub async fn run_sweeper(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let evicted = self.evict_idle(MAX_IDLE);
                    if evicted > 0 {
                        tracing::warn!(evicted, "evicted stale fragment buffers");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_accumulates_per_device() {
        let mgr = FragmentManager::new();
        assert_eq!(mgr.append("A0001", b"abc"), 3);
        assert_eq!(mgr.append("A0001", b"def"), 6);
        assert_eq!(mgr.append("B0001", b"xyz"), 3);

        assert_eq!(mgr.take("A0001").unwrap(), b"abcdef");
        assert_eq!(mgr.take("B0001").unwrap(), b"xyz");
    }

    #[test]
    fn take_is_a_move() {
        let mgr = FragmentManager::new();
        mgr.append("A0001", b"abc");

        assert!(mgr.take("A0001").is_some());
        assert!(mgr.take("A0001").is_none());
        assert!(mgr.is_empty());
    }

    #[test]
    fn take_unknown_device_is_none() {
        let mgr = FragmentManager::new();
        assert!(mgr.take("missing").is_none());
    }

    #[test]
    fn evict_removes_only_idle_buffers() {
        let mgr = FragmentManager::new();
        mgr.append("A0001", b"abc");

        assert_eq!(mgr.evict_idle(Duration::ZERO), 1);
        assert!(mgr.is_empty());

        mgr.append("B0001", b"xyz");
        assert_eq!(mgr.evict_idle(Duration::from_secs(60)), 0);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn append_after_take_starts_fresh() {
        let mgr = FragmentManager::new();
        mgr.append("A0001", b"first");
        mgr.take("A0001");

        assert_eq!(mgr.append("A0001", b"second"), 6);
        assert_eq!(mgr.take("A0001").unwrap(), b"second");
    }
}
