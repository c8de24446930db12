//! Per-node sequence numbering and network statistics.
//!
//! Counters are plain atomics so the receive path (producer) and the node's
//! main loop can both touch them without a lock. Everything richer than a
//! counter lives behind the node's single-consumer queue instead.
use serde::Serialize;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, AtomicU8, Ordering};

use crate::logutil::format_mac;

const NO_SENDER: u64 = u64::MAX;

/// Monotonic (wrapping) 8-bit frame sequence counter.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    value: AtomicU8,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-increment: the first frame a node sends carries sequence 1.
    pub fn next(&self) -> u8 {
        self.value.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn current(&self) -> u8 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct NetworkStats {
    sent: AtomicU64,
    send_failures: AtomicU64,
    received: AtomicU64,
    processed: AtomicU64,
    forwarded: AtomicU64,
    ignored: AtomicU64,
    security_violations: AtomicU64,
    last_sender: AtomicU64,
    last_rssi: AtomicI32,
    last_message_ms: AtomicI64,
}

impl Default for NetworkStats {
    fn default() -> Self {
        Self {
            sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            security_violations: AtomicU64::new(0),
            last_sender: AtomicU64::new(NO_SENDER),
            last_rssi: AtomicI32::new(0),
            last_message_ms: AtomicI64::new(0),
        }
    }
}

impl NetworkStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send-completion callback: the only feedback a fire-and-forget send gets.
    pub fn record_send_result(&self, ok: bool) {
        if ok {
            self.sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.send_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_security_violations(&self) {
        self.security_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link(&self, sender: [u8; 6], rssi: i32) {
        let mut packed = [0u8; 8];
        packed[..6].copy_from_slice(&sender);
        self.last_sender
            .store(u64::from_le_bytes(packed), Ordering::Relaxed);
        if rssi != 0 {
            self.last_rssi.store(rssi, Ordering::Relaxed);
        }
        self.last_message_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.sent,
            &self.send_failures,
            &self.received,
            &self.processed,
            &self.forwarded,
            &self.ignored,
            &self.security_violations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.last_sender.store(NO_SENDER, Ordering::Relaxed);
        self.last_rssi.store(0, Ordering::Relaxed);
        self.last_message_ms.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        let sender = self.last_sender.load(Ordering::Relaxed);
        let last_sender = if sender == NO_SENDER {
            None
        } else {
            let b = sender.to_le_bytes();
            Some(format_mac(&[b[0], b[1], b[2], b[3], b[4], b[5]]))
        };
        let last_ms = self.last_message_ms.load(Ordering::Relaxed);
        Snapshot {
            sent: self.sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            security_violations: self.security_violations.load(Ordering::Relaxed),
            last_sender,
            last_rssi: self.last_rssi.load(Ordering::Relaxed),
            last_message_at: if last_ms == 0 {
                None
            } else {
                chrono::DateTime::<chrono::Utc>::from_timestamp_millis(last_ms)
            },
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub sent: u64,
    pub send_failures: u64,
    pub received: u64,
    pub processed: u64,
    pub forwarded: u64,
    pub ignored: u64,
    pub security_violations: u64,
    pub last_sender: Option<String>,
    pub last_rssi: i32,
    pub last_message_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Snapshot {
    /// Compact form used in status lines.
    pub fn summary(&self) -> String {
        format!(
            "RX:{} FWD:{} IGN:{} SEC:{}",
            self.received, self.forwarded, self.ignored, self.security_violations
        )
    }
}
