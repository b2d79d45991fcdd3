use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::classifier::Classification;

/// Running counts kept by the packet forwarder.
#[derive(Debug, Default)]
pub struct ClassifierStats {
    pub packets: AtomicU64,
    pub batches: AtomicU64,
    pub client_hellos: AtomicU64,
    pub matched: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub packets: u64,
    pub batches: u64,
    pub client_hellos: u64,
    pub matched: u64,
}

impl ClassifierStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batch_received(&self, packets: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.packets.fetch_add(packets as u64, Ordering::Relaxed);
    }

    pub fn record(&self, classification: &Classification) {
        match classification {
            Classification::NotInteresting => {}
            Classification::Unmatched(_) => {
                self.client_hellos.fetch_add(1, Ordering::Relaxed);
            }
            Classification::Matched(_) => {
                self.client_hellos.fetch_add(1, Ordering::Relaxed);
                self.matched.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            client_hellos: self.client_hellos.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            target: "tunnel",
            packets = s.packets,
            batches = s.batches,
            client_hellos = s.client_hellos,
            matched = s.matched,
            "classifier stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_classification() {
        let stats = ClassifierStats::new();
        stats.batch_received(3);
        stats.record(&Classification::NotInteresting);
        stats.record(&Classification::Unmatched("example.org".into()));
        stats.record(&Classification::Matched("ls.apple.com".into()));

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                packets: 3,
                batches: 1,
                client_hellos: 2,
                matched: 1,
            }
        );
    }
}
