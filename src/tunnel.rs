//! Packet tunnel loop: read a batch, classify each packet, write the batch
//! back unchanged, re-arm.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::classifier::{Classification, Interception, TargetDomainSet};
use crate::packet::{self, Packet};
use crate::stats::ClassifierStats;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to read packets from tunnel: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write packets to tunnel: {0}")]
    Write(#[source] io::Error),
}

/// The virtual interface's packet queue.
#[async_trait]
pub trait PacketFlow: Send {
    /// Next batch of outbound packets, or `None` once the interface is closed.
    async fn read_packets(&mut self) -> io::Result<Option<Vec<Packet>>>;

    /// Re-inject packets into the network stack.
    async fn write_packets(&mut self, packets: Vec<Packet>) -> io::Result<()>;
}

pub struct PacketForwarder {
    targets: TargetDomainSet,
    stats: Arc<ClassifierStats>,
    events: Option<mpsc::Sender<Interception>>,
    running: AtomicBool,
}

impl PacketForwarder {
    pub fn new(targets: TargetDomainSet) -> Self {
        Self {
            targets,
            stats: ClassifierStats::new(),
            events: None,
            running: AtomicBool::new(false),
        }
    }

    /// Matched flows are also sent here. A full channel drops the event, never
    /// the packet.
    pub fn with_events(mut self, events: mpsc::Sender<Interception>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn targets(&self) -> &TargetDomainSet {
        &self.targets
    }

    pub fn stats(&self) -> Arc<ClassifierStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs until the flow closes or `shutdown` flips to true.
    pub async fn run<F: PacketFlow>(
        &self,
        flow: &mut F,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        self.running.store(true, Ordering::SeqCst);
        let _running = scopeguard::guard(&self.running, |flag| flag.store(false, Ordering::SeqCst));

        info!(target: "tunnel", targets = self.targets.len(), "packet forwarding started");

        loop {
            tokio::select! {
                batch = flow.read_packets() => {
                    let Some(batch) = batch.map_err(TunnelError::Read)? else {
                        info!(target: "tunnel", "packet flow closed");
                        break;
                    };
                    self.process_batch(&batch);
                    flow.write_packets(batch).await.map_err(TunnelError::Write)?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(target: "tunnel", "packet forwarding stopping");
                        break;
                    }
                }
            }
        }

        self.stats.log_summary();
        Ok(())
    }

    /// Classifies every packet in a batch. The batch itself is never altered.
    pub fn process_batch(&self, batch: &[Packet]) -> Vec<Classification> {
        self.stats.batch_received(batch.len());
        batch.iter().map(|packet| self.inspect(packet)).collect()
    }

    fn inspect(&self, packet: &Packet) -> Classification {
        let packet::Inspection {
            classification,
            endpoints,
        } = packet::inspect(packet, &self.targets);
        self.stats.record(&classification);

        match &classification {
            Classification::Matched(hostname) => {
                info!(target: "tunnel", %hostname, "intercepted TLS connection to target domain");
                if let Some((source, destination)) = endpoints {
                    self.emit(Interception {
                        hostname: hostname.clone(),
                        source,
                        destination,
                    });
                }
            }
            Classification::Unmatched(hostname) => {
                debug!(target: "tunnel", %hostname, "TLS connection outside watch-list");
            }
            Classification::NotInteresting => {}
        }
        classification
    }

    fn emit(&self, event: Interception) {
        let Some(events) = &self.events else {
            return;
        };
        match events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(target: "tunnel", hostname = %event.hostname, "interception channel full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(target: "tunnel", "interception receiver gone");
            }
        }
    }
}
