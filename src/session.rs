use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ca::{CaError, CertificateAuthority};
use crate::classifier::{Interception, TargetDomainSet};
use crate::config::InterceptConfig;
use crate::key_store::KeyStore;
use crate::responder::{CertificateResponder, ResponderError};
use crate::tunnel::{PacketFlow, PacketForwarder, TunnelError};

const INTERCEPTION_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Ca(#[from] CaError),
    #[error(transparent)]
    Responder(#[from] ResponderError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Owns every long-lived component of one interception run.
///
/// Components are built in dependency order (store, authority, responder,
/// forwarder) and stopped together by [`InterceptSession::shutdown`].
pub struct InterceptSession {
    ca: Arc<CertificateAuthority>,
    forwarder: Arc<PacketForwarder>,
    responder_addr: SocketAddr,
    responder_task: JoinHandle<Result<(), ResponderError>>,
    interceptions: Option<mpsc::Receiver<Interception>>,
    shutdown: watch::Sender<bool>,
}

impl InterceptSession {
    /// Makes sure a root CA exists, then starts serving it. Key generation runs
    /// on the blocking pool.
    pub async fn start(config: InterceptConfig, store: Arc<dyn KeyStore>) -> Result<Self, SessionError> {
        let ca = Arc::new(CertificateAuthority::new(store, config.certificate.clone()));

        let certificate = tokio::task::spawn_blocking({
            let ca = Arc::clone(&ca);
            move || ca.ensure_root_ca()
        })
        .await??;
        info!(bytes = certificate.len(), "root CA ready");

        let (shutdown, shutdown_rx) = watch::channel(false);

        let responder = CertificateResponder::bind(Arc::clone(&ca), config.responder.clone())?;
        let responder_addr = responder
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(config.responder.bind_address, config.responder.port));
        let responder_task = tokio::spawn(async move { responder.serve(shutdown_rx).await });

        let (events_tx, events_rx) = mpsc::channel(INTERCEPTION_QUEUE);
        let targets = TargetDomainSet::new(&config.target_domains);
        info!(domains = ?targets.iter().collect::<Vec<_>>(), "watching target domains");
        let forwarder = Arc::new(PacketForwarder::new(targets).with_events(events_tx));

        Ok(Self {
            ca,
            forwarder,
            responder_addr,
            responder_task,
            interceptions: Some(events_rx),
            shutdown,
        })
    }

    pub fn certificate_authority(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    pub fn forwarder(&self) -> &Arc<PacketForwarder> {
        &self.forwarder
    }

    pub fn responder_addr(&self) -> SocketAddr {
        self.responder_addr
    }

    /// Matched flows, for whatever terminates them. Can be taken once.
    pub fn take_interceptions(&mut self) -> Option<mpsc::Receiver<Interception>> {
        self.interceptions.take()
    }

    /// Drives `flow` until it closes or the session shuts down.
    pub async fn run_tunnel<F: PacketFlow>(&self, flow: &mut F) -> Result<(), TunnelError> {
        self.forwarder.run(flow, self.shutdown.subscribe()).await
    }

    /// Signals every component to stop and waits for the responder to release
    /// its listener.
    pub async fn shutdown(self) -> Result<(), SessionError> {
        info!("shutting down interception session");
        if self.shutdown.send(true).is_err() {
            warn!("no component was listening for shutdown");
        }
        self.responder_task.await??;
        Ok(())
    }
}
