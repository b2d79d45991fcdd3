use std::env;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use sni_intercept::config::InterceptConfig;
use sni_intercept::key_store::FileKeyStore;
use sni_intercept::logging;
use sni_intercept::session::InterceptSession;
use tracing::info;

/// Standalone mode: prepares the root CA and serves it until Ctrl-C. Packet
/// classification needs an embedding host that owns the tunnel interface.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = match env::args().nth(1) {
        Some(path) => InterceptConfig::from_json_file(Path::new(&path))?,
        None => InterceptConfig::location_services(),
    };
    logging::init(config.log_level)?;

    info!(directory = %config.store.directory.display(), "using file key store");
    let store = Arc::new(FileKeyStore::new(&config.store.directory));

    let session = InterceptSession::start(config, store).await?;
    info!("certificate available at http://{}/cert", session.responder_addr());

    tokio::signal::ctrl_c().await?;
    session.shutdown().await?;
    Ok(())
}
