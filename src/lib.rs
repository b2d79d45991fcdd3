//! Flags HTTPS flows to a watch-list of hosts by reading the SNI of each TLS
//! ClientHello that crosses a packet tunnel, and issues the self-signed root CA
//! a client installs to trust the interception.

pub mod asn1;
pub mod ca;
pub mod classifier;
pub mod config;
pub mod key_store;
pub mod logging;
pub mod packet;
pub mod pem;
pub mod responder;
pub mod session;
pub mod stats;
pub mod tls;
pub mod tunnel;
pub mod x509;

#[cfg(test)]
mod pipeline_tests;

pub use classifier::{is_target_domain, Classification, Interception, TargetDomainSet};
pub use config::InterceptConfig;
pub use session::InterceptSession;
