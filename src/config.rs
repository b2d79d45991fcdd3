use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::logging::LogLevel;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// Top-level configuration for the interception service
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Hostnames whose TLS flows are flagged, matched exactly or as a parent domain
    pub target_domains: Vec<String>,
    pub certificate: CertificateConfig,
    pub responder: ResponderConfig,
    pub store: StoreConfig,
    pub log_level: LogLevel,
}

impl InterceptConfig {
    /// Watches the location-service hosts and serves the CA on the tunnel address
    pub fn location_services() -> Self {
        Self {
            target_domains: vec!["gs-loc.apple.com".to_string(), "ls.apple.com".to_string()],
            certificate: CertificateConfig::default(),
            responder: ResponderConfig::default(),
            store: StoreConfig::default(),
            log_level: LogLevel::Info,
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_domains.iter().all(|d| d.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: "target_domains",
                message: "at least one domain is required".to_string(),
            });
        }
        if self.certificate.key_bits < 1024 {
            return Err(ConfigError::Invalid {
                field: "certificate.key_bits",
                message: format!("{} is below the 1024-bit minimum", self.certificate.key_bits),
            });
        }
        if self.certificate.validity_days == 0 {
            return Err(ConfigError::Invalid {
                field: "certificate.validity_days",
                message: "must be positive".to_string(),
            });
        }
        if self.certificate.label.is_empty() {
            return Err(ConfigError::Invalid {
                field: "certificate.label",
                message: "must not be empty".to_string(),
            });
        }
        if self.responder.max_request_bytes < 16 {
            return Err(ConfigError::Invalid {
                field: "responder.max_request_bytes",
                message: format!("{} cannot hold a request line", self.responder.max_request_bytes),
            });
        }
        Ok(())
    }
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self::location_services()
    }
}

/// Root CA identity and lifetime
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    /// Store label of the certificate; the private key lives under `<label>-PrivateKey`
    pub label: String,
    pub common_name: String,
    pub key_bits: usize,
    pub validity_days: u32,
}

impl CertificateConfig {
    pub fn private_key_label(&self) -> String {
        format!("{}-PrivateKey", self.label)
    }
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            label: "LocationCollector-RootCA".to_string(),
            common_name: "LocationCollector Root CA".to_string(),
            key_bits: crate::x509::DEFAULT_KEY_BITS,
            validity_days: 365,
        }
    }
}

/// Plain-HTTP certificate delivery endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// Tunnel-assigned address the client reaches through the VPN
    pub bind_address: IpAddr,
    pub port: u16,
    pub read_timeout_ms: u64,
    pub max_request_bytes: usize,
    pub download_filename: String,
}

impl ResponderConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([10, 0, 0, 1]),
            port: 8080,
            read_timeout_ms: 5_000,
            max_request_bytes: 8_192,
            download_filename: "LocationCollector-CA.pem".to_string(),
        }
    }
}

/// Backing directory for the file key store
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub directory: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("ca-store"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_location_service_deployment() {
        let config = InterceptConfig::default();
        assert_eq!(config.target_domains, vec!["gs-loc.apple.com", "ls.apple.com"]);
        assert_eq!(config.certificate.private_key_label(), "LocationCollector-RootCA-PrivateKey");
        assert_eq!(config.certificate.key_bits, 2048);
        assert_eq!(config.responder.port, 8080);
        assert_eq!(config.responder.read_timeout(), Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let config: InterceptConfig = serde_json::from_str(
            r#"{
                "target_domains": ["example.com"],
                "responder": { "bind_address": "127.0.0.1", "port": 0 },
                "log_level": "debug"
            }"#,
        )
        .unwrap();

        assert_eq!(config.target_domains, vec!["example.com"]);
        assert_eq!(config.responder.bind_address, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.responder.port, 0);
        assert_eq!(config.responder.max_request_bytes, 8_192);
        assert_eq!(config.certificate.validity_days, 365);
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn validation_rejects_unusable_values() {
        let mut config = InterceptConfig::default();
        config.target_domains = vec![" ".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "target_domains", .. })
        ));

        let mut config = InterceptConfig::default();
        config.certificate.key_bits = 512;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "certificate.key_bits", .. })
        ));

        let mut config = InterceptConfig::default();
        config.certificate.validity_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = InterceptConfig::from_json_file(Path::new("/nonexistent/intercept.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/intercept.json"));
    }
}
