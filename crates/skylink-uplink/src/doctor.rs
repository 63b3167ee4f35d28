use anyhow::{Context, Result};
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::BusConfig;

pub fn check_bus(cfg: &BusConfig) -> Result<()> {
    anyhow::ensure!(!cfg.host.trim().is_empty(), "bus.host is empty");
    anyhow::ensure!(cfg.port() != 0, "bus.port must be non-zero");
    anyhow::ensure!(cfg.keep_alive_s >= 5, "bus.keep_alive_s too small; set >= 5");
    anyhow::ensure!(cfg.connect_timeout_s >= 1, "bus.connect_timeout_s must be >= 1");
    for (key, topic) in [("bus.command_topic", &cfg.command_topic), ("bus.telemetry_topic", &cfg.telemetry_topic)] {
        anyhow::ensure!(!topic.is_empty(), "{key} is empty");
        anyhow::ensure!(!topic.contains(['+', '#']), "{key} must not contain wildcards: {topic}");
    }
    anyhow::ensure!(cfg.command_topic != cfg.telemetry_topic, "command and telemetry topics must differ");
    Ok(())
}

/// Loads the CA, client chain and key, and builds a client TLS config from
/// them. Returns the number of trusted roots.
pub fn check_tls(cfg: &BusConfig) -> Result<usize> {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(&cfg.ca_cert)
        .with_context(|| format!("read bus.ca_cert {}", cfg.ca_cert.display()))?
    {
        roots
            .add(cert.context("parse CA certificate")?)
            .context("add CA certificate to root store")?;
    }
    anyhow::ensure!(!roots.is_empty(), "bus.ca_cert {} holds no certificates", cfg.ca_cert.display());

    let chain = CertificateDer::pem_file_iter(&cfg.client_cert)
        .with_context(|| format!("read bus.client_cert {}", cfg.client_cert.display()))?
        .collect::<Result<Vec<_>, _>>()
        .context("parse client certificate chain")?;
    anyhow::ensure!(!chain.is_empty(), "bus.client_cert {} holds no certificates", cfg.client_cert.display());

    let key = PrivateKeyDer::from_pem_file(&cfg.client_key)
        .with_context(|| format!("read bus.client_key {}", cfg.client_key.display()))?;

    let n = roots.len();
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .context("client certificate and key do not form a usable TLS identity")?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn topics_must_be_concrete_and_distinct() {
        let mut cfg = BusConfig::new("broker");
        assert!(check_bus(&cfg).is_ok());

        cfg.telemetry_topic = "drone/#".into();
        assert!(check_bus(&cfg).is_err());

        cfg.telemetry_topic = cfg.command_topic.clone();
        assert!(check_bus(&cfg).is_err());
    }

    #[test]
    fn empty_host_rejected() {
        assert!(check_bus(&BusConfig::new(" ")).is_err());
    }

    #[test]
    fn missing_ca_is_named() {
        let cfg = BusConfig { ca_cert: PathBuf::from("/nonexistent/ca.crt"), ..BusConfig::new("broker") };
        let err = check_tls(&cfg).unwrap_err();
        assert!(format!("{err:#}").contains("bus.ca_cert /nonexistent/ca.crt"));
    }
}
