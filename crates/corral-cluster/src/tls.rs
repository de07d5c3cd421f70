//! Certificate material.
//!
//! Each member has a self-signed server certificate that identifies it to
//! peers, and every member holds the shared cluster certificate handed
//! out by the join flow. Both are generated with `rcgen` and stored as
//! PEM files.

use std::path::Path;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use tracing::info;

/// A certificate and its private key, both PEM-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertKeyPair {
    pub cert_pem: String,
    pub key_pem: String,
}

impl CertKeyPair {
    /// Read a pair from disk, or `None` if either file is missing.
    pub fn load(cert_path: &Path, key_path: &Path) -> anyhow::Result<Option<Self>> {
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }
        Ok(Some(Self {
            cert_pem: std::fs::read_to_string(cert_path)?,
            key_pem: std::fs::read_to_string(key_path)?,
        }))
    }

    pub fn write(&self, cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(cert_path, &self.cert_pem)?;
        std::fs::write(key_path, &self.key_pem)?;
        Ok(())
    }

    /// Load the pair at the given paths, generating and saving it if absent.
    pub fn load_or_generate(
        cert_path: &Path,
        key_path: &Path,
        generate: impl FnOnce() -> anyhow::Result<Self>,
    ) -> anyhow::Result<Self> {
        if let Some(pair) = Self::load(cert_path, key_path)? {
            return Ok(pair);
        }
        let pair = generate()?;
        pair.write(cert_path, key_path)?;
        Ok(pair)
    }
}

/// Generate the shared cluster certificate.
pub fn generate_cluster_certificate(cluster: &str) -> anyhow::Result<CertKeyPair> {
    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "corral");
    dn.push(DnType::CommonName, cluster);
    params.distinguished_name = dn;
    params.not_after = rcgen::date_time_ymd(2046, 1, 1);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    info!(%cluster, "generated cluster certificate");
    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Generate a self-signed server certificate for one member.
pub fn generate_server_certificate(name: &str, address: &str) -> anyhow::Result<CertKeyPair> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "corral");
    dn.push(DnType::CommonName, name);
    params.distinguished_name = dn;

    let host = address
        .rsplit_once(':')
        .map_or(address, |(host, _)| host)
        .trim_start_matches('[')
        .trim_end_matches(']');
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else if !host.is_empty() {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.to_string().try_into()?));
    }
    params.not_after = rcgen::date_time_ymd(2046, 1, 1);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    info!(member = %name, %address, "generated server certificate");
    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}
