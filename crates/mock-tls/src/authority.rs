use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use mock_core::{KeyAlgorithm, MockServerConfig};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::key_pair::generate_key_pair;
use crate::TlsError;

/// Everything the factory needs from the server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateAuthorityConfig {
    pub ca_cert_pem_path: Option<String>,
    pub ca_key_pem_path: Option<String>,
    pub ca_common_name: String,
    pub ca_organization: String,
    pub ca_locality: String,
    pub ca_state: String,
    pub ca_country: String,
    pub key_algorithm: KeyAlgorithm,
    pub certificate_backdate: Duration,
    pub certificate_validity: Duration,
    pub leaf_subject_alternative_names: Vec<String>,
    pub leaf_cert_cache_capacity: usize,
    pub leaf_cert_cache_ttl: Duration,
}

impl Default for CertificateAuthorityConfig {
    fn default() -> Self {
        Self::from_server_config(&MockServerConfig::default())
    }
}

impl CertificateAuthorityConfig {
    pub fn from_server_config(config: &MockServerConfig) -> Self {
        Self {
            ca_cert_pem_path: config.ca_cert_pem_path.clone(),
            ca_key_pem_path: config.ca_key_pem_path.clone(),
            ca_common_name: config.ca_common_name.clone(),
            ca_organization: config.ca_organization.clone(),
            ca_locality: config.ca_locality.clone(),
            ca_state: config.ca_state.clone(),
            ca_country: config.ca_country.clone(),
            key_algorithm: config.key_algorithm,
            certificate_backdate: config.certificate_backdate(),
            certificate_validity: config.certificate_validity(),
            leaf_subject_alternative_names: config.leaf_subject_alternative_names.clone(),
            leaf_cert_cache_capacity: config.leaf_cert_cache_capacity,
            leaf_cert_cache_ttl: config.leaf_cert_cache_ttl(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), TlsError> {
        match (
            self.ca_cert_pem_path.as_ref(),
            self.ca_key_pem_path.as_ref(),
        ) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => {
                return Err(TlsError::InvalidConfiguration(
                    "ca_cert_pem_path and ca_key_pem_path must either both be set or both be unset"
                        .to_string(),
                ));
            }
        }
        if self.ca_common_name.trim().is_empty() {
            return Err(TlsError::InvalidConfiguration(
                "ca_common_name must not be empty".to_string(),
            ));
        }
        if self.ca_organization.trim().is_empty() {
            return Err(TlsError::InvalidConfiguration(
                "ca_organization must not be empty".to_string(),
            ));
        }
        if self.certificate_validity.is_zero() {
            return Err(TlsError::InvalidConfiguration(
                "certificate_validity must be greater than zero".to_string(),
            ));
        }
        validity_window(self)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaOrigin {
    Generated,
    Loaded,
}

/// The signing root shared by every leaf until it is regenerated.
pub struct CertificateAuthority {
    key_id: String,
    algorithm: Option<KeyAlgorithm>,
    origin: CaOrigin,
    pub(crate) issuer: Issuer<'static, KeyPair>,
    certificate_der: CertificateDer<'static>,
    certificate_pem: String,
    private_key_pem: String,
}

impl CertificateAuthority {
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// `None` when the key was loaded from disk.
    pub fn algorithm(&self) -> Option<KeyAlgorithm> {
        self.algorithm
    }

    pub fn origin(&self) -> CaOrigin {
        self.origin
    }

    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.certificate_der
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

pub(crate) fn load_or_generate_authority(
    config: &CertificateAuthorityConfig,
) -> Result<CertificateAuthority, TlsError> {
    match (&config.ca_cert_pem_path, &config.ca_key_pem_path) {
        (Some(ca_cert_path), Some(ca_key_path)) => {
            let cert_exists = Path::new(ca_cert_path).exists();
            let key_exists = Path::new(ca_key_path).exists();

            match (cert_exists, key_exists) {
                (true, true) => load_authority(ca_cert_path, ca_key_path),
                (false, false) => {
                    let generated = generate_authority(config)?;
                    persist_authority(ca_cert_path, ca_key_path, &generated)?;
                    Ok(generated)
                }
                _ => Err(TlsError::InvalidConfiguration(
                    "CA cert and key files must both exist or both be absent".to_string(),
                )),
            }
        }
        (None, None) => generate_authority(config),
        _ => Err(TlsError::InvalidConfiguration(
            "ca_cert_pem_path and ca_key_pem_path must be set together".to_string(),
        )),
    }
}

pub(crate) fn generate_authority(
    config: &CertificateAuthorityConfig,
) -> Result<CertificateAuthority, TlsError> {
    let key = generate_key_pair(config.key_algorithm)?;
    let private_key_pem = key.private_key_pem();
    let params = build_ca_params(config)?;
    let certificate = params.self_signed(&key.key_pair)?;
    let certificate_pem = certificate.pem();
    let certificate_der = certificate.der().clone();
    tracing::info!(
        key_id = %key.key_id,
        algorithm = %key.algorithm,
        common_name = %config.ca_common_name,
        "generated certificate authority"
    );

    Ok(CertificateAuthority {
        key_id: key.key_id,
        algorithm: Some(key.algorithm),
        origin: CaOrigin::Generated,
        issuer: Issuer::new(params, key.key_pair),
        certificate_der,
        certificate_pem,
        private_key_pem,
    })
}

fn load_authority(
    ca_cert_path: &str,
    ca_key_path: &str,
) -> Result<CertificateAuthority, TlsError> {
    let certificate_pem = fs::read_to_string(ca_cert_path)?;
    let private_key_pem = fs::read_to_string(ca_key_path)?;
    let certificate_der =
        CertificateDer::from_pem_slice(certificate_pem.as_bytes()).map_err(|error| {
            TlsError::InvalidConfiguration(format!(
                "failed to parse CA certificate PEM from {ca_cert_path}: {error}"
            ))
        })?;
    let key_pair = KeyPair::from_pem(&private_key_pem).map_err(|error| {
        TlsError::InvalidConfiguration(format!(
            "failed to parse CA private key PEM from {ca_key_path}: {error}"
        ))
    })?;
    let issuer = Issuer::from_ca_cert_der(&certificate_der, key_pair).map_err(|error| {
        TlsError::InvalidConfiguration(format!(
            "failed to parse issuer metadata from CA certificate {ca_cert_path}: {error}"
        ))
    })?;
    let key_id = Uuid::new_v4().to_string();
    tracing::info!(%key_id, path = %ca_cert_path, "loaded certificate authority");

    Ok(CertificateAuthority {
        key_id,
        algorithm: None,
        origin: CaOrigin::Loaded,
        issuer,
        certificate_der,
        certificate_pem,
        private_key_pem,
    })
}

pub(crate) fn persist_authority_if_configured(
    config: &CertificateAuthorityConfig,
    authority: &CertificateAuthority,
) -> Result<(), TlsError> {
    if let (Some(ca_cert_path), Some(ca_key_path)) =
        (&config.ca_cert_pem_path, &config.ca_key_pem_path)
    {
        persist_authority(ca_cert_path, ca_key_path, authority)?;
    }
    Ok(())
}

fn persist_authority(
    ca_cert_path: &str,
    ca_key_path: &str,
    authority: &CertificateAuthority,
) -> Result<(), TlsError> {
    ensure_parent_exists(ca_cert_path)?;
    ensure_parent_exists(ca_key_path)?;

    fs::write(ca_cert_path, authority.certificate_pem.as_bytes())?;
    fs::write(ca_key_path, authority.private_key_pem.as_bytes())?;
    Ok(())
}

fn ensure_parent_exists(path: &str) -> Result<(), TlsError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn build_ca_params(config: &CertificateAuthorityConfig) -> Result<CertificateParams, TlsError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.ca_common_name.clone());
    distinguished_name.push(DnType::OrganizationName, config.ca_organization.clone());
    push_if_present(&mut distinguished_name, DnType::LocalityName, &config.ca_locality);
    push_if_present(
        &mut distinguished_name,
        DnType::StateOrProvinceName,
        &config.ca_state,
    );
    push_if_present(&mut distinguished_name, DnType::CountryName, &config.ca_country);
    params.distinguished_name = distinguished_name;

    let (not_before, not_after) = validity_window(config)?;
    params.not_before = not_before;
    params.not_after = not_after;
    Ok(params)
}

fn push_if_present(name: &mut DistinguishedName, kind: DnType, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        name.push(kind, value.to_string());
    }
}

/// `now - backdate .. now + validity`, shared by the CA and every leaf.
pub(crate) fn validity_window(
    config: &CertificateAuthorityConfig,
) -> Result<(OffsetDateTime, OffsetDateTime), TlsError> {
    let now = OffsetDateTime::now_utc();
    let out_of_range = |field: &str| {
        TlsError::InvalidConfiguration(format!("{field} is outside the representable date range"))
    };
    let backdate = time::Duration::try_from(config.certificate_backdate)
        .map_err(|_| out_of_range("certificate_backdate"))?;
    let validity = time::Duration::try_from(config.certificate_validity)
        .map_err(|_| out_of_range("certificate_validity"))?;
    let not_before = now
        .checked_sub(backdate)
        .ok_or_else(|| out_of_range("certificate_backdate"))?;
    let not_after = now
        .checked_add(validity)
        .ok_or_else(|| out_of_range("certificate_validity"))?;
    Ok((not_before, not_after))
}
