use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mock_cache::{CacheRegistry, TtlLruCache};
use mock_core::KeyAlgorithm;
use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;

use crate::authority::{
    generate_authority, load_or_generate_authority, persist_authority_if_configured,
    validity_window, CertificateAuthority, CertificateAuthorityConfig,
};
use crate::key_pair::{generate_key_pair, provider_for, AsymmetricKeyPair};
use crate::TlsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCacheStatus {
    Hit,
    Miss,
}

impl LeafCacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

/// Key material and rustls config minted for one host.
#[derive(Debug)]
pub struct LeafCertificate {
    pub host: String,
    pub key_id: String,
    pub algorithm: KeyAlgorithm,
    pub ca_key_id: String,
    pub private_key_der: PrivatePkcs8KeyDer<'static>,
    pub certificate_der: CertificateDer<'static>,
    pub ca_certificate_der: CertificateDer<'static>,
    pub server_config: Arc<ServerConfig>,
}

impl LeafCertificate {
    /// Leaf first, then the CA. Handshakes present exactly this order.
    pub fn certificate_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.certificate_der.clone(), self.ca_certificate_der.clone()]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.private_key_der.clone_key())
    }
}

#[derive(Debug, Clone)]
pub struct IssuedLeaf {
    pub leaf: Arc<LeafCertificate>,
    pub cache_status: LeafCacheStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FactoryMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
    pub ca_regenerations: u64,
}

/// Issues the CA once and mints per-host leaves through a TTL/LRU cache.
pub struct CertificateFactory {
    config: CertificateAuthorityConfig,
    authority: RwLock<Option<Arc<CertificateAuthority>>>,
    leaf_cache: TtlLruCache<String, Arc<LeafCertificate>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
    ca_regenerations: AtomicU64,
}

impl CertificateFactory {
    pub fn new(
        config: CertificateAuthorityConfig,
        registry: &CacheRegistry,
    ) -> Result<Self, TlsError> {
        config.validate()?;
        let leaf_cache = TtlLruCache::new(
            registry,
            config.leaf_cert_cache_capacity,
            config.leaf_cert_cache_ttl,
        );
        Ok(Self {
            config,
            authority: RwLock::new(None),
            leaf_cache,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
            ca_regenerations: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &CertificateAuthorityConfig {
        &self.config
    }

    /// Loads or generates the CA on first use; later calls return the same instance.
    pub fn issue_certificate_authority(&self) -> Result<Arc<CertificateAuthority>, TlsError> {
        if let Some(authority) = self.authority.read().as_ref() {
            return Ok(Arc::clone(authority));
        }
        let mut slot = self.authority.write();
        if let Some(authority) = slot.as_ref() {
            return Ok(Arc::clone(authority));
        }
        let authority = Arc::new(load_or_generate_authority(&self.config)?);
        *slot = Some(Arc::clone(&authority));
        Ok(authority)
    }

    /// Replaces the CA and persists it when paths are configured.
    ///
    /// Cached leaves are stamped with the id of the CA that signed them, so leaves from the
    /// replaced CA are never served again and are overwritten on their next issuance.
    pub fn regenerate_certificate_authority(
        &self,
    ) -> Result<Arc<CertificateAuthority>, TlsError> {
        let next = generate_authority(&self.config)?;
        persist_authority_if_configured(&self.config, &next)?;
        let next = Arc::new(next);
        *self.authority.write() = Some(Arc::clone(&next));
        self.ca_regenerations.fetch_add(1, Ordering::Relaxed);
        Ok(next)
    }

    pub fn generate_key_pair(&self) -> Result<AsymmetricKeyPair, TlsError> {
        generate_key_pair(self.config.key_algorithm)
    }

    pub fn ca_certificate_pem(&self) -> Result<String, TlsError> {
        Ok(self.issue_certificate_authority()?.certificate_pem().to_string())
    }

    pub fn issue_leaf_certificate(&self, host: &str) -> Result<IssuedLeaf, TlsError> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(TlsError::InvalidConfiguration(
                "leaf host must not be empty".to_string(),
            ));
        }
        let authority = self.issue_certificate_authority()?;

        if let Some(leaf) = self.leaf_cache.get(&host) {
            if leaf.ca_key_id == authority.key_id() {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(IssuedLeaf {
                    leaf,
                    cache_status: LeafCacheStatus::Hit,
                });
            }
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let leaf = Arc::new(self.mint_leaf(&authority, &host)?);
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            host = %leaf.host,
            key_id = %leaf.key_id,
            algorithm = %leaf.algorithm,
            "issued leaf certificate"
        );
        self.leaf_cache.put(host, Arc::clone(&leaf));
        Ok(IssuedLeaf {
            leaf,
            cache_status: LeafCacheStatus::Miss,
        })
    }

    pub fn cached_leaf_count(&self) -> usize {
        self.leaf_cache.len()
    }

    pub fn metrics_snapshot(&self) -> FactoryMetricsSnapshot {
        FactoryMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
            ca_regenerations: self.ca_regenerations.load(Ordering::Relaxed),
        }
    }

    fn mint_leaf(
        &self,
        authority: &CertificateAuthority,
        host: &str,
    ) -> Result<LeafCertificate, TlsError> {
        let key = self.generate_key_pair()?;
        let params = self.build_leaf_params(host)?;
        let certificate = params.signed_by(&key.key_pair, &authority.issuer)?;
        let certificate_der = certificate.der().clone();
        let private_key_der = key.private_key_der();
        let ca_certificate_der = authority.certificate_der().clone();

        let chain = vec![certificate_der.clone(), ca_certificate_der.clone()];
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut server_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, PrivateKeyDer::Pkcs8(private_key_der.clone_key()))?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(LeafCertificate {
            host: host.to_string(),
            key_id: key.key_id,
            algorithm: key.algorithm,
            ca_key_id: authority.key_id().to_string(),
            private_key_der,
            certificate_der,
            ca_certificate_der,
            server_config: Arc::new(server_config),
        })
    }

    fn build_leaf_params(&self, host: &str) -> Result<CertificateParams, TlsError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.use_authority_key_identifier_extension = true;
        params.is_ca = IsCa::NoCa;
        params.key_usages = provider_for(self.config.key_algorithm.family()).leaf_key_usages();
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, host.to_string());
        params.distinguished_name = distinguished_name;

        let mut names = vec![host.to_string()];
        for extra in &self.config.leaf_subject_alternative_names {
            let extra = normalize_host(extra);
            if !extra.is_empty() && !names.contains(&extra) {
                names.push(extra);
            }
        }
        for name in names {
            let san = match name.parse::<IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(name.as_str().try_into()?),
            };
            params.subject_alt_names.push(san);
        }

        let (not_before, not_after) = validity_window(&self.config)?;
        params.not_before = not_before;
        params.not_after = not_after;
        Ok(params)
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host);
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}
