mod authority;
mod factory;
mod key_pair;

use mock_core::KeyAlgorithm;
use thiserror::Error;

pub use authority::{CaOrigin, CertificateAuthority, CertificateAuthorityConfig};
pub use factory::{
    CertificateFactory, FactoryMetricsSnapshot, IssuedLeaf, LeafCacheStatus, LeafCertificate,
};
pub use key_pair::{
    algorithm_spec, generate_key_pair, provider_for, AlgorithmSpec, AsymmetricKeyPair,
    EcKeyPairProvider, KeyPairProvider, RsaKeyPairProvider,
};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("{algorithm} key generation failed: {source}")]
    KeyGeneration {
        algorithm: KeyAlgorithm,
        #[source]
        source: rcgen::Error,
    },
    #[error("certificate signing failed: {0}")]
    CertificateSigning(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid TLS configuration: {0}")]
    InvalidConfiguration(String),
}
