use std::sync::Arc;

use mock_cache::CacheRegistry;
use mock_core::KeyAlgorithm;
use mock_tls::{CertificateAuthorityConfig, CertificateFactory, LeafCertificate};
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::RootCertStore;

fn factory_for(algorithm: KeyAlgorithm) -> (CacheRegistry, CertificateFactory) {
    let registry = CacheRegistry::new();
    let config = CertificateAuthorityConfig {
        key_algorithm: algorithm,
        ..CertificateAuthorityConfig::default()
    };
    let factory = CertificateFactory::new(config, &registry).expect("factory");
    (registry, factory)
}

fn verifier_trusting(ca: &CertificateDer<'static>) -> Arc<WebPkiServerVerifier> {
    let mut roots = RootCertStore::empty();
    roots.add(ca.clone()).expect("trust test CA");
    WebPkiServerVerifier::builder_with_provider(
        Arc::new(roots),
        Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
    )
    .build()
    .expect("verifier")
}

fn verify(
    verifier: &WebPkiServerVerifier,
    leaf: &LeafCertificate,
    name: &str,
) -> Result<(), rustls::Error> {
    let chain = leaf.certificate_chain();
    let server_name = ServerName::try_from(name.to_string()).expect("server name");
    verifier
        .verify_server_cert(&chain[0], &chain[1..], &server_name, &[], UnixTime::now())
        .map(|_| ())
}

#[test]
fn minted_chain_validates_for_every_algorithm() {
    for algorithm in KeyAlgorithm::ALL {
        let (_registry, factory) = factory_for(algorithm);
        let authority = factory.issue_certificate_authority().expect("ca");
        let issued = factory
            .issue_leaf_certificate("example.com")
            .unwrap_or_else(|error| panic!("{algorithm}: leaf issuance failed: {error}"));
        assert_eq!(issued.leaf.algorithm, algorithm);

        let verifier = verifier_trusting(authority.certificate_der());
        verify(&verifier, &issued.leaf, "example.com")
            .unwrap_or_else(|error| panic!("{algorithm}: chain rejected: {error}"));
        assert!(
            verify(&verifier, &issued.leaf, "other.example").is_err(),
            "{algorithm}: leaf must not validate for another host"
        );
    }
}

#[test]
fn ip_literal_leaf_validates_for_ip_server_name() {
    let (_registry, factory) = factory_for(KeyAlgorithm::Ec256Sha256);
    let authority = factory.issue_certificate_authority().expect("ca");
    let issued = factory.issue_leaf_certificate("127.0.0.1").expect("ip leaf");

    let verifier = verifier_trusting(authority.certificate_der());
    verify(&verifier, &issued.leaf, "127.0.0.1").expect("ip SAN must validate");
}

#[test]
fn chain_is_rejected_by_client_trusting_another_ca() {
    let (_registry, factory) = factory_for(KeyAlgorithm::Ec256Sha256);
    let issued = factory.issue_leaf_certificate("example.com").expect("leaf");

    let (_other_registry, other) = factory_for(KeyAlgorithm::Ec256Sha256);
    let other_ca = other.issue_certificate_authority().expect("other ca");
    let verifier = verifier_trusting(other_ca.certificate_der());
    assert!(verify(&verifier, &issued.leaf, "example.com").is_err());
}
