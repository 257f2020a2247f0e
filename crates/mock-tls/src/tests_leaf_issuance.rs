use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mock_cache::CacheRegistry;
use mock_core::KeyAlgorithm;
use rustls::pki_types::CertificateDer;
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

use super::{CertificateFactory, LeafCacheStatus};
use crate::{CaOrigin, CertificateAuthorityConfig, TlsError};

fn factory(config: CertificateAuthorityConfig) -> (CacheRegistry, CertificateFactory) {
    let registry = CacheRegistry::new();
    let factory = CertificateFactory::new(config, &registry).expect("factory");
    (registry, factory)
}

#[test]
fn repeated_issuance_within_ttl_returns_identical_material() {
    let (_registry, factory) = factory(CertificateAuthorityConfig::default());
    let first = factory.issue_leaf_certificate("example.com").expect("first leaf");
    let second = factory.issue_leaf_certificate("example.com").expect("second leaf");

    assert_eq!(first.cache_status, LeafCacheStatus::Miss);
    assert_eq!(second.cache_status, LeafCacheStatus::Hit);
    assert!(Arc::ptr_eq(&first.leaf, &second.leaf));
    assert_eq!(
        first.leaf.private_key_der.secret_pkcs8_der(),
        second.leaf.private_key_der.secret_pkcs8_der()
    );
    assert_eq!(first.leaf.certificate_der, second.leaf.certificate_der);
    assert_eq!(
        first.leaf.private_key().secret_der(),
        second.leaf.private_key_der.secret_pkcs8_der()
    );

    let metrics = factory.metrics_snapshot();
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.cache_misses, 1);
    assert_eq!(metrics.leaves_issued, 1);
}

#[test]
fn signing_failure_for_one_host_leaves_other_cached_leaves_intact() {
    let (_registry, factory) = factory(CertificateAuthorityConfig::default());
    let cached = factory.issue_leaf_certificate("example.com").expect("leaf");
    assert_eq!(factory.cached_leaf_count(), 1);

    let error = factory
        .issue_leaf_certificate("exämple.com")
        .expect_err("non-ASCII DNS name cannot be signed");
    assert!(
        matches!(error, TlsError::CertificateSigning(_)),
        "unexpected error: {error:?}"
    );
    assert_eq!(factory.cached_leaf_count(), 1);
    assert_eq!(factory.metrics_snapshot().leaves_issued, 1);

    let again = factory.issue_leaf_certificate("example.com").expect("leaf again");
    assert_eq!(again.cache_status, LeafCacheStatus::Hit);
    assert!(Arc::ptr_eq(&cached.leaf, &again.leaf));
    assert_eq!(factory.cached_leaf_count(), 1);
}

#[test]
fn issuance_after_ttl_expiry_mints_a_new_key_pair() {
    let config = CertificateAuthorityConfig {
        leaf_cert_cache_ttl: Duration::from_millis(50),
        ..CertificateAuthorityConfig::default()
    };
    let (_registry, factory) = factory(config);
    let first = factory.issue_leaf_certificate("example.com").expect("first leaf");
    thread::sleep(Duration::from_millis(120));
    let second = factory.issue_leaf_certificate("example.com").expect("second leaf");

    assert_eq!(second.cache_status, LeafCacheStatus::Miss);
    assert_ne!(first.leaf.key_id, second.leaf.key_id);
    assert_ne!(
        first.leaf.private_key_der.secret_pkcs8_der(),
        second.leaf.private_key_der.secret_pkcs8_der()
    );
}

#[test]
fn disabled_caches_always_mint_fresh_leaves() {
    let (registry, factory) = factory(CertificateAuthorityConfig::default());
    registry.set_all_caches_enabled(false);

    let first = factory.issue_leaf_certificate("example.com").expect("first leaf");
    let second = factory.issue_leaf_certificate("example.com").expect("second leaf");
    assert_eq!(first.cache_status, LeafCacheStatus::Miss);
    assert_eq!(second.cache_status, LeafCacheStatus::Miss);
    assert_ne!(first.leaf.key_id, second.leaf.key_id);
    assert_eq!(factory.cached_leaf_count(), 0);
}

#[test]
fn host_names_are_normalized_before_caching() {
    let (_registry, factory) = factory(CertificateAuthorityConfig::default());
    let upper = factory.issue_leaf_certificate("API.Example.COM").expect("upper");
    let lower = factory.issue_leaf_certificate("api.example.com").expect("lower");
    assert_eq!(lower.cache_status, LeafCacheStatus::Hit);
    assert_eq!(upper.leaf.host, "api.example.com");

    let bracketed = factory.issue_leaf_certificate("[2001:db8::1]").expect("ipv6");
    assert_eq!(bracketed.leaf.host, "2001:db8::1");
}

#[test]
fn leaf_subject_and_san_cover_domain_and_ip() {
    let (_registry, factory) = factory(CertificateAuthorityConfig::default());

    let domain = factory.issue_leaf_certificate("api.example.com").expect("domain leaf");
    assert_common_name(&domain.leaf.certificate_der, "api.example.com");
    assert_dns_name(&domain.leaf.certificate_der, "api.example.com");

    let ip = factory.issue_leaf_certificate("127.0.0.1").expect("ip leaf");
    assert_common_name(&ip.leaf.certificate_der, "127.0.0.1");
    assert_ip(&ip.leaf.certificate_der, &[127, 0, 0, 1]);
}

#[test]
fn configured_extra_sans_are_added_once() {
    let config = CertificateAuthorityConfig {
        leaf_subject_alternative_names: vec![
            "localhost".to_string(),
            "EXAMPLE.com".to_string(),
            "10.0.0.7".to_string(),
        ],
        ..CertificateAuthorityConfig::default()
    };
    let (_registry, factory) = factory(config);
    let issued = factory.issue_leaf_certificate("example.com").expect("leaf");

    let names = general_names(&issued.leaf.certificate_der);
    assert_eq!(names.iter().filter(|name| *name == "dns:example.com").count(), 1);
    assert!(names.contains(&"dns:localhost".to_string()));
    assert!(names.contains(&"ip:10.0.0.7".to_string()));
}

#[test]
fn chain_is_leaf_then_ca() {
    let (_registry, factory) = factory(CertificateAuthorityConfig::default());
    let issued = factory.issue_leaf_certificate("example.com").expect("leaf");
    let authority = factory.issue_certificate_authority().expect("ca");

    let chain = issued.leaf.certificate_chain();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0], issued.leaf.certificate_der);
    assert_eq!(&chain[1], authority.certificate_der());
    assert_issuer_common_name(&chain[0], "mock-proxy Local CA");
}

#[test]
fn validity_window_is_backdated_and_wide() {
    let (_registry, factory) = factory(CertificateAuthorityConfig::default());
    let issued = factory.issue_leaf_certificate("example.com").expect("leaf");
    let authority = factory.issue_certificate_authority().expect("ca");
    let now = time::OffsetDateTime::now_utc().unix_timestamp();

    for der in [&issued.leaf.certificate_der, authority.certificate_der()] {
        let (_, cert) = parse_x509_certificate(der.as_ref()).expect("parse x509");
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        assert!(not_before < now && now < not_after);
        assert!(now - not_before >= 4 * 24 * 60 * 60, "backdated by about five days");
        assert!(not_after - now >= 364 * 24 * 60 * 60, "valid for about a year");
    }
}

#[test]
fn ca_subject_carries_configured_distinguished_name() {
    let config = CertificateAuthorityConfig {
        ca_organization: "Acme Testing".to_string(),
        ca_locality: "Leeds".to_string(),
        ca_state: "West Yorkshire".to_string(),
        ca_country: "GB".to_string(),
        ..CertificateAuthorityConfig::default()
    };
    let (_registry, factory) = factory(config);
    let authority = factory.issue_certificate_authority().expect("ca");
    assert_eq!(authority.origin(), CaOrigin::Generated);
    assert_eq!(authority.algorithm(), Some(KeyAlgorithm::Ec256Sha256));

    let (_, cert) = parse_x509_certificate(authority.certificate_der().as_ref()).expect("parse");
    let subject = cert.subject();
    let first = |values: Vec<&str>| values.first().map(|value| value.to_string());
    assert_eq!(
        first(subject.iter_organization().filter_map(|v| v.as_str().ok()).collect()),
        Some("Acme Testing".to_string())
    );
    assert_eq!(
        first(subject.iter_locality().filter_map(|v| v.as_str().ok()).collect()),
        Some("Leeds".to_string())
    );
    assert_eq!(
        first(subject.iter_state_or_province().filter_map(|v| v.as_str().ok()).collect()),
        Some("West Yorkshire".to_string())
    );
    assert_eq!(
        first(subject.iter_country().filter_map(|v| v.as_str().ok()).collect()),
        Some("GB".to_string())
    );
    assert!(cert.is_ca());
}

#[test]
fn rsa_leaves_allow_key_encipherment() {
    let config = CertificateAuthorityConfig {
        key_algorithm: KeyAlgorithm::Rsa2048Sha256,
        ..CertificateAuthorityConfig::default()
    };
    let (_registry, factory) = factory(config);
    let issued = factory.issue_leaf_certificate("example.com").expect("rsa leaf");
    assert_eq!(issued.leaf.algorithm, KeyAlgorithm::Rsa2048Sha256);

    let (_, cert) = parse_x509_certificate(issued.leaf.certificate_der.as_ref()).expect("parse");
    let key_usage = cert
        .key_usage()
        .expect("key usage parse")
        .expect("key usage present");
    assert!(key_usage.value.digital_signature());
    assert!(key_usage.value.key_encipherment());
}

#[test]
fn certificate_authority_is_issued_once() {
    let (_registry, factory) = factory(CertificateAuthorityConfig::default());
    let first = factory.issue_certificate_authority().expect("first");
    let second = factory.issue_certificate_authority().expect("second");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(factory.ca_certificate_pem().expect("pem"), first.certificate_pem());
}

#[test]
fn regenerated_authority_invalidates_cached_leaves() {
    let (_registry, factory) = factory(CertificateAuthorityConfig::default());
    let before_ca = factory.ca_certificate_pem().expect("ca");
    let before = factory.issue_leaf_certificate("api.example.com").expect("leaf");

    let next = factory.regenerate_certificate_authority().expect("regenerate");
    assert_ne!(before_ca, next.certificate_pem());

    let after = factory.issue_leaf_certificate("api.example.com").expect("leaf after");
    assert_eq!(after.cache_status, LeafCacheStatus::Miss);
    assert_ne!(before.leaf.key_id, after.leaf.key_id);
    assert_eq!(after.leaf.ca_key_id, next.key_id());
    assert_eq!(factory.metrics_snapshot().ca_regenerations, 1);

    let again = factory.issue_leaf_certificate("api.example.com").expect("leaf again");
    assert_eq!(again.cache_status, LeafCacheStatus::Hit);
}

#[test]
fn empty_host_is_rejected_without_touching_cache() {
    let (_registry, factory) = factory(CertificateAuthorityConfig::default());
    let error = factory.issue_leaf_certificate("  ").expect_err("empty host");
    assert!(matches!(error, TlsError::InvalidConfiguration(_)), "{error}");
    assert_eq!(factory.cached_leaf_count(), 0);
}

#[test]
fn persisted_authority_is_reloaded_with_its_original_subject() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let ca_cert_path = temp_dir.path().join("nested").join("ca-cert.pem");
    let ca_key_path = temp_dir.path().join("nested").join("ca-key.pem");
    let initial = CertificateAuthorityConfig {
        ca_cert_pem_path: Some(path_to_string(&ca_cert_path)),
        ca_key_pem_path: Some(path_to_string(&ca_key_path)),
        ca_common_name: "initial.mock-proxy-ca".to_string(),
        ..CertificateAuthorityConfig::default()
    };

    let (_registry, first) = factory(initial.clone());
    let first_ca = first.ca_certificate_pem().expect("first ca");
    assert!(ca_cert_path.exists());
    assert!(ca_key_path.exists());
    drop(first);

    let drifted = CertificateAuthorityConfig {
        ca_common_name: "drifted.mock-proxy-ca".to_string(),
        ..initial
    };
    let (_registry, second) = factory(drifted);
    let authority = second.issue_certificate_authority().expect("second ca");
    assert_eq!(authority.origin(), CaOrigin::Loaded);
    assert_eq!(authority.certificate_pem(), first_ca);

    let leaf = second.issue_leaf_certificate("api.example.com").expect("leaf");
    assert_issuer_common_name(&leaf.leaf.certificate_der, "initial.mock-proxy-ca");
}

#[test]
fn regeneration_rewrites_persisted_files() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let ca_cert_path = temp_dir.path().join("ca-cert.pem");
    let ca_key_path = temp_dir.path().join("ca-key.pem");
    let config = CertificateAuthorityConfig {
        ca_cert_pem_path: Some(path_to_string(&ca_cert_path)),
        ca_key_pem_path: Some(path_to_string(&ca_key_path)),
        ..CertificateAuthorityConfig::default()
    };
    let (_registry, factory) = factory(config);
    let before = factory.ca_certificate_pem().expect("ca");
    let next = factory.regenerate_certificate_authority().expect("regenerate");

    let on_disk = fs::read_to_string(&ca_cert_path).expect("read cert");
    assert_ne!(on_disk, before);
    assert_eq!(on_disk, next.certificate_pem());
}

#[test]
fn half_present_persisted_pair_is_rejected() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let ca_cert_path = temp_dir.path().join("ca-cert.pem");
    let ca_key_path = temp_dir.path().join("ca-key.pem");
    fs::write(&ca_cert_path, "not a certificate").expect("write cert");
    let config = CertificateAuthorityConfig {
        ca_cert_pem_path: Some(path_to_string(&ca_cert_path)),
        ca_key_pem_path: Some(path_to_string(&ca_key_path)),
        ..CertificateAuthorityConfig::default()
    };
    let (_registry, factory) = factory(config);
    let error = factory.issue_certificate_authority().expect_err("half pair");
    assert!(error.to_string().contains("both exist or both be absent"), "{error}");
}

#[test]
fn partial_path_configuration_is_rejected() {
    let config = CertificateAuthorityConfig {
        ca_cert_pem_path: Some("/tmp/mock-proxy-only-cert.pem".to_string()),
        ca_key_pem_path: None,
        ..CertificateAuthorityConfig::default()
    };
    let error = match CertificateFactory::new(config, &CacheRegistry::new()) {
        Ok(_) => panic!("partial CA path configuration unexpectedly succeeded"),
        Err(error) => error,
    };
    assert!(
        error
            .to_string()
            .contains("must either both be set or both be unset"),
        "{error}"
    );
}

fn assert_common_name(cert_der: &CertificateDer<'static>, expected: &str) {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let subject = cert.subject();
    let cn = subject
        .iter_common_name()
        .next()
        .expect("commonName")
        .as_str()
        .expect("commonName as utf8");
    assert_eq!(cn, expected);
}

fn assert_issuer_common_name(cert_der: &CertificateDer<'static>, expected: &str) {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let issuer = cert.issuer();
    let cn = issuer
        .iter_common_name()
        .next()
        .expect("issuer commonName")
        .as_str()
        .expect("issuer commonName as utf8");
    assert_eq!(cn, expected);
}

fn assert_dns_name(cert_der: &CertificateDer<'static>, expected: &str) {
    let found = general_names(cert_der).contains(&format!("dns:{expected}"));
    assert!(found, "expected SAN DNSName {expected}");
}

fn assert_ip(cert_der: &CertificateDer<'static>, expected: &[u8]) {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let san = cert
        .subject_alternative_name()
        .expect("san extension parse")
        .expect("san extension present");
    let found = san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::IPAddress(value) if *value == expected));
    assert!(found, "expected SAN IPAddress {expected:?}");
}

fn general_names(cert_der: &CertificateDer<'static>) -> Vec<String> {
    let (_, cert) = parse_x509_certificate(cert_der.as_ref()).expect("parse x509");
    let san = cert
        .subject_alternative_name()
        .expect("san extension parse")
        .expect("san extension present");
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(value) => Some(format!("dns:{value}")),
            GeneralName::IPAddress(value) if value.len() == 4 => Some(format!(
                "ip:{}.{}.{}.{}",
                value[0], value[1], value[2], value[3]
            )),
            _ => None,
        })
        .collect()
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
