#[test]
fn default_config_is_valid() {
    let config = super::MockServerConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.certificate_backdate().as_secs(), 5 * 24 * 60 * 60);
    assert_eq!(config.certificate_validity().as_secs(), 365 * 24 * 60 * 60);
}

#[test]
fn serde_round_trip_preserves_tunnel_and_ca_fields() {
    let json = r#"
        {
          "listen_addr": "0.0.0.0",
          "listen_port": 18080,
          "connect_parse_mode": "lenient",
          "key_algorithm": "rsa3072_sha384",
          "ca_organization": "Acme Testing",
          "relay_hosts": ["pinned.example.com"],
          "leaf_subject_alternative_names": ["localhost", "127.0.0.1"],
          "always_close_socket_connections": true
        }
    "#;
    let parsed =
        serde_json::from_str::<super::MockServerConfig>(json).expect("deserialize config");
    assert_eq!(parsed.listen_addr, "0.0.0.0");
    assert_eq!(parsed.listen_port, 18_080);
    assert_eq!(parsed.connect_parse_mode, super::ConnectParseMode::Lenient);
    assert_eq!(parsed.key_algorithm, super::KeyAlgorithm::Rsa3072Sha384);
    assert_eq!(parsed.ca_organization, "Acme Testing");
    assert_eq!(parsed.relay_hosts, vec!["pinned.example.com".to_string()]);
    assert_eq!(parsed.leaf_subject_alternative_names.len(), 2);
    assert!(parsed.always_close_socket_connections);
    assert!(parsed.tls_interception_enabled);
    assert!(parsed.validate().is_ok());

    let encoded = serde_json::to_string(&parsed).expect("serialize config");
    let decoded =
        serde_json::from_str::<super::MockServerConfig>(&encoded).expect("deserialize again");
    assert_eq!(decoded, parsed);
}

#[test]
fn key_algorithm_accepts_legacy_p521_name() {
    let parsed = serde_json::from_str::<super::MockServerConfig>(
        r#"{ "key_algorithm": "ecp512_sha512" }"#,
    )
    .expect("alias must deserialize");
    assert_eq!(parsed.key_algorithm, super::KeyAlgorithm::Ec521Sha512);
}

#[test]
fn serde_rejects_unknown_fields() {
    let json = r#"{ "unknown_field": true }"#;
    let err = serde_json::from_str::<super::MockServerConfig>(json)
        .expect_err("unknown field must fail");
    let message = err.to_string();
    assert!(
        message.contains("unknown field"),
        "expected unknown field error, got: {message}"
    );
}

#[test]
fn validation_rejects_partial_ca_path_pair() {
    let config = super::MockServerConfig {
        ca_cert_pem_path: Some("/tmp/ca.crt".to_string()),
        ca_key_pem_path: None,
        ..super::MockServerConfig::default()
    };
    let err = config.validate().expect_err("partial CA pair should fail");
    assert_eq!(err, super::ConfigError::InvalidCaPathPair);
}

#[test]
fn validation_rejects_zero_budgets_and_bad_country() {
    let config = super::MockServerConfig {
        leaf_cert_cache_ttl_ms: 0,
        ..super::MockServerConfig::default()
    };
    assert_eq!(
        config.validate().expect_err("zero ttl"),
        super::ConfigError::ZeroValue("leaf_cert_cache_ttl_ms")
    );

    let config = super::MockServerConfig {
        ca_country: "GBR".to_string(),
        ..super::MockServerConfig::default()
    };
    assert_eq!(
        config.validate().expect_err("three letter country"),
        super::ConfigError::InvalidCaCountry("GBR".to_string())
    );
}

#[test]
fn tunnel_timeouts_default_and_reject_zero() {
    let config = super::MockServerConfig::default();
    assert_eq!(config.tls_handshake_timeout().as_millis(), 5_000);
    assert_eq!(config.tunnel_idle_timeout().as_millis(), 30_000);
    assert_eq!(config.tunnel_half_close_timeout().as_millis(), 2_000);

    let config = super::MockServerConfig {
        tunnel_half_close_timeout_ms: 0,
        ..super::MockServerConfig::default()
    };
    assert_eq!(
        config.validate().expect_err("zero half-close window"),
        super::ConfigError::ZeroValue("tunnel_half_close_timeout_ms")
    );
}

#[test]
fn validation_rejects_empty_relay_host() {
    let config = super::MockServerConfig {
        relay_hosts: vec!["  ".to_string()],
        ..super::MockServerConfig::default()
    };
    assert_eq!(
        config.validate().expect_err("blank host"),
        super::ConfigError::EmptyHostEntry {
            field: "relay_hosts"
        }
    );
}
