use std::net::IpAddr;

use super::{
    is_connect_method, parse_connect_head, parse_connect_line, ConnectParseError,
    ConnectParseMode, ConnectTarget,
};

const STRICT: ConnectParseMode = ConnectParseMode::Strict;
const LENIENT: ConnectParseMode = ConnectParseMode::Lenient;

#[test]
fn target_authority_parses_back_to_the_same_target() {
    let targets = [
        ConnectTarget::new("example.com", 443),
        ConnectTarget::new("10.0.0.7", 8080),
        ConnectTarget::new("2001:db8::1", 8443),
    ];
    for target in targets {
        let authority = target.authority();
        assert_eq!(target.to_string(), authority);
        let reparsed: ConnectTarget = authority.parse().expect("authority must reparse");
        assert_eq!(reparsed, target, "{authority}");
    }
    assert_eq!(
        ConnectTarget::new("2001:db8::1", 8443).authority(),
        "[2001:db8::1]:8443"
    );
}

#[test]
fn targets_are_canonical_so_leaf_lookups_agree() {
    let v6 = parse_connect_line("CONNECT [2001:DB8:0:0::1]:443 HTTP/1.1", STRICT).expect("v6");
    assert_eq!(v6.host, "2001:db8::1");
    assert!(matches!(v6.ip(), Some(IpAddr::V6(_))));

    let dns = parse_connect_line("CONNECT API.Example.COM:443 HTTP/1.1", STRICT).expect("dns");
    assert_eq!(dns, ConnectTarget::new("api.example.com", 443));
    assert_eq!(dns.ip(), None);
}

#[test]
fn port_zero_is_never_a_target() {
    for mode in [STRICT, LENIENT] {
        for authority in ["example.com:0", "[::1]:0", "127.0.0.1:00"] {
            assert_eq!(
                ConnectTarget::parse_authority(authority, mode),
                Err(ConnectParseError::InvalidPort),
                "{authority} in {mode:?}"
            );
        }
        assert_eq!(
            ConnectTarget::parse_authority("example.com:65536", mode),
            Err(ConnectParseError::InvalidPort)
        );
    }
}

#[test]
fn missing_port_defaults_only_in_lenient_mode() {
    assert_eq!(
        ConnectTarget::parse_authority("example.com", STRICT),
        Err(ConnectParseError::MissingPort)
    );
    assert_eq!(
        ConnectTarget::parse_authority("[::1]:", STRICT),
        Err(ConnectParseError::MissingPort)
    );
    assert_eq!(
        ConnectTarget::parse_authority("example.com:", LENIENT),
        Ok(ConnectTarget::new("example.com", 443))
    );
    assert_eq!(
        ConnectTarget::parse_authority("[::1]", LENIENT),
        Ok(ConnectTarget::new("::1", 443))
    );
}

#[test]
fn unbracketed_ipv6_is_ambiguous_unless_lenient() {
    assert_eq!(
        ConnectTarget::parse_authority("2001:db8::1:443", STRICT),
        Err(ConnectParseError::InvalidAuthority)
    );
    let lenient = ConnectTarget::parse_authority("2001:db8::1:443", LENIENT).expect("lenient");
    assert_eq!(lenient, ConnectTarget::new("2001:db8::1:443", 443));
    assert_eq!(lenient.authority(), "[2001:db8::1:443]:443");
}

#[test]
fn malformed_authorities_are_rejected() {
    for authority in [
        "[example.com]:443",
        "[::1",
        ":443",
        "a:b:443",
        "[]:443",
        "a/b:443",
        "user@example.com:443",
        "example.com#x",
    ] {
        assert_eq!(
            ConnectTarget::parse_authority(authority, STRICT),
            Err(ConnectParseError::InvalidAuthority),
            "{authority}"
        );
    }
    assert_eq!(
        ConnectTarget::parse_authority("[::1]443", STRICT),
        Err(ConnectParseError::MissingPort)
    );
}

#[test]
fn request_line_errors_keep_stable_codes() {
    let cases = [
        ("", ConnectParseError::EmptyRequestLine, "empty_request_line"),
        (
            "CONNECT example.com:443",
            ConnectParseError::InvalidRequestLine,
            "invalid_request_line",
        ),
        (
            "CONNECT example.com:443 HTTP/1.1 extra",
            ConnectParseError::InvalidRequestLine,
            "invalid_request_line",
        ),
        (
            "POST example.com:443 HTTP/1.1",
            ConnectParseError::MethodNotConnect,
            "method_not_connect",
        ),
        (
            "CONNECT example.com:443 HTTP/2",
            ConnectParseError::InvalidHttpVersion,
            "invalid_http_version",
        ),
        (
            "CONNECT example.com HTTP/1.1",
            ConnectParseError::MissingPort,
            "missing_port",
        ),
    ];
    for (line, error, code) in cases {
        assert_eq!(parse_connect_line(line, STRICT), Err(error), "{line:?}");
        assert_eq!(error.code(), code);
    }
}

#[test]
fn head_length_stops_at_the_blank_line() {
    let mut raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
    let head_len = raw.len();
    raw.extend_from_slice(&[0x16, 0x03, 0x01, 0xff, 0xfe]);

    let (target, consumed) = parse_connect_head(&raw, STRICT).expect("head");
    assert_eq!(target, ConnectTarget::new("example.com", 443));
    assert_eq!(consumed, head_len);
    assert_eq!(&raw[consumed..], &[0x16, 0x03, 0x01, 0xff, 0xfe]);
}

#[test]
fn unterminated_or_non_utf8_heads_are_rejected() {
    assert_eq!(
        parse_connect_head(b"CONNECT example.com:443 HTTP/1.1\r\n", STRICT),
        Err(ConnectParseError::IncompleteHeaders)
    );
    assert_eq!(
        parse_connect_head(b"CONNECT \xff.example:443 HTTP/1.1\r\n\r\n", STRICT),
        Err(ConnectParseError::InvalidUtf8)
    );
}

#[test]
fn lenient_mode_reduces_absolute_form_to_its_authority() {
    let target = parse_connect_line("connect https://Example.com:8443/path?q=1 HTTP/1.0", LENIENT)
        .expect("absolute form");
    assert_eq!(target, ConnectTarget::new("example.com", 8443));

    let (target, _) =
        parse_connect_head(b"CONNECT http://example.com HTTP/1.1\r\n\r\n", LENIENT).expect("head");
    assert_eq!(target, ConnectTarget::new("example.com", 443));

    assert_eq!(
        parse_connect_line("CONNECT https://example.com:443/ HTTP/1.1", STRICT),
        Err(ConnectParseError::InvalidAuthority)
    );
}

#[test]
fn connect_method_matching_follows_the_mode() {
    assert!(is_connect_method("CONNECT", STRICT));
    assert!(!is_connect_method("connect", STRICT));
    assert!(is_connect_method("Connect", LENIENT));
    assert!(!is_connect_method("CONNECTX", LENIENT));
}
