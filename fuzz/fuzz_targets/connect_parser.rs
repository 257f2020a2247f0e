#![no_main]

use libfuzzer_sys::fuzz_target;
use mock_core::{parse_connect_head, ConnectParseMode, ConnectTarget};

fn check_dialable(target: &ConnectTarget) {
    assert!(!target.host.is_empty());
    assert_ne!(target.port, 0);
    let reparsed: ConnectTarget = target.authority().parse().expect("authority reparses");
    assert_eq!(&reparsed, target);
}

fuzz_target!(|data: &[u8]| {
    let strict = parse_connect_head(data, ConnectParseMode::Strict);
    let lenient = parse_connect_head(data, ConnectParseMode::Lenient);

    for (target, consumed) in [&strict, &lenient].into_iter().flatten() {
        assert!(*consumed <= data.len());
        assert_eq!(&data[*consumed - 4..*consumed], b"\r\n\r\n");
        check_dialable(target);
    }

    // Anything a strict client may send must tunnel to the same place under lenient parsing.
    if let Ok(accepted) = &strict {
        assert_eq!(lenient.as_ref(), Ok(accepted));
    }

    if let Ok(text) = std::str::from_utf8(data) {
        for mode in [ConnectParseMode::Strict, ConnectParseMode::Lenient] {
            if let Ok(target) = ConnectTarget::parse_authority(text, mode) {
                check_dialable(&target);
            }
        }
    }
});
