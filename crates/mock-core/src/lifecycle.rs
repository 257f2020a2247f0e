use std::time::Duration;

use crate::ConnectionOptions;

/// What happens to the client socket once a response has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    KeepOpen,
    CloseNow,
    CloseAfter(Duration),
}

impl CloseAction {
    pub fn closes(self) -> bool {
        !matches!(self, Self::KeepOpen)
    }
}

/// Resolves the close decision for one response.
///
/// An explicit `close_socket` value always wins. Without one, `always_close` forces a close
/// and otherwise the request's keep-alive negotiation decides. A zero delay closes at once.
pub fn decide_close(
    keep_alive: bool,
    options: Option<&ConnectionOptions>,
    always_close: bool,
) -> CloseAction {
    let explicit = options.and_then(|options| options.close_socket);
    let close = match explicit {
        Some(close) => close,
        None => always_close || !keep_alive,
    };
    if !close {
        return CloseAction::KeepOpen;
    }
    match options.and_then(|options| options.close_socket_delay) {
        Some(delay) if !delay.is_zero() => CloseAction::CloseAfter(delay),
        _ => CloseAction::CloseNow,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{decide_close, CloseAction};
    use crate::ConnectionOptions;

    #[test]
    fn keep_alive_negotiation_decides_without_options() {
        assert_eq!(decide_close(true, None, false), CloseAction::KeepOpen);
        assert_eq!(decide_close(false, None, false), CloseAction::CloseNow);
    }

    #[test]
    fn always_close_applies_only_without_explicit_value() {
        assert_eq!(decide_close(true, None, true), CloseAction::CloseNow);
        let delay_only = ConnectionOptions::default().close_socket_delay(Duration::from_millis(50));
        assert_eq!(
            decide_close(true, Some(&delay_only), true),
            CloseAction::CloseAfter(Duration::from_millis(50))
        );
    }

    #[test]
    fn explicit_keep_open_wins_over_always_close_and_connection_close() {
        let keep_open = ConnectionOptions::default().close_socket(false);
        assert_eq!(decide_close(true, Some(&keep_open), true), CloseAction::KeepOpen);
        assert_eq!(decide_close(false, Some(&keep_open), true), CloseAction::KeepOpen);
    }

    #[test]
    fn explicit_close_wins_over_keep_alive() {
        let close = ConnectionOptions::default().close_socket(true);
        assert_eq!(decide_close(true, Some(&close), false), CloseAction::CloseNow);

        let delayed = close.close_socket_delay(Duration::from_millis(200));
        assert_eq!(
            decide_close(true, Some(&delayed), false),
            CloseAction::CloseAfter(Duration::from_millis(200))
        );
    }

    #[test]
    fn delay_is_ignored_when_socket_stays_open() {
        let options = ConnectionOptions::default().close_socket_delay(Duration::from_secs(1));
        assert_eq!(decide_close(true, Some(&options), false), CloseAction::KeepOpen);
    }

    #[test]
    fn zero_delay_closes_immediately() {
        let options = ConnectionOptions::default()
            .close_socket(true)
            .close_socket_delay(Duration::ZERO);
        assert_eq!(decide_close(true, Some(&options), false), CloseAction::CloseNow);
    }
}
