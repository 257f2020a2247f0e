use crate::{ConnectTarget, MockServerConfig};

/// How an accepted CONNECT tunnel is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelAction {
    /// Terminate TLS with a minted leaf and process the decrypted requests.
    Intercept,
    /// Forward raw bytes to the CONNECT target.
    Relay,
}

pub trait TunnelPolicy: Send + Sync + 'static {
    fn decide(&self, target: &ConnectTarget) -> TunnelAction;
}

/// Intercepts every host when interception is enabled, except the configured relay hosts.
#[derive(Debug, Clone, Default)]
pub struct HostListPolicy {
    interception_enabled: bool,
    relay_hosts: Vec<String>,
}

impl HostListPolicy {
    pub fn new(interception_enabled: bool, relay_hosts: Vec<String>) -> Self {
        Self {
            interception_enabled,
            relay_hosts,
        }
    }

    pub fn from_config(config: &MockServerConfig) -> Self {
        Self::new(config.tls_interception_enabled, config.relay_hosts.clone())
    }
}

impl TunnelPolicy for HostListPolicy {
    fn decide(&self, target: &ConnectTarget) -> TunnelAction {
        if !self.interception_enabled {
            return TunnelAction::Relay;
        }
        if self
            .relay_hosts
            .iter()
            .any(|host| host.trim().eq_ignore_ascii_case(&target.host))
        {
            return TunnelAction::Relay;
        }
        TunnelAction::Intercept
    }
}
