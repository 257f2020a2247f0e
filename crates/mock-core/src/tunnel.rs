use thiserror::Error;

use crate::ConnectTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    AwaitingConnect,
    ConnectingUpstream,
    Relaying,
    Closed,
}

/// What the client connection is currently wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Http,
    RawRelay,
    TlsHandshake,
    TlsRelay,
}

impl PipelineMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::RawRelay => "raw_relay",
            Self::TlsHandshake => "tls_handshake",
            Self::TlsRelay => "tls_relay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEvent {
    ConnectReceived,
    UpstreamConnected { intercept: bool },
    UpstreamFailed,
    HandshakeCompleted,
    HandshakeFailed,
    PeerClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal tunnel transition: state={state:?} mode={mode:?} event={event:?}")]
pub struct TunnelTransitionError {
    pub state: TunnelState,
    pub mode: PipelineMode,
    pub event: TunnelEvent,
}

pub fn next_tunnel_step(
    state: TunnelState,
    mode: PipelineMode,
    event: TunnelEvent,
) -> Option<(TunnelState, PipelineMode)> {
    use PipelineMode as M;
    use TunnelState as S;

    match (state, mode, event) {
        (S::AwaitingConnect, M::Http, TunnelEvent::ConnectReceived) => {
            Some((S::ConnectingUpstream, M::Http))
        }
        (S::ConnectingUpstream, M::Http, TunnelEvent::UpstreamConnected { intercept: false }) => {
            Some((S::Relaying, M::RawRelay))
        }
        (S::ConnectingUpstream, M::Http, TunnelEvent::UpstreamConnected { intercept: true }) => {
            Some((S::Relaying, M::TlsHandshake))
        }
        (S::ConnectingUpstream, M::Http, TunnelEvent::UpstreamFailed) => Some((S::Closed, M::Http)),
        (S::Relaying, M::TlsHandshake, TunnelEvent::HandshakeCompleted) => {
            Some((S::Relaying, M::TlsRelay))
        }
        (S::Relaying, M::TlsHandshake, TunnelEvent::HandshakeFailed) => {
            Some((S::Closed, M::TlsHandshake))
        }
        (S::Closed, _, _) => None,
        (_, mode, TunnelEvent::PeerClosed) => Some((S::Closed, mode)),
        _ => None,
    }
}

/// Per-connection tunnel bookkeeping driven through [`next_tunnel_step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSession {
    target: Option<ConnectTarget>,
    state: TunnelState,
    mode: PipelineMode,
}

impl Default for TunnelSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelSession {
    pub fn new() -> Self {
        Self {
            target: None,
            state: TunnelState::AwaitingConnect,
            mode: PipelineMode::Http,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    pub fn target(&self) -> Option<&ConnectTarget> {
        self.target.as_ref()
    }

    pub fn connect_received(
        &mut self,
        target: ConnectTarget,
    ) -> Result<TunnelState, TunnelTransitionError> {
        let state = self.apply(TunnelEvent::ConnectReceived)?;
        self.target = Some(target);
        Ok(state)
    }

    pub fn apply(&mut self, event: TunnelEvent) -> Result<TunnelState, TunnelTransitionError> {
        let Some((state, mode)) = next_tunnel_step(self.state, self.mode, event) else {
            return Err(TunnelTransitionError {
                state: self.state,
                mode: self.mode,
                event,
            });
        };
        tracing::trace!(
            from = ?self.state,
            to = ?state,
            mode = mode.as_str(),
            ?event,
            "tunnel transition"
        );
        self.state = state;
        self.mode = mode;
        Ok(state)
    }

    /// Client bytes may only be forwarded once a relay pipeline is installed.
    pub fn forwards_client_bytes(&self) -> bool {
        self.state == TunnelState::Relaying
            && matches!(self.mode, PipelineMode::RawRelay | PipelineMode::TlsRelay)
    }

    pub fn is_closed(&self) -> bool {
        self.state == TunnelState::Closed
    }
}
