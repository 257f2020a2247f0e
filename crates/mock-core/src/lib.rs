mod algorithm;
mod config;
mod connect;
mod lifecycle;
mod policy;
mod processor;
mod response_writer;
mod scheduler;
mod tunnel;
mod types;

pub use algorithm::{KeyAlgorithm, KeyFamily};
pub use config::{ConfigError, ConnectParseMode, MockServerConfig};
pub use connect::{
    is_connect_method, parse_connect_head, parse_connect_line, ConnectParseError, ConnectTarget,
};
pub use lifecycle::{decide_close, CloseAction};
pub use policy::{HostListPolicy, TunnelAction, TunnelPolicy};
pub use processor::{NotFoundProcessor, RequestProcessor};
pub use response_writer::{close_channel, ResponseWriter, SocketChannel};
pub use scheduler::{ScheduledAction, Scheduler, TokioScheduler};
pub use tunnel::{
    next_tunnel_step, PipelineMode, TunnelEvent, TunnelSession, TunnelState, TunnelTransitionError,
};
pub use types::{ConnectionOptions, HttpVersion, MockRequest, MockResponse};

#[cfg(test)]
mod tests {
    include!("tests_config_schema.rs");
    include!("tests_connect_parser.rs");
}
