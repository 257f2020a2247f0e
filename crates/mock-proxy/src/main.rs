use std::env;
use std::fs;

use mock_cache::CacheRegistry;
use mock_core::{HostListPolicy, MockServerConfig, NotFoundProcessor};
use mock_proxy::{DirectConnector, MockProxyServer};
use tracing_subscriber::EnvFilter;

const ENV_CONFIG_PATH: &str = "MOCK_PROXY_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitClass {
    Ok,
    ConfigInvalid,
    ServerInitFailed,
    RuntimeFailed,
}

impl ExitClass {
    fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::ConfigInvalid => 20,
            Self::ServerInitFailed => 22,
            Self::RuntimeFailed => 23,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::ConfigInvalid => "config_invalid",
            Self::ServerInitFailed => "server_init_failed",
            Self::RuntimeFailed => "runtime_failed",
        }
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (class, detail) = match run().await {
        Ok(()) => (ExitClass::Ok, "server exited cleanly".to_string()),
        Err((class, detail)) => (class, detail),
    };
    if class == ExitClass::Ok {
        tracing::info!(exit_class = class.label(), "{detail}");
    } else {
        tracing::error!(exit_class = class.label(), "{detail}");
    }
    std::process::exit(class.code());
}

async fn run() -> Result<(), (ExitClass, String)> {
    let config = load_config().map_err(|detail| (ExitClass::ConfigInvalid, detail))?;
    if let Err(error) = config.validate() {
        return Err((ExitClass::ConfigInvalid, error.to_string()));
    }

    let registry = CacheRegistry::new();
    let policy = HostListPolicy::from_config(&config);
    let connector = DirectConnector::from_config(&config);
    let server = MockProxyServer::new(config, &registry, NotFoundProcessor, policy, connector)
        .map_err(|error| (ExitClass::ServerInitFailed, error.to_string()))?;

    server
        .run()
        .await
        .map_err(|error| (ExitClass::RuntimeFailed, error.to_string()))
}

fn load_config() -> Result<MockServerConfig, String> {
    let path = env::var(ENV_CONFIG_PATH)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let Some(path) = path else {
        return Ok(MockServerConfig::default());
    };
    let raw = fs::read_to_string(&path)
        .map_err(|error| format!("failed to read {ENV_CONFIG_PATH} file {path}: {error}"))?;
    serde_json::from_str(&raw).map_err(|error| format!("failed to parse {path}: {error}"))
}
