use clap::Parser;
use lib_tractstack::{ClientConfig, ConfigError};
use std::path::PathBuf;

const DEFAULT_CONFIG_FILE: &str = "visit_probe.conf";

#[derive(Parser, Debug, Clone, Default)]
#[clap(about = "Headless TractStack visitor: session, realtime channel and engagement flush", version)]
pub struct ProbeArgs {
    #[clap(long, env = "TRACTSTACK_CONFIG_PATH", help = "Path to the JSON client configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "TRACTSTACK_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "TRACTSTACK_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "TRACTSTACK_BACKEND_URL", help = "Absolute backend base URL.")]
    pub backend_url: Option<String>,

    #[clap(long, env = "TRACTSTACK_TENANT_ID", help = "Tenant id sent with every request.")]
    pub tenant_id: Option<String>,

    #[clap(long, env = "TRACTSTACK_STORYFRAGMENT_ID", help = "Storyfragment the probe visits.")]
    pub storyfragment_id: Option<String>,

    #[clap(long, env = "TRACTSTACK_STORE_PATH", help = "File holding the persisted session and ENTERED flag.")]
    pub store_path: Option<PathBuf>,

    #[clap(long, env = "TRACTSTACK_REQUEST_TIMEOUT_MS", help = "Per-request timeout in milliseconds.")]
    pub request_timeout_ms: Option<u64>,

    #[clap(long, env = "TRACTSTACK_MAX_RETRIES", help = "Retries for transient request failures.")]
    pub max_retries: Option<u32>,

    #[clap(long, value_delimiter = ',', help = "Comma separated pane ids treated as visible for the whole visit.")]
    pub regions: Vec<String>,
}

impl ProbeArgs {
    /// The client settings given on the command line (or their env vars).
    pub fn client_overrides(&self) -> ClientConfig {
        ClientConfig {
            backend_url: self.backend_url.clone(),
            tenant_id: self.tenant_id.clone(),
            storyfragment_id: self.storyfragment_id.clone(),
            request_timeout_ms: self.request_timeout_ms,
            max_retries: self.max_retries,
            store_path: self.store_path.clone(),
            ..Default::default()
        }
    }
}

/// Fully resolved probe settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub client: ClientConfig,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub store_path: PathBuf,
    pub regions: Vec<String>,
}

pub fn load_config() -> Result<ProbeConfig, ConfigError> {
    resolve(ProbeArgs::parse())
}

/// Defaults, then the config file, then environment and CLI.
pub fn resolve(args: ProbeArgs) -> Result<ProbeConfig, ConfigError> {
    let config_file_path = args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    // `load` covers defaults, file and TRACTSTACK_* variables; clap values win.
    let client = ClientConfig::load(Some(&config_file_path))?.merge(args.client_overrides());
    client.validate()?;

    let store_path = client.store_path.clone().unwrap_or_else(default_store_path);

    Ok(ProbeConfig {
        client,
        log_dir: args.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
        log_level: args.log_level.unwrap_or_else(|| "info".to_string()),
        store_path,
        regions: args.regions,
    })
}

fn default_store_path() -> PathBuf {
    match dirs::data_local_dir() {
        Some(dir) => dir.join("tractstack").join("visitor.json"),
        None => {
            log::warn!("Could not determine local data directory; storing visitor state in the working directory.");
            PathBuf::from("tractstack_visitor.json")
        }
    }
}
