use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tubepipe.toml";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_TOOL: &str = "yt-dlp";
pub const DEFAULT_PUBLIC_DIR: &str = "public";
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_STDERR_LIMIT: usize = 64 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_PROBE_OUTPUT_LIMIT: usize = 32 * 1024 * 1024;
pub const DEFAULT_KILL_GRACE_MS: u64 = 2_000;
pub const DEFAULT_RATE_LIMIT_MAX: u32 = 100;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 15 * 60;

/// Raw contents of the optional TOML config file. Every key may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub public_dir: Option<PathBuf>,
    pub tool: ToolFileConfig,
    pub rate_limit: RateLimitFileConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolFileConfig {
    pub program: Option<PathBuf>,
    pub probe_timeout_secs: Option<u64>,
    pub stderr_limit: Option<usize>,
    pub chunk_size: Option<usize>,
    pub probe_output_limit: Option<usize>,
    pub kill_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitFileConfig {
    pub enabled: Option<bool>,
    pub max_requests: Option<u32>,
    pub window_secs: Option<u64>,
}

/// Everything needed to launch and supervise the extraction tool.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub program: PathBuf,
    pub probe_timeout: Duration,
    /// Bytes of stderr retained per process; the rest is read and discarded.
    pub stderr_limit: usize,
    /// Largest chunk pulled from the tool's stdout in one read.
    pub chunk_size: usize,
    pub probe_output_limit: usize,
    /// Time a process gets between SIGTERM and a hard kill.
    pub kill_grace: Duration,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_TOOL),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            stderr_limit: DEFAULT_STDERR_LIMIT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            probe_output_limit: DEFAULT_PROBE_OUTPUT_LIMIT,
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: DEFAULT_RATE_LIMIT_MAX,
            window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub host: String,
    pub port: u16,
    pub public_dir: PathBuf,
    pub tool: ToolSettings,
    pub rate_limit: RateLimitSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            public_dir: PathBuf::from(DEFAULT_PUBLIC_DIR),
            tool: ToolSettings::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

pub fn read_file_config(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let cfg = toml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))?;
    Ok(Some(cfg))
}

/// Loads `path` on top of the defaults. A missing file yields the defaults.
pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let cfg = read_file_config(path)?.unwrap_or_default();
    let config = apply_file_config(RuntimeConfig::default(), cfg);
    validate(&config).with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn apply_file_config(mut config: RuntimeConfig, cfg: FileConfig) -> RuntimeConfig {
    if let Some(host) = cfg.host.filter(|value| !value.is_empty()) {
        config.host = host;
    }
    if let Some(port) = cfg.port {
        config.port = port;
    }
    if let Some(dir) = cfg.public_dir {
        config.public_dir = dir;
    }

    let tool = cfg.tool;
    if let Some(program) = tool.program {
        config.tool.program = program;
    }
    if let Some(secs) = tool.probe_timeout_secs {
        config.tool.probe_timeout = Duration::from_secs(secs);
    }
    if let Some(limit) = tool.stderr_limit {
        config.tool.stderr_limit = limit;
    }
    if let Some(size) = tool.chunk_size {
        config.tool.chunk_size = size;
    }
    if let Some(limit) = tool.probe_output_limit {
        config.tool.probe_output_limit = limit;
    }
    if let Some(ms) = tool.kill_grace_ms {
        config.tool.kill_grace = Duration::from_millis(ms);
    }

    let limits = cfg.rate_limit;
    if let Some(enabled) = limits.enabled {
        config.rate_limit.enabled = enabled;
    }
    if let Some(max) = limits.max_requests {
        config.rate_limit.max_requests = max;
    }
    if let Some(secs) = limits.window_secs {
        config.rate_limit.window = Duration::from_secs(secs);
    }
    config
}

pub fn validate(config: &RuntimeConfig) -> Result<()> {
    if config.tool.program.as_os_str().is_empty() {
        bail!("tool.program must not be empty");
    }
    if config.tool.probe_timeout.is_zero() {
        bail!("tool.probe_timeout_secs must be greater than zero");
    }
    if config.tool.chunk_size == 0 {
        bail!("tool.chunk_size must be greater than zero");
    }
    if config.tool.probe_output_limit == 0 {
        bail!("tool.probe_output_limit must be greater than zero");
    }
    if config.rate_limit.enabled
        && (config.rate_limit.max_requests == 0 || config.rate_limit.window.is_zero())
    {
        bail!("rate_limit.max_requests and rate_limit.window_secs must be greater than zero");
    }
    Ok(())
}
