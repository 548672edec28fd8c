use clap::Parser;
use lib_telemetry::connections::mbap::MAX_READ_REGISTERS;
use lib_telemetry::core::OverflowPolicy;
use lib_telemetry::ingestors::{DeviceTarget, PollSettings, DEFAULT_SCALE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "server_modbus.conf";

const DEFAULT_DEVICE_HOST: &str = "192.168.0.1";
const DEFAULT_DEVICE_PORT: u16 = 502;
const DEFAULT_UNIT_ID: u8 = 255;
const DEFAULT_REGISTER_START: u16 = 0;
const DEFAULT_REGISTER_COUNT: u16 = 23;
const DEFAULT_POLL_PERIOD_MS: u64 = 51;
const DEFAULT_BIND_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 100;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 5000;
const DEFAULT_SUBSCRIBER_QUEUE: usize = 8;
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_LOG_RETENTION: usize = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {} not found", .0.display())]
    Missing(PathBuf),
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("register count {0} outside 1..={max}", max = MAX_READ_REGISTERS)]
    RegisterCount(u16),
    #[error("register block {start}+{count} runs past address 65535")]
    RegisterRange { start: u16, count: u16 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("scale factor {0} is not a finite number")]
    Scale(f64),
    #[error("reconnect max delay {max_ms}ms is below base delay {base_ms}ms")]
    Backoff { base_ms: u64, max_ms: u64 },
}

/// Raw options as given on the command line, in the environment or in the
/// JSON config file. Every field is optional so sources can be layered.
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[command(about = "Modbus register telemetry gateway", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[arg(long, env = "MODBUS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "MODBUS_DEVICE_HOST", help = "Modbus device host name or IP address.")]
    pub device_host: Option<String>,

    #[arg(long, env = "MODBUS_DEVICE_PORT", help = "Modbus device TCP port.")]
    pub device_port: Option<u16>,

    #[arg(long, env = "MODBUS_UNIT_ID", help = "Modbus unit identifier.")]
    pub unit_id: Option<u8>,

    #[arg(long, env = "MODBUS_REGISTER_START", help = "First input register to read.")]
    pub register_start: Option<u16>,

    #[arg(long, env = "MODBUS_REGISTER_COUNT", help = "Number of input registers per read (1-125).")]
    pub register_count: Option<u16>,

    #[arg(long, env = "MODBUS_POLL_PERIOD_MS", help = "Milliseconds between device reads.")]
    pub poll_period_ms: Option<u64>,

    #[arg(long, env = "MODBUS_SCALE", help = "Factor applied to every raw register value.")]
    pub scale: Option<f64>,

    #[arg(long, env = "MODBUS_BIND_ADDRESS", help = "Address to listen on for subscribers.")]
    pub bind_address: Option<IpAddr>,

    #[arg(long, env = "MODBUS_PORT", help = "Port to listen on for subscribers.")]
    pub port: Option<u16>,

    #[arg(long, env = "MODBUS_CONNECT_TIMEOUT_MS", help = "Timeout in milliseconds for a device connect.")]
    pub connect_timeout_ms: Option<u64>,

    #[arg(long, env = "MODBUS_READ_TIMEOUT_MS", help = "Timeout in milliseconds for one register read.")]
    pub read_timeout_ms: Option<u64>,

    #[arg(long, env = "MODBUS_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for device reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[arg(long, env = "MODBUS_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for device reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[arg(long, env = "MODBUS_SUBSCRIBER_QUEUE", help = "Frames buffered per subscriber before the overflow policy applies.")]
    pub subscriber_queue: Option<usize>,

    #[arg(long, env = "MODBUS_OVERFLOW_POLICY", help = "What to do with a slow subscriber (drop-newest, disconnect).")]
    pub overflow_policy: Option<OverflowPolicy>,

    #[arg(long, env = "MODBUS_PAUSE_WHEN_IDLE", help = "Skip device reads while nobody is subscribed (true/false).")]
    pub pause_when_idle: Option<bool>,

    #[arg(long, env = "MODBUS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "MODBUS_LOG_LEVEL", help = "Logging level or filter directive (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "MODBUS_LOG_JSON", help = "Write console logs as JSON (true/false).")]
    pub log_json: Option<bool>,

    #[arg(long, env = "MODBUS_LOG_RETENTION", help = "Number of log files to keep in the log directory.")]
    pub log_retention: Option<usize>,
}

/// Logging options after defaults are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub dir: PathBuf,
    pub level: String,
    pub json: bool,
    pub retention: usize,
}

/// Fully resolved and validated gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub poll: PollSettings,
    pub bind_addr: SocketAddr,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub subscriber_queue: usize,
    pub overflow_policy: OverflowPolicy,
    pub log: LogSettings,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            device_host: other.device_host.or(self.device_host),
            device_port: other.device_port.or(self.device_port),
            unit_id: other.unit_id.or(self.unit_id),
            register_start: other.register_start.or(self.register_start),
            register_count: other.register_count.or(self.register_count),
            poll_period_ms: other.poll_period_ms.or(self.poll_period_ms),
            scale: other.scale.or(self.scale),
            bind_address: other.bind_address.or(self.bind_address),
            port: other.port.or(self.port),
            connect_timeout_ms: other.connect_timeout_ms.or(self.connect_timeout_ms),
            read_timeout_ms: other.read_timeout_ms.or(self.read_timeout_ms),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            subscriber_queue: other.subscriber_queue.or(self.subscriber_queue),
            overflow_policy: other.overflow_policy.or(self.overflow_policy),
            pause_when_idle: other.pause_when_idle.or(self.pause_when_idle),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_json: other.log_json.or(self.log_json),
            log_retention: other.log_retention.or(self.log_retention),
        }
    }

    /// Applies defaults to unset options and validates the result.
    pub fn resolve(self) -> Result<GatewayConfig, ConfigError> {
        let register_start = self.register_start.unwrap_or(DEFAULT_REGISTER_START);
        let register_count = self.register_count.unwrap_or(DEFAULT_REGISTER_COUNT);
        if register_count == 0 || register_count > MAX_READ_REGISTERS {
            return Err(ConfigError::RegisterCount(register_count));
        }
        if u32::from(register_start) + u32::from(register_count) > u32::from(u16::MAX) + 1 {
            return Err(ConfigError::RegisterRange {
                start: register_start,
                count: register_count,
            });
        }

        let scale = self.scale.unwrap_or(DEFAULT_SCALE);
        if !scale.is_finite() {
            return Err(ConfigError::Scale(scale));
        }

        let period = non_zero_ms("poll period", self.poll_period_ms.unwrap_or(DEFAULT_POLL_PERIOD_MS))?;
        let connect_timeout =
            non_zero_ms("connect timeout", self.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))?;
        let read_timeout = non_zero_ms("read timeout", self.read_timeout_ms.unwrap_or(DEFAULT_READ_TIMEOUT_MS))?;

        let base_ms = self.reconnect_base_delay_ms.unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS);
        let max_ms = self.reconnect_max_delay_ms.unwrap_or(DEFAULT_RECONNECT_MAX_DELAY_MS);
        if max_ms < base_ms {
            return Err(ConfigError::Backoff { base_ms, max_ms });
        }

        let subscriber_queue = self.subscriber_queue.unwrap_or(DEFAULT_SUBSCRIBER_QUEUE);
        if subscriber_queue == 0 {
            return Err(ConfigError::Zero("subscriber queue depth"));
        }

        let poll = PollSettings {
            target: DeviceTarget {
                host: self.device_host.unwrap_or_else(|| DEFAULT_DEVICE_HOST.to_string()),
                port: self.device_port.unwrap_or(DEFAULT_DEVICE_PORT),
                unit_id: self.unit_id.unwrap_or(DEFAULT_UNIT_ID),
                register_start,
                register_count,
            },
            period,
            scale,
            reconnect_base: Duration::from_millis(base_ms),
            reconnect_max: Duration::from_millis(max_ms),
            pause_when_idle: self.pause_when_idle.unwrap_or(false),
        };

        Ok(GatewayConfig {
            poll,
            bind_addr: SocketAddr::new(
                self.bind_address.unwrap_or(DEFAULT_BIND_ADDRESS),
                self.port.unwrap_or(DEFAULT_PORT),
            ),
            connect_timeout,
            read_timeout,
            subscriber_queue,
            overflow_policy: self.overflow_policy.unwrap_or_default(),
            log: LogSettings {
                dir: self.log_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
                level: self.log_level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
                json: self.log_json.unwrap_or(false),
                retention: self.log_retention.unwrap_or(DEFAULT_LOG_RETENTION),
            },
        })
    }
}

fn non_zero_ms(what: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::Zero(what));
    }
    Ok(Duration::from_millis(ms))
}

// A missing default file is fine; a missing file the user asked for is not.
fn read_config_file(path: &Path, explicit: bool) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        if explicit {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        return Ok(None);
    }

    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = serde_json::from_str::<Config>(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(parsed))
}

/// Layers defaults, the config file and `cli` (which already carries
/// environment variables) in that order of precedence.
pub fn build_config(cli: Config) -> Result<GatewayConfig, ConfigError> {
    let explicit = cli.config_path.is_some();
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::default();
    if let Some(file_config) = read_config_file(&path, explicit)? {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli).resolve()
}

pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    build_config(Config::parse())
}
