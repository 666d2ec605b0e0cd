use anyhow::{bail, Context, Result};
use config::Config;
use core::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use flapwatch_lib::config::DetectorConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api: APIConfig,
    pub bmp: BMPConfig,
    pub detector: DetectorConfig,
    pub notify: NotifyConfig,
}

fn load_config(config_path: &str) -> Result<Config> {
    Config::builder()
        .add_source(config::File::with_name(config_path))
        .add_source(
            config::Environment::with_prefix("FLAPWATCH")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("failed to load configuration from {}", config_path))
}

pub fn app_config(config_path: &str) -> Result<AppConfig> {
    let config = load_config(config_path)?;
    from_config(&config)
}

pub fn from_config(config: &Config) -> Result<AppConfig> {
    Ok(AppConfig {
        api: get_api_config(config)?,
        bmp: get_bmp_config(config)?,
        detector: get_detector_config(config)?,
        notify: get_notify_config(config)?,
    })
}

/// Integer setting converted to its target type, `default` when unset.
fn get_number<T>(config: &Config, key: &str, default: T) -> Result<T>
where
    T: TryFrom<i64>,
    T::Error: std::error::Error + Send + Sync + 'static,
{
    match config.get_int(key) {
        Ok(value) => T::try_from(value).with_context(|| format!("invalid {}: {}", key, value)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Clone)]
pub struct APIConfig {
    pub host: String,
}

pub fn get_api_config(config: &Config) -> Result<APIConfig> {
    let api_addr = config
        .get_string("api.address")
        .unwrap_or("localhost".to_string());
    let api_port = get_number(config, "api.port", 8699)?;

    Ok(APIConfig {
        host: host(api_addr, api_port, true)?,
    })
}

#[derive(Debug, Clone)]
pub struct BMPConfig {
    pub host: String,

    /// Updates buffered per monitored peer view
    /// Default: 11000
    pub queue_capacity: usize,

    /// Backlog above which buffered updates are dropped
    /// Default: 10700
    pub queue_high_water: usize,

    /// Updates dropped at once while shedding
    /// Default: 50
    pub shed_burst: usize,

    /// Paths a peer view may import before its table is dropped
    /// Default: 10000000
    pub import_limit: usize,
}

pub fn get_bmp_config(config: &Config) -> Result<BMPConfig> {
    let bmp_addr = config
        .get_string("bmp.address")
        .unwrap_or("localhost".to_string());
    let bmp_port = get_number(config, "bmp.port", 4000)?;

    let queue_capacity: usize = get_number(config, "bmp.queue_capacity", 11000)?;
    let queue_high_water: usize = get_number(config, "bmp.queue_high_water", 10700)?;
    if queue_high_water >= queue_capacity {
        bail!(
            "bmp.queue_high_water ({}) must be lower than bmp.queue_capacity ({})",
            queue_high_water,
            queue_capacity
        );
    }

    Ok(BMPConfig {
        host: host(bmp_addr, bmp_port, true)?,
        queue_capacity,
        queue_high_water,
        shed_burst: get_number(config, "bmp.shed_burst", 50)?,
        import_limit: get_number(config, "bmp.import_limit", 10_000_000)?,
    })
}

pub fn get_detector_config(config: &Config) -> Result<DetectorConfig> {
    let default = DetectorConfig::default();
    let interval_secs = get_number(config, "detector.interval", default.interval.as_secs())?;

    Ok(DetectorConfig {
        route_change_counter: get_number(
            config,
            "detector.route_change_counter",
            default.route_change_counter,
        )?,
        expiry_route_change_counter: get_number(
            config,
            "detector.expiry_route_change_counter",
            default.expiry_route_change_counter,
        )?,
        over_threshold_target: get_number(
            config,
            "detector.over_threshold_target",
            default.over_threshold_target,
        )?,
        under_threshold_target: get_number(
            config,
            "detector.under_threshold_target",
            default.under_threshold_target,
        )?,
        max_path_history: get_number(
            config,
            "detector.max_path_history",
            default.max_path_history,
        )?,
        max_user_defined: get_number(
            config,
            "detector.max_user_defined",
            default.max_user_defined,
        )?,
        keep_path_info: config
            .get_bool("detector.keep_path_info")
            .unwrap_or(default.keep_path_info),
        interval: Duration::from_secs(interval_secs),
    })
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Log every flap start and end
    /// Default: true
    pub log: bool,

    pub webhook_start: Vec<String>,
    pub webhook_end: Vec<String>,

    /// Default: 10 seconds
    pub webhook_timeout: Duration,

    /// Sent as `X-Instance-Name` when set
    pub webhook_instance_name: Option<String>,

    pub script_start: Option<PathBuf>,
    pub script_end: Option<PathBuf>,

    /// Keep a JSON file per ended flap
    /// Default: false
    pub history_enable: bool,

    /// Default: ./flap_history
    pub history_dir: PathBuf,

    /// Default: 50
    pub history_max_count: usize,

    /// Default: 86400 seconds
    pub history_retention: Duration,
}

pub fn get_notify_config(config: &Config) -> Result<NotifyConfig> {
    let webhook_timeout: u64 = get_number(config, "notify.webhook_timeout", 10)?;
    let history_retention: u64 = get_number(config, "notify.history_retention", 86400)?;

    Ok(NotifyConfig {
        log: config.get_bool("notify.log").unwrap_or(true),
        webhook_start: config
            .get::<Vec<String>>("notify.webhook_start")
            .unwrap_or_default(),
        webhook_end: config
            .get::<Vec<String>>("notify.webhook_end")
            .unwrap_or_default(),
        webhook_timeout: Duration::from_secs(webhook_timeout.max(1)),
        webhook_instance_name: config
            .get_string("notify.webhook_instance_name")
            .ok()
            .filter(|name| !name.is_empty()),
        script_start: config
            .get_string("notify.script_start")
            .ok()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from),
        script_end: config
            .get_string("notify.script_end")
            .ok()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from),
        history_enable: config.get_bool("notify.history_enable").unwrap_or(false),
        history_dir: PathBuf::from(
            config
                .get_string("notify.history_dir")
                .unwrap_or("./flap_history".to_string()),
        ),
        history_max_count: get_number(config, "notify.history_max_count", 50)?,
        history_retention: Duration::from_secs(history_retention),
    })
}

pub fn host(address: String, port: u16, accept_fqdn: bool) -> Result<String> {
    let host = match address.parse::<IpAddr>() {
        Ok(ip) => {
            if ip.is_ipv4() {
                address
            } else {
                format!("[{}]", ip)
            }
        }
        Err(_) => {
            if accept_fqdn {
                address
            } else {
                bail!("FQDN not supported: {}", address)
            }
        }
    };
    Ok(format!("{}:{}", host, port))
}
