use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Log level override read from the environment, below the CLI flag and
/// above the config file.
pub const LOG_ENV: &str = "SQLREPLAY_LOG";

pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let env_level = std::env::var(LOG_ENV).ok();
    let log_level = resolve_log_level(config, cli_level_override, env_level.as_deref())?;

    match resolve_log_format(config) {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(true)
            .with_writer(std::io::stderr)
            .pretty()
            .try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))?;

    Ok(())
}

/// Routes log output through the test harness so it only shows for failing
/// tests. Safe to call from every test; only the first call installs.
pub fn init_for_tests() {
    let level = std::env::var(LOG_ENV)
        .ok()
        .and_then(|raw| parse_level(&raw).ok())
        .unwrap_or(LevelFilter::WARN);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_test_writer()
        .try_init();
}

fn resolve_log_level(
    config: &Config,
    cli_level_override: Option<&str>,
    env_level: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let raw_level = cli_level_override
        .or(env_level.filter(|level| !level.trim().is_empty()))
        .or_else(|| {
            config
                .logging
                .as_ref()
                .and_then(|logging| logging.level.as_deref())
        })
        .unwrap_or(DEFAULT_LOG_LEVEL);
    parse_level(raw_level)
}

fn parse_level(raw_level: &str) -> anyhow::Result<LevelFilter> {
    let normalized = raw_level.trim().to_ascii_lowercase();

    normalized.parse::<LevelFilter>().map_err(|_| {
        anyhow!(
            "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
        )
    })
}

fn resolve_log_format(config: &Config) -> LogFormat {
    config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json)
}
