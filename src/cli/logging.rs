//! Log subscriber setup from the `[logging]` config section.
//!
//! `RUST_LOG` takes precedence over the configured level. Logs go to stderr
//! unless a file is configured; stdout is reserved for command output.

use std::fs::OpenOptions;
use std::sync::Mutex;
use subgate::config::LoggingConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub fn filter(logging: &LoggingConfig) -> Result<EnvFilter, Box<dyn std::error::Error>> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(&logging.level)?),
    }
}

pub fn init(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = tracing_subscriber::registry().with(filter(logging)?);

    match &logging.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .try_init()?;
        }
        None => {
            registry
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let logging = LoggingConfig {
            level: "subgate=loudest".to_string(),
            file: None,
        };
        assert!(filter(&logging).is_err());
    }

    #[test]
    fn test_configured_level_accepted() {
        let logging = LoggingConfig {
            level: "debug,subgate=trace".to_string(),
            file: None,
        };
        assert!(filter(&logging).is_ok());
    }
}
