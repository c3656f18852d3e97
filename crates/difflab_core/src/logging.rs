//! Process-wide logger installation.
//!
//! Engines only ever talk to the `log` facade; this module wires the facade
//! to a console and/or file sink once, at the level from [`LogSettings`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `off`, `error`, `warn`, `info`, `debug` or `trace`.
    pub level: String,
    /// Append-mode log file; `None` disables file logging.
    pub file: Option<PathBuf>,
    /// Mirror records to stderr.
    pub console: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some(PathBuf::from("difflab.log")),
            console: false,
        }
    }
}

impl LogSettings {
    pub fn level_filter(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(self.level.trim())
            .ok()
            .with_context(|| format!("unknown log level '{}'", self.level))
    }
}

/// Installs the global logger.
///
/// Returns `Ok(true)` when a logger was installed and `Ok(false)` when no sink
/// is enabled or another logger already owns the facade.
pub fn init_logging(settings: &LogSettings) -> Result<bool> {
    let level = settings.level_filter()?;
    let config = ConfigBuilder::new()
        .set_target_level(LevelFilter::Error)
        .set_thread_level(LevelFilter::Off)
        .build();

    let mut sinks: Vec<Box<dyn SharedLogger>> = Vec::new();
    if settings.console {
        sinks.push(TermLogger::new(
            level,
            config.clone(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ));
    }
    if let Some(path) = &settings.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        sinks.push(WriteLogger::new(level, config, file));
    }
    if sinks.is_empty() {
        return Ok(false);
    }

    match CombinedLogger::init(sinks) {
        Ok(()) => {
            log::info!("Logging initialised at level {level}");
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_are_case_insensitive() {
        let settings = LogSettings {
            level: "DEBUG".to_string(),
            ..LogSettings::default()
        };
        assert_eq!(settings.level_filter().expect("valid"), LevelFilter::Debug);
    }

    #[test]
    fn unknown_level_is_an_error() {
        let settings = LogSettings {
            level: "loud".to_string(),
            ..LogSettings::default()
        };
        let err = init_logging(&settings).expect_err("rejected");
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn no_sinks_installs_nothing() {
        let settings = LogSettings {
            file: None,
            console: false,
            ..LogSettings::default()
        };
        assert!(!init_logging(&settings).expect("nothing to do"));
    }

    #[test]
    fn second_installation_is_ignored() {
        let path = std::env::temp_dir().join(format!("difflab-log-{}.log", std::process::id()));
        let settings = LogSettings {
            level: "warn".to_string(),
            file: Some(path.clone()),
            console: false,
        };
        init_logging(&settings).expect("first call");
        assert!(!init_logging(&settings).expect("second call"));
        let _ = std::fs::remove_file(path);
    }
}
