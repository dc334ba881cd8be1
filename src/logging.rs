use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable naming the log file
pub const LOG_FILE_ENV: &str = "AGENT_BRIDGE_LOG_FILE";
/// When `true`, the process id is inserted into the log file name
pub const LOG_UNIQUE_ENV: &str = "AGENT_BRIDGE_LOG_UNIQUE";
/// When `true`, log lines are JSON objects
pub const LOG_JSON_ENV: &str = "AGENT_BRIDGE_LOG_JSON";

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "info", "warn", "error")
    pub level: String,
    /// Optional log file path. If None, logs only to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create LogConfig from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create LogConfig from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());
        let unique = lookup(LOG_UNIQUE_ENV).as_deref() == Some("true");

        let file_path = lookup(LOG_FILE_ENV).map(|path| {
            let path_buf = PathBuf::from(path);
            if unique {
                with_pid_suffix(path_buf, std::process::id())
            } else {
                path_buf
            }
        });

        let json_format = lookup(LOG_JSON_ENV).as_deref() == Some("true");

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// `bridge.log` becomes `bridge.<pid>.log`; `bridge` becomes `bridge.<pid>`
fn with_pid_suffix(mut path: PathBuf, pid: u32) -> PathBuf {
    if let Some(stem) = path.file_stem() {
        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        let unique = if extension.is_empty() {
            format!("{}.{}", stem.to_string_lossy(), pid)
        } else {
            format!("{}.{}.{}", stem.to_string_lossy(), pid, extension)
        };
        path.set_file_name(unique);
    }
    path
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer().json().with_writer(file).with_ansi(false);

            subscriber.with(file_layer).try_init()?;
        }
        (Some(file_path), false) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            subscriber.with(file_layer).try_init()?;
        }
        (None, true) => {
            let stderr_layer = fmt::layer().json().with_writer(io::stderr).with_ansi(false);

            subscriber.with(stderr_layer).try_init()?;
        }
        // Stdout carries the driver's output, so logs stay on stderr
        (None, false) => {
            let stderr_layer = fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            subscriber.with(stderr_layer).try_init()?;
        }
    }

    Ok(())
}

/// Log a control protocol envelope in one structured line
#[macro_export]
macro_rules! log_control_message {
    ($level:expr, $direction:expr, $subtype:expr, $data:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            subtype = $subtype,
            data = ?$data,
            pid = std::process::id(),
            "Control message"
        );
    };
}

/// Helper function to log performance timing
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        assert_eq!(LogConfig::from_lookup(lookup(&[])), LogConfig::default());
    }

    #[test]
    fn test_file_and_json_from_variables() {
        let config = LogConfig::from_lookup(lookup(&[
            ("RUST_LOG", "debug"),
            (LOG_FILE_ENV, "/tmp/bridge.log"),
            (LOG_JSON_ENV, "true"),
        ]));

        assert_eq!(config.level, "debug");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/bridge.log")));
        assert!(config.json_format);
    }

    #[test]
    fn test_unique_file_name() {
        assert_eq!(
            with_pid_suffix(PathBuf::from("/tmp/bridge.log"), 42),
            PathBuf::from("/tmp/bridge.42.log")
        );
        assert_eq!(
            with_pid_suffix(PathBuf::from("/tmp/bridge"), 42),
            PathBuf::from("/tmp/bridge.42")
        );
    }

    #[test]
    fn test_cli_overrides_win() {
        let config = LogConfig::from_lookup(lookup(&[("RUST_LOG", "warn")]))
            .with_overrides(Some("trace".to_string()), Some(PathBuf::from("x.log")));

        assert_eq!(config.level, "trace");
        assert_eq!(config.file_path, Some(PathBuf::from("x.log")));
    }
}
