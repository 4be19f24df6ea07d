//! Logging configuration for vantage
//!
//! Themed console output plus an optional daily-rolling log file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILE: &str = "logs/vantage.log";

/// ANSI color codes for log levels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTheme {
    /// Color for TRACE level logs
    pub trace: String,
    /// Color for DEBUG level logs
    pub debug: String,
    /// Color for INFO level logs
    pub info: String,
    /// Color for WARN level logs
    pub warn: String,
    /// Color for ERROR level logs
    pub error: String,
}

/// Default ANSI color theme
impl Default for LogTheme {
    fn default() -> Self {
        Self {
            trace: "\x1b[37m".to_string(), // White
            debug: "\x1b[36m".to_string(), // Cyan
            info: "\x1b[32m".to_string(),  // Green
            warn: "\x1b[33m".to_string(),  // Yellow
            error: "\x1b[31m".to_string(), // Red
        }
    }
}

/// Initialize logging with the given configuration
pub async fn init_logging(
    log_level: &str,
    theme_path: &str,
    log_to_file: bool,
    log_file_path: Option<&str>,
) -> anyhow::Result<()> {
    let theme = load_theme(theme_path).await?;
    let level = parse_log_level(log_level)?;

    // Other crates stay at WARN unless RUST_LOG says otherwise
    let filter = EnvFilter::from_default_env()
        .add_directive(Level::WARN.into())
        .add_directive(format!("vantage={}", level).to_lowercase().parse()?);

    // stdout carries command output
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .event_format(LogFormatter { theme: theme.clone(), colored: true });

    let file_layer = if log_to_file {
        let (directory, file_name) = split_log_path(log_file_path.unwrap_or(DEFAULT_LOG_FILE));
        let file_appender = RollingFileAppender::new(Rotation::DAILY, directory, file_name);
        Some(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .event_format(LogFormatter { theme, colored: false }),
        )
    } else {
        None
    };

    let registry = tracing_subscriber::registry().with(filter);

    if let Some(file_layer) = file_layer {
        registry.with(console_layer).with(file_layer).try_init()?;
    } else {
        registry.with(console_layer).try_init()?;
    }

    Ok(())
}

/// Split a log file path into the appender's directory and file name prefix.
fn split_log_path(path: &str) -> (String, String) {
    let path = Path::new(path);
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(|parent| parent.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vantage.log".to_string());
    (directory, file_name)
}

/// Custom log formatter with theme colors
struct LogFormatter {
    theme: LogTheme,
    colored: bool,
}

impl<S, N> fmt::FormatEvent<S, N> for LogFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();

        let now = chrono::Local::now();
        write!(writer, "[{}] ", now.format("%Y-%m-%d %H:%M:%S%.3f"))?;

        if self.colored {
            let level_color = match *metadata.level() {
                Level::TRACE => &self.theme.trace,
                Level::DEBUG => &self.theme.debug,
                Level::INFO => &self.theme.info,
                Level::WARN => &self.theme.warn,
                Level::ERROR => &self.theme.error,
            };
            write!(writer, "{}{:<5}\x1b[0m ", level_color, metadata.level())?;
        } else {
            write!(writer, "{:<5} ", metadata.level())?;
        }

        write!(writer, "{}: ", metadata.target())?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Load log theme from YAML file
async fn load_theme<P: AsRef<Path>>(path: P) -> anyhow::Result<LogTheme> {
    match fs::read_to_string(&path).await {
        Ok(contents) => {
            let theme: LogTheme = serde_yaml::from_str(&contents)?;
            Ok(theme)
        }
        Err(_) => Ok(LogTheme::default()),
    }
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_uppercase().as_str() {
        "TRACE" => Ok(Level::TRACE),
        "DEBUG" => Ok(Level::DEBUG),
        "INFO" => Ok(Level::INFO),
        "WARN" => Ok(Level::WARN),
        "ERROR" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {}", level)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_split_log_path() {
        assert_eq!(
            split_log_path("/var/log/vantage/run.log"),
            ("/var/log/vantage".to_string(), "run.log".to_string())
        );
        assert_eq!(split_log_path("run.log"), (".".to_string(), "run.log".to_string()));
    }

    #[tokio::test]
    async fn test_theme_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("theme.yml");
        std::fs::write(
            &path,
            "trace: \"\\e[90m\"\ndebug: \"\\e[34m\"\ninfo: \"\\e[32m\"\nwarn: \"\\e[33m\"\nerror: \"\\e[91m\"\n",
        )
        .unwrap();

        let theme = load_theme(&path).await.unwrap();
        assert_eq!(theme.debug, "\x1b[34m");

        let fallback = load_theme(dir.path().join("missing.yml")).await.unwrap();
        assert_eq!(fallback.info, LogTheme::default().info);
    }
}
