use crate::config::{LogFormat, LogLevel, LogOutputType, LoggingConfig};
use crate::error::ProxyError;
use chrono::{SecondsFormat, Utc};
use log::{LevelFilter, Metadata, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

struct Sink {
    filter: LevelFilter,
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
}

/// `log` backend writing text or JSON lines to stdout and/or files, each
/// target with its own level.
pub struct CustomLogger {
    format: LogFormat,
    sinks: Vec<Sink>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, ProxyError> {
        let default_level = config.level.unwrap_or_default();
        let format = config.format.unwrap_or_default();
        let targets = config
            .targets
            .unwrap_or_else(|| LoggingConfig::default().targets.unwrap_or_default());

        let mut sinks = Vec::with_capacity(targets.len());
        for target in targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target
                        .path
                        .as_ref()
                        .ok_or_else(|| ProxyError::Config("File log target requires a path".to_string()))?;
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .map_err(|e| ProxyError::Config(format!("Failed to open log file {}: {}", path.display(), e)))?;
                    Box::new(file)
                }
            };
            sinks.push(Sink {
                filter: target.level.unwrap_or(default_level).into(),
                writer: Mutex::new(BufWriter::new(writer)),
            });
        }

        Ok(Self { format, sinks })
    }

    pub fn init(config: LoggingConfig) -> Result<(), ProxyError> {
        let logger = Self::new(config)?;
        let max_level = logger.max_level();
        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| ProxyError::Config(format!("Logger already installed: {}", e)))?;
        log::set_max_level(max_level);
        Ok(())
    }

    fn max_level(&self) -> LevelFilter {
        self.sinks
            .iter()
            .map(|s| s.filter)
            .max()
            .unwrap_or(LevelFilter::Off)
    }

    fn render(&self, record: &Record) -> String {
        match self.format {
            LogFormat::Text => format_text(record),
            LogFormat::Json => format_json(record),
        }
    }
}

fn format_text(record: &Record) -> String {
    format!(
        "{} [{}] [{}] {}",
        Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.target(),
        record.args()
    )
}

fn format_json(record: &Record) -> String {
    json!({
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "level": record.level().as_str().to_lowercase(),
        "target": record.target(),
        "file": record.file(),
        "line": record.line(),
        "message": record.args().to_string(),
    })
    .to_string()
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.sinks.iter().any(|s| metadata.level() <= s.filter)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.render(record);
        for sink in self.sinks.iter().filter(|s| record.level() <= s.filter) {
            if let Ok(mut writer) = sink.writer.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }

    fn flush(&self) {
        for sink in &self.sinks {
            if let Ok(mut writer) = sink.writer.lock() {
                let _ = writer.flush();
            }
        }
    }
}

/// env_logger setup used when no logging section is configured.
/// `RUST_LOG` still overrides `level`.
pub fn init_fallback(level: LogLevel, format: LogFormat) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.to_string()));
    if format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", format_json(record)));
    }
    builder.init();
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, ProxyError> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(ProxyError::Config(format!(
            "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
            s
        ))),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, ProxyError> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(ProxyError::Config(format!("Invalid log format: {}. Must be one of: text, json", s))),
    }
}
