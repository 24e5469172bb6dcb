//! Startup checks for a [`Config`] before any socket is bound.

use crate::config::{Config, LogOutputType, PersistencePolicy};
use std::path::Path;

const MIN_HEADER_SIZE: usize = 1024;
const SMALL_RELAY_BUFFER: usize = 256;
const LARGE_RELAY_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }
}

pub struct ConfigValidator<'a> {
    config: &'a Config,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::success();
        self.validate_listener(&mut result);
        self.validate_limits(&mut result);
        self.validate_tls(&mut result);
        self.validate_logging(&mut result);
        result
    }

    fn validate_listener(&self, result: &mut ValidationResult) {
        let addr = self.config.listen_addr;
        if addr.port() == 0 {
            result.add_warning("Listening on port 0 picks an ephemeral port".to_string());
        }
        if addr.ip().is_unspecified() {
            result.add_warning(format!(
                "Binding to all interfaces ({}) exposes the proxy to external networks",
                addr.ip()
            ));
            result.add_suggestion("Bind the forward proxy to an internal interface unless it must be public".to_string());
        }
        if !self.config.reuse_address {
            result.add_suggestion("Enable reuse_address to allow quick restarts on the same port".to_string());
        }
    }

    fn validate_limits(&self, result: &mut ValidationResult) {
        let config = self.config;

        if config.timeout_secs == 0 {
            result.add_error("timeout_secs must be greater than zero".to_string());
        } else if config.timeout_secs > 300 {
            result.add_warning(format!(
                "Long operation timeout ({}s) lets stalled peers hold connections",
                config.timeout_secs
            ));
        }

        if config.relay_buffer_size == 0 {
            result.add_error("relay_buffer_size must be greater than zero".to_string());
        } else if config.relay_buffer_size < SMALL_RELAY_BUFFER {
            result.add_warning(format!(
                "relay_buffer_size of {} bytes splits bodies into many small writes",
                config.relay_buffer_size
            ));
        } else if config.relay_buffer_size > LARGE_RELAY_BUFFER {
            result.add_warning(format!(
                "relay_buffer_size of {} bytes is allocated per active relay",
                config.relay_buffer_size
            ));
        }

        if config.max_header_size < MIN_HEADER_SIZE {
            result.add_error(format!(
                "max_header_size must be at least {} bytes, got {}",
                MIN_HEADER_SIZE, config.max_header_size
            ));
        }

        if config.persistence == PersistencePolicy::RequirePersistent {
            result.add_warning("Clients sending 'Connection: close' will be rejected with 400".to_string());
        }
    }

    fn validate_tls(&self, result: &mut ValidationResult) {
        if let Some(tls) = &self.config.tls {
            Self::require_file(result, "certificate", &tls.certificate);
            Self::require_file(result, "private key", &tls.private_key);
        }

        if let Some(upstream) = &self.config.upstream_tls {
            if !upstream.use_webpki_roots && upstream.ca_certificates.is_empty() {
                result.add_error("upstream_tls has no trust anchors: enable use_webpki_roots or list ca_certificates".to_string());
            }
            for path in &upstream.ca_certificates {
                Self::require_file(result, "CA certificate", path);
            }
        }
    }

    fn validate_logging(&self, result: &mut ValidationResult) {
        let Some(targets) = self.config.logging.as_ref().and_then(|l| l.targets.as_ref()) else {
            return;
        };
        if targets.is_empty() {
            result.add_warning("Logging is configured without targets; nothing will be logged".to_string());
        }
        for target in targets {
            if target.output_type == LogOutputType::File && target.path.is_none() {
                result.add_error("File log target requires a path".to_string());
            }
        }
    }

    fn require_file(result: &mut ValidationResult, what: &str, path: &str) {
        if path.is_empty() {
            result.add_error(format!("{} path is empty", what));
        } else if !Path::new(path).is_file() {
            result.add_error(format!("{} file not found: {}", what, path));
        }
    }
}
