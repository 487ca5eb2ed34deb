use std::net::SocketAddr;

use crate::config::models::{AdmissionConfig, LoggingConfig, ServerConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid duration for '{field}': '{value}' ({reason})")]
    InvalidDuration {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration, reporting every problem found
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if let Err(e) = Self::validate_duration("shutdown_timeout", &config.shutdown_timeout) {
            errors.push(e);
        }

        if let Err(mut admission_errors) = Self::validate_admission(&config.admission) {
            errors.append(&mut admission_errors);
        }

        if let Err(e) = Self::validate_logging(&config.logging) {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:5000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_admission(config: &AdmissionConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if config.max_concurrent == 0 {
            errors.push(ValidationError::InvalidField {
                field: "admission.max_concurrent".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if let Err(e) = Self::validate_duration("admission.acquire_timeout", &config.acquire_timeout)
        {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_logging(config: &LoggingConfig) -> ValidationResult<()> {
        if let Err(e) = tracing_subscriber::EnvFilter::try_new(&config.level) {
            return Err(ValidationError::InvalidField {
                field: "logging.level".to_string(),
                message: e.to_string(),
            });
        }
        Ok(())
    }

    fn validate_duration(field: &str, value: &str) -> ValidationResult<()> {
        humantime::parse_duration(value)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidDuration {
                field: field.to_string(),
                value: value.to_string(),
                reason: e.to_string(),
            })
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} configuration errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
