use std::net::SocketAddr;

use regex::Regex;

use crate::{
    config::models::RelayConfig,
    core::{balancer::StrategyKind, encoding::Encoding},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Relay configuration validator
pub struct RelayConfigValidator;

impl RelayConfigValidator {
    /// Validate the entire relay configuration
    pub fn validate(config: &RelayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        // Validate listen address
        if let Err(e) = Self::validate_listen_address(&config.listen) {
            errors.push(e);
        }

        // A relay that can never route anything is a configuration mistake
        if config.rules.is_empty() && config.hosts.is_empty() && config.forward.is_none() {
            errors.push(ValidationError::MissingField {
                field: "rules / hosts / forward".to_string(),
            });
        }

        for (index, rule) in config.rules.iter().enumerate() {
            if let Err(mut rule_errors) = Self::validate_rule(index, &rule.pattern, &rule.target) {
                errors.append(&mut rule_errors);
            }
        }

        for (key, value) in &config.hosts {
            if value.urls().is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: format!("hosts '{key}'"),
                    message: "Origin tuple must have at least one member".to_string(),
                });
            }
            for (i, target) in value.urls().iter().enumerate() {
                if let Err(e) =
                    Self::validate_url(target, &format!("hosts '{key}' origin {}", i + 1))
                {
                    errors.push(e);
                }
            }
        }

        for alias in config.aliases.keys() {
            if let Err(e) = Self::validate_alias_chain(alias, config) {
                errors.push(e);
            }
        }

        if let Some(forward) = &config.forward {
            if let Err(e) = Self::validate_url(forward, "forward") {
                errors.push(e);
            }
        }

        for (key, credentials) in &config.auth {
            if !credentials.contains(':') {
                errors.push(ValidationError::InvalidField {
                    field: format!("auth '{key}'"),
                    message: "Credentials must be in 'user:password' form".to_string(),
                });
            }
        }

        for (key, target) in &config.redirects {
            if let Err(e) = Self::validate_url(target, &format!("redirects '{key}'")) {
                errors.push(e);
            }
        }

        for (key, target) in &config.error_pages {
            if let Err(e) = Self::validate_url(target, &format!("error_pages '{key}'")) {
                errors.push(e);
            }
        }

        if config.strategy.parse::<StrategyKind>().is_err() {
            errors.push(ValidationError::InvalidField {
                field: "strategy".to_string(),
                message: format!(
                    "Unknown strategy '{}'; expected 'robin' or 'smart'",
                    config.strategy
                ),
            });
        }

        if !(100..=599).contains(&config.deny_status) {
            errors.push(ValidationError::InvalidField {
                field: "deny_status".to_string(),
                message: format!("Status {} is not a valid HTTP status", config.deny_status),
            });
        }

        if config.max_pending == 0 {
            errors.push(ValidationError::InvalidField {
                field: "max_pending".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        for (field, value) in [
            ("connect_timeout", &config.connect_timeout),
            ("recv_timeout", &config.recv_timeout),
            ("refresh_interval", &config.refresh_interval),
        ] {
            if let Err(e) = humantime::parse_duration(value) {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: format!("Cannot parse duration '{value}': {e}"),
                });
            }
        }

        if let Some(compress) = &config.compress {
            if Encoding::parse(compress).is_none() {
                errors.push(ValidationError::InvalidField {
                    field: "compress".to_string(),
                    message: format!(
                        "Unknown encoding '{compress}'; expected 'plain', 'chunked', 'gzip' or 'deflate'"
                    ),
                });
            }
        }

        for peer in &config.trusted {
            if peer.parse::<std::net::IpAddr>().is_err() {
                errors.push(ValidationError::InvalidField {
                    field: "trusted".to_string(),
                    message: format!("'{peer}' is not an IP address"),
                });
            }
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
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:8080' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Validate a single regex rule
    fn validate_rule(
        index: usize,
        pattern: &str,
        target: &str,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = Regex::new(pattern) {
            errors.push(ValidationError::InvalidField {
                field: format!("rules[{index}].pattern"),
                message: format!("Invalid regex: {e}"),
            });
        }

        // The target may hold capture placeholders, so only the scheme prefix
        // can be checked statically.
        if !target.starts_with("http://") && !target.starts_with("https://") {
            errors.push(ValidationError::InvalidField {
                field: format!("rules[{index}].target"),
                message: "Target template must start with 'http://' or 'https://'".to_string(),
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Validate that an alias reaches a host entry within two hops
    fn validate_alias_chain(alias: &str, config: &RelayConfig) -> ValidationResult<()> {
        let first = match config.aliases.get(alias) {
            Some(target) => target,
            None => return Ok(()),
        };
        if config.hosts.contains_key(first) {
            return Ok(());
        }
        if let Some(second) = config.aliases.get(first) {
            if config.hosts.contains_key(second) {
                return Ok(());
            }
            return Err(ValidationError::InvalidField {
                field: format!("aliases '{alias}'"),
                message: format!(
                    "Chain '{alias}' -> '{first}' -> '{second}' does not reach a host entry within two hops"
                ),
            });
        }
        Err(ValidationError::InvalidField {
            field: format!("aliases '{alias}'"),
            message: format!("'{first}' is neither a host entry nor an alias"),
        })
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
