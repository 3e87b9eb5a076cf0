use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
};

use axum::routing::MethodFilter;
use http::Method;
use url::Url;

use crate::{
    config::models::{AgentConfig, FunctionConfig, FunctionReference, ResultStoreConfig, TriggerConfig},
    core::function::FunctionIdentity,
};

/// Path of the agent's own health endpoint.
pub const HEALTH_PATH: &str = "/agent-healthz";

/// Suffix of the completion callback route under each trigger and function URL.
pub const FUNCTION_OUTPUT_SUFFIX: &str = "/functionOutput";

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

    #[error("Unknown function '{function}' referenced by trigger '{trigger}'")]
    UnknownFunction { trigger: String, function: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Concrete routes a validated configuration installs, as `(method, path)`.
/// `None` stands for any method.
pub type RouteKey = (Option<String>, String);

pub struct AgentConfigValidator;

impl AgentConfigValidator {
    /// Validate the whole agent configuration, reporting every problem at once.
    pub fn validate(config: &AgentConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }
        if let Err(e) = Self::validate_url(&config.executor_url, "executor_url") {
            errors.push(e);
        }
        errors.extend(Self::validate_budgets(config));

        if let ResultStoreConfig::Http { url, .. } = &config.result_store {
            if let Err(e) = Self::validate_url(url, "result_store.url") {
                errors.push(e);
            }
        }

        if let Err(mut e) = Self::validate_triggers(&config.functions, &config.triggers) {
            errors.append(&mut e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate only the function and trigger sets. Used on hot reload, where
    /// the tunables of the running process are kept.
    pub fn validate_triggers(
        functions: &[FunctionConfig],
        triggers: &[TriggerConfig],
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let mut known: HashSet<(&str, &str)> = HashSet::new();
        for (i, function) in functions.iter().enumerate() {
            if function.name.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("functions[{i}].name"),
                });
            }
            if function.uid.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("functions[{i}].uid"),
                });
            }
            if !known.insert((function.namespace.as_str(), function.name.as_str())) {
                errors.push(ValidationError::InvalidField {
                    field: format!("functions[{i}]"),
                    message: format!(
                        "function '{}/{}' is declared more than once",
                        function.namespace, function.name
                    ),
                });
            }
        }

        for trigger in triggers {
            if let Err(mut trigger_errors) = Self::validate_single_trigger(trigger, &known) {
                errors.append(&mut trigger_errors);
            }
        }

        if let Err(mut conflicts) = Self::check_route_conflicts(functions, triggers) {
            errors.append(&mut conflicts);
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '0.0.0.0:8888')".to_string(),
            });
        }
        Ok(())
    }

    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match Url::parse(url_str) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => Ok(()),
            Ok(url) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("'{url_str}' must be an http(s) URL with a host, got scheme '{}'", url.scheme()),
            }),
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("'{url_str}' is not a valid URL: {e}"),
            }),
        }
    }

    fn validate_budgets(config: &AgentConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut positive = |ok: bool, field: &str, message: &str| {
            if !ok {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: message.to_string(),
                });
            }
        };

        let rt = &config.round_trip;
        positive(!rt.timeout.is_zero(), "round_trip.timeout", "must be greater than zero");
        positive(rt.timeout_exponent >= 1, "round_trip.timeout_exponent", "must be at least 1");
        positive(rt.max_retries >= 1, "round_trip.max_retries", "must be at least 1");
        positive(
            rt.svc_address_max_retries >= 1,
            "round_trip.svc_address_max_retries",
            "must be at least 1",
        );
        positive(
            !rt.function_timeout.is_zero(),
            "round_trip.function_timeout",
            "must be greater than zero",
        );
        positive(
            !config.address_cache.update_timeout.is_zero(),
            "address_cache.update_timeout",
            "must be greater than zero",
        );
        positive(
            !config.address_cache.reap_interval.is_zero(),
            "address_cache.reap_interval",
            "must be greater than zero",
        );
        positive(
            !config.invocation.sync_wait.is_zero(),
            "invocation.sync_wait",
            "must be greater than zero",
        );
        positive(
            !config.invocation.correlation_ttl.is_zero(),
            "invocation.correlation_ttl",
            "must be greater than zero",
        );
        positive(
            config.invocation.max_body_bytes > 0,
            "invocation.max_body_bytes",
            "must be greater than zero",
        );
        errors
    }

    fn validate_single_trigger(
        trigger: &TriggerConfig,
        known: &HashSet<(&str, &str)>,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let field = format!("triggers.{}", trigger.name);

        if trigger.name.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "triggers[].name".to_string(),
            });
        }

        match (&trigger.prefix, &trigger.relative_url) {
            (Some(_), Some(_)) => errors.push(ValidationError::InvalidField {
                field: field.clone(),
                message: "set either 'prefix' or 'relative_url', not both".to_string(),
            }),
            (None, None) => errors.push(ValidationError::MissingField {
                field: format!("{field}.prefix|relative_url"),
            }),
            (Some(path), None) | (None, Some(path)) => {
                if let Err(e) = Self::validate_path(path, &field) {
                    errors.push(e);
                }
            }
        }

        for method in &trigger.methods {
            if parse_method_filter(method).is_none() {
                errors.push(ValidationError::InvalidField {
                    field: format!("{field}.methods"),
                    message: format!("unsupported HTTP method '{method}'"),
                });
            }
        }

        if let FunctionReference::Weights { functions } = &trigger.function {
            if functions.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("{field}.function.functions"),
                });
            }
            for weighted in functions.iter().filter(|f| f.weight == 0) {
                errors.push(ValidationError::InvalidField {
                    field: format!("{field}.function"),
                    message: format!("function '{}' has weight 0", weighted.name),
                });
            }
        }

        for name in trigger.function.function_names() {
            if !known.contains(&(trigger.namespace.as_str(), name)) {
                errors.push(ValidationError::UnknownFunction {
                    trigger: trigger.name.clone(),
                    function: format!("{}/{name}", trigger.namespace),
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_path(path: &str, field: &str) -> ValidationResult<()> {
        if !path.starts_with('/') {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("path '{path}' must start with '/'"),
            });
        }
        if path.contains(['{', '}']) {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("path '{path}' must not contain '{{' or '}}'"),
            });
        }
        if path.trim_end_matches('/').is_empty() {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: "the root path cannot be bound to a trigger".to_string(),
            });
        }
        if path.contains("//") {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("path '{path}' contains an empty segment"),
            });
        }
        Ok(())
    }

    /// Every concrete route may be installed once; the router panics otherwise.
    fn check_route_conflicts(
        functions: &[FunctionConfig],
        triggers: &[TriggerConfig],
    ) -> Result<(), Vec<ValidationError>> {
        let mut owners: HashMap<String, String> = HashMap::new();
        owners.insert(HEALTH_PATH.to_string(), "the health endpoint".to_string());
        let mut errors = Vec::new();

        let mut claim = |path: String, owner: String| {
            if let Some(previous) = owners.get(&path) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("'{path}' is claimed by both {previous} and {owner}"),
                });
            } else {
                owners.insert(path, owner);
            }
        };

        for function in functions {
            let identity = FunctionIdentity::new(
                &function.name,
                &function.namespace,
                &function.resource_version,
                &function.uid,
            );
            let owner = format!("function '{}/{}'", function.namespace, function.name);
            for path in function_routes(&identity.default_url()) {
                claim(path, owner.clone());
            }
        }

        for trigger in triggers {
            let Some(base) = trigger.base_path() else {
                continue;
            };
            let owner = format!("trigger '{}'", trigger.name);
            let paths = if trigger.prefix.is_some() {
                function_routes(&base)
            } else {
                vec![base.clone(), format!("{base}{FUNCTION_OUTPUT_SUFFIX}")]
            };
            for path in paths {
                claim(path, owner.clone());
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Format multiple validation errors into a readable message
    pub fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
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

/// Routes mounted under a prefix: the base, its catch-all and the callback.
fn function_routes(base: &str) -> Vec<String> {
    vec![
        base.to_string(),
        format!("{base}/{{*rest}}"),
        format!("{base}{FUNCTION_OUTPUT_SUFFIX}"),
    ]
}

/// Case-insensitive method name to axum filter; `None` for methods axum cannot filter on.
pub fn parse_method_filter(method: &str) -> Option<MethodFilter> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).ok()?;
    MethodFilter::try_from(method).ok()
}
