//! Source definitions as configuration tooling sees them: validation rules
//! applied before anything reaches the store, and the built-in providers.

use crate::constants::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_RETRIES, MAX_WINDOW_SECONDS, TMDB_SOURCE,
    WIKIDATA_SOURCE,
};
use crate::error::{IndexError, Result};
use crate::models::{
    NewCapability, NewCredential, NewRateLimit, NewRefreshPolicy, SourceDefinition,
};
use std::collections::HashSet;

/// Reject definitions that the store would otherwise accept but admission
/// could not evaluate sensibly.
pub fn validate_definition(definition: &SourceDefinition) -> Result<()> {
    let name = definition.name.trim();
    if name.is_empty() {
        return Err(IndexError::Config("data source name must not be empty".to_string()));
    }
    if name != definition.name {
        return Err(IndexError::Config(format!(
            "data source name '{}' has surrounding whitespace",
            definition.name
        )));
    }

    let mut windows = HashSet::new();
    for limit in &definition.rate_limits {
        validate_rate_limit(&definition.name, limit)?;
        if !windows.insert(limit.window_seconds) {
            return Err(IndexError::Config(format!(
                "data source '{}' declares the {}s window more than once",
                definition.name, limit.window_seconds
            )));
        }
    }

    let mut credentials = HashSet::new();
    for credential in &definition.credentials {
        validate_credential(&definition.name, credential)?;
        if !credentials.insert((credential.kind.as_str(), credential.token.as_str())) {
            return Err(IndexError::Config(format!(
                "data source '{}' declares a duplicate {} credential",
                definition.name, credential.kind
            )));
        }
    }

    let mut capabilities = HashSet::new();
    for capability in &definition.capabilities {
        if capability.capability.trim().is_empty() {
            return Err(IndexError::Config(format!(
                "data source '{}' declares an empty capability",
                definition.name
            )));
        }
        if !capabilities.insert(capability.capability.as_str()) {
            return Err(IndexError::Config(format!(
                "data source '{}' declares capability '{}' more than once",
                definition.name, capability.capability
            )));
        }
    }

    Ok(())
}

pub fn validate_rate_limit(source_name: &str, limit: &NewRateLimit) -> Result<()> {
    if limit.window_seconds <= 0 || limit.window_seconds > MAX_WINDOW_SECONDS {
        return Err(IndexError::Config(format!(
            "data source '{}': window_seconds must be between 1 and {}, got {}",
            source_name, MAX_WINDOW_SECONDS, limit.window_seconds
        )));
    }
    if limit.max_calls < 0 {
        return Err(IndexError::Config(format!(
            "data source '{}': max_calls must not be negative, got {}",
            source_name, limit.max_calls
        )));
    }
    Ok(())
}

pub fn validate_credential(source_name: &str, credential: &NewCredential) -> Result<()> {
    if credential.kind.trim().is_empty() {
        return Err(IndexError::Config(format!(
            "data source '{}': credential kind must not be empty",
            source_name
        )));
    }
    if credential.token.is_empty() {
        return Err(IndexError::Config(format!(
            "data source '{}': {} credential has an empty secret",
            source_name, credential.kind
        )));
    }
    Ok(())
}

fn default_rate_limit(window_seconds: i64, max_calls: i64) -> NewRateLimit {
    NewRateLimit {
        max_retries: Some(DEFAULT_MAX_RETRIES),
        backoff_multiplier: Some(DEFAULT_BACKOFF_MULTIPLIER),
        ..NewRateLimit::new(window_seconds, max_calls)
    }
}

fn capabilities(names: &[&str]) -> Vec<NewCapability> {
    names.iter().map(|name| NewCapability::new(*name)).collect()
}

/// Providers installed by `oci seed` when the configuration lists none.
pub fn default_sources() -> Vec<SourceDefinition> {
    vec![
        SourceDefinition {
            kind: Some("rest".to_string()),
            base_url: Some("https://api.themoviedb.org/3".to_string()),
            // No hard limit since 2019; 40 per 10s remains the safe default.
            rate_limits: vec![default_rate_limit(10, 40)],
            refresh_policy: Some(NewRefreshPolicy {
                default_refresh_interval_minutes: Some(14 * 24 * 60),
                max_record_age_days: Some(30),
                ..NewRefreshPolicy::default()
            }),
            capabilities: capabilities(&["films", "people", "assets", "updates"]),
            ..SourceDefinition::new(TMDB_SOURCE)
        },
        SourceDefinition {
            kind: Some("sparql".to_string()),
            base_url: Some("https://query.wikidata.org/sparql".to_string()),
            // WDQS asks for at most 60 requests per minute.
            rate_limits: vec![default_rate_limit(1, 1)],
            refresh_policy: Some(NewRefreshPolicy {
                default_refresh_interval_minutes: Some(30 * 24 * 60),
                max_record_age_days: Some(60),
                ..NewRefreshPolicy::default()
            }),
            capabilities: capabilities(&["films", "people", "updates"]),
            ..SourceDefinition::new(WIKIDATA_SOURCE)
        },
    ]
}
