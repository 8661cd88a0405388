//! Whole-config validation.
//!
//! Runs before a configuration is applied. Collects every problem into one
//! list; the caller rejects the configuration atomically if the list is
//! non-empty, leaving the running config untouched.

use crate::ConfigError;
use conductor_core::config::{MasterConfig, RESERVED_BUILDER_PREFIX};
use std::collections::HashSet;

/// Validate a configuration, returning all problems found.
pub fn validate(config: &MasterConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    check_duplicates(config, &mut errors);

    let worker_names: HashSet<&str> = config.workers.iter().map(|w| w.name.as_str()).collect();
    let lock_names: HashSet<&str> = config.locks.iter().map(|l| l.name.as_str()).collect();
    let builder_names: HashSet<&str> = config.builders.iter().map(|b| b.name.as_str()).collect();

    for builder in &config.builders {
        if builder.name.starts_with(RESERVED_BUILDER_PREFIX) {
            errors.push(ConfigError::ReservedName(format!(
                "builder '{}' uses the reserved prefix '{}'",
                builder.name, RESERVED_BUILDER_PREFIX
            )));
        }
        if builder.worker_names.is_empty() {
            errors.push(ConfigError::MissingField(format!(
                "builder '{}' has no eligible workers",
                builder.name
            )));
        }
        for worker in &builder.worker_names {
            if !worker_names.contains(worker.as_str()) {
                errors.push(ConfigError::InvalidReference(format!(
                    "builder '{}' references unknown worker '{}'",
                    builder.name, worker
                )));
            }
        }
        for access in &builder.locks {
            if !lock_names.contains(access.lock.as_str()) {
                errors.push(ConfigError::InvalidReference(format!(
                    "builder '{}' references unknown lock '{}'",
                    builder.name, access.lock
                )));
            }
        }
    }

    for scheduler in &config.schedulers {
        if scheduler.builder_names.is_empty() {
            errors.push(ConfigError::MissingField(format!(
                "scheduler '{}' targets no builders",
                scheduler.name
            )));
        }
        for builder in &scheduler.builder_names {
            if !builder_names.contains(builder.as_str()) {
                errors.push(ConfigError::InvalidReference(format!(
                    "scheduler '{}' references unknown builder '{}'",
                    scheduler.name, builder
                )));
            }
        }
    }

    for lock in &config.locks {
        if lock.max_count < 1 {
            errors.push(ConfigError::InvalidValue {
                field: format!("lock '{}' max_count", lock.name),
                message: "must allow at least one holder".to_string(),
            });
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn check_duplicates(config: &MasterConfig, errors: &mut Vec<ConfigError>) {
    let groups: [(&str, Vec<&str>); 4] = [
        (
            "builder",
            config.builders.iter().map(|b| b.name.as_str()).collect(),
        ),
        (
            "scheduler",
            config.schedulers.iter().map(|s| s.name.as_str()).collect(),
        ),
        ("lock", config.locks.iter().map(|l| l.name.as_str()).collect()),
        (
            "worker",
            config.workers.iter().map(|w| w.name.as_str()).collect(),
        ),
    ];
    for (kind, names) in groups {
        let mut seen = HashSet::new();
        for name in names {
            if !seen.insert(name) {
                errors.push(ConfigError::Duplicate(format!("{} '{}'", kind, name)));
            }
        }
    }
}
