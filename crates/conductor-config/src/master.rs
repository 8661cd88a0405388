//! Master configuration parsing.

use crate::{ConfigError, ConfigResult};
use conductor_core::config::{
    BuilderConfig, LockAccess, LockConfig, LockMode, LockScope, MasterConfig, NextBuildPolicy,
    NextWorkerPolicy, SchedulerConfig, SchedulerKind, WorkerConfig,
};
use kdl::{KdlDocument, KdlNode};
use std::time::Duration;

/// Parse a master configuration from KDL text.
///
/// Structural errors (bad KDL, missing fields, unknown enum values) fail
/// here; cross-entity checks (duplicates, dangling references) are the job
/// of [`crate::validate`].
pub fn parse_master_config(kdl: &str) -> ConfigResult<MasterConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config = MasterConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "builder" => config.builders.push(parse_builder(node)?),
            "scheduler" => config.schedulers.push(parse_scheduler(node)?),
            "lock" => config.locks.push(parse_lock(node)?),
            "worker" => config.workers.push(parse_worker(node)?),
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_builder(node: &KdlNode) -> ConfigResult<BuilderConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("builder name".to_string()))?;

    let mut factory = String::new();
    let mut worker_names = Vec::new();
    let mut locks = Vec::new();
    let mut next_worker = NextWorkerPolicy::default();
    let mut next_build = NextBuildPolicy::default();
    let mut category = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "factory" => {
                    factory = get_first_string_arg(child).unwrap_or_default();
                }
                "workers" => {
                    worker_names.extend(get_all_string_args(child));
                }
                "lock" => {
                    let lock = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("lock name in builder '{}'", name))
                    })?;
                    let mode = match get_string_prop(child, "mode").as_deref() {
                        Some("counting") => LockMode::Counting,
                        Some("exclusive") | None => LockMode::Exclusive,
                        Some(other) => {
                            return Err(ConfigError::InvalidValue {
                                field: "lock mode".to_string(),
                                message: format!("unknown mode: {}", other),
                            });
                        }
                    };
                    locks.push(LockAccess { lock, mode });
                }
                "next-worker" => {
                    next_worker = match get_first_string_arg(child).as_deref() {
                        Some("in-order") | None => NextWorkerPolicy::InOrder,
                        Some("least-loaded") => NextWorkerPolicy::LeastLoaded,
                        Some(other) => {
                            return Err(ConfigError::InvalidValue {
                                field: "next-worker".to_string(),
                                message: format!("unknown policy: {}", other),
                            });
                        }
                    };
                }
                "next-build" => {
                    next_build = match get_first_string_arg(child).as_deref() {
                        Some("fifo") | None => NextBuildPolicy::Fifo,
                        Some("priority") => NextBuildPolicy::Priority,
                        Some(other) => {
                            return Err(ConfigError::InvalidValue {
                                field: "next-build".to_string(),
                                message: format!("unknown policy: {}", other),
                            });
                        }
                    };
                }
                "category" => {
                    category = get_first_string_arg(child);
                }
                _ => {}
            }
        }
    }

    if factory.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "factory for builder '{}'",
            name
        )));
    }

    Ok(BuilderConfig {
        name,
        factory,
        worker_names,
        locks,
        next_worker,
        next_build,
        category,
    })
}

fn parse_scheduler(node: &KdlNode) -> ConfigResult<SchedulerConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("scheduler name".to_string()))?;

    let mut kind = None;
    let mut builder_names = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "kind" => {
                    kind = Some(parse_scheduler_kind(&name, child)?);
                }
                "builders" => {
                    builder_names.extend(get_all_string_args(child));
                }
                _ => {}
            }
        }
    }

    let kind = kind
        .ok_or_else(|| ConfigError::MissingField(format!("kind for scheduler '{}'", name)))?;

    Ok(SchedulerConfig {
        name,
        builder_names,
        kind,
    })
}

fn parse_scheduler_kind(scheduler: &str, node: &KdlNode) -> ConfigResult<SchedulerKind> {
    let kind = get_first_string_arg(node).unwrap_or_default();

    match kind.as_str() {
        "single-branch" => {
            let stable_delay = get_int_prop(node, "stable-delay").unwrap_or(0);
            Ok(SchedulerKind::SingleBranch {
                branch: get_string_prop(node, "branch"),
                category: get_string_prop(node, "category"),
                stable_delay: Duration::from_secs(stable_delay.max(0) as u64),
            })
        }
        "periodic" => {
            let interval = get_int_prop(node, "interval").ok_or_else(|| {
                ConfigError::MissingField(format!("interval for scheduler '{}'", scheduler))
            })?;
            if interval <= 0 {
                return Err(ConfigError::InvalidValue {
                    field: "interval".to_string(),
                    message: "must be positive".to_string(),
                });
            }
            Ok(SchedulerKind::Periodic {
                interval: Duration::from_secs(interval as u64),
            })
        }
        "triggerable" => Ok(SchedulerKind::Triggerable),
        "force" | "manual" => Ok(SchedulerKind::Force),
        other => Err(ConfigError::InvalidValue {
            field: "scheduler kind".to_string(),
            message: format!("unknown kind: {}", other),
        }),
    }
}

fn parse_lock(node: &KdlNode) -> ConfigResult<LockConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("lock name".to_string()))?;

    let scope = match get_string_prop(node, "scope").as_deref() {
        Some("per-worker") => LockScope::PerWorker,
        Some("global") | None => LockScope::Global,
        Some(other) => {
            return Err(ConfigError::InvalidValue {
                field: "lock scope".to_string(),
                message: format!("unknown scope: {}", other),
            });
        }
    };

    let max_count = get_int_prop(node, "max-count").unwrap_or(1);
    if max_count < 1 {
        return Err(ConfigError::InvalidValue {
            field: "max-count".to_string(),
            message: format!("lock '{}' must allow at least one holder", name),
        });
    }

    Ok(LockConfig {
        name,
        scope,
        max_count: max_count as u32,
    })
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("worker name".to_string()))?;
    let password = get_string_prop(node, "password")
        .ok_or_else(|| ConfigError::MissingField(format!("password for worker '{}'", name)))?;
    Ok(WorkerConfig { name, password })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let kdl = r#"
            worker "local1" password="sekrit"

            builder "testy" {
                factory "quick"
                workers "local1"
            }

            scheduler "all" {
                kind "single-branch" branch="main" stable-delay=120
                builders "testy"
            }
        "#;

        let config = parse_master_config(kdl).unwrap();
        assert_eq!(config.builders.len(), 1);
        assert_eq!(config.builders[0].name, "testy");
        assert_eq!(config.builders[0].worker_names, vec!["local1"]);
        assert_eq!(config.schedulers.len(), 1);
        match &config.schedulers[0].kind {
            SchedulerKind::SingleBranch {
                branch,
                stable_delay,
                ..
            } => {
                assert_eq!(branch.as_deref(), Some("main"));
                assert_eq!(*stable_delay, Duration::from_secs(120));
            }
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_parse_locks_and_modes() {
        let kdl = r#"
            lock "compile" scope="per-worker" max-count=2
            lock "db" max-count=1

            worker "w1" password="x"

            builder "b1" {
                factory "f"
                workers "w1"
                lock "compile" mode="counting"
                lock "db"
            }
        "#;

        let config = parse_master_config(kdl).unwrap();
        assert_eq!(config.locks.len(), 2);
        assert_eq!(config.locks[0].scope, LockScope::PerWorker);
        assert_eq!(config.locks[0].max_count, 2);
        assert_eq!(config.locks[1].scope, LockScope::Global);
        let builder = &config.builders[0];
        assert_eq!(builder.locks[0].mode, LockMode::Counting);
        assert_eq!(builder.locks[1].mode, LockMode::Exclusive);
    }

    #[test]
    fn test_missing_factory_rejected() {
        let kdl = r#"
            builder "nofactory" {
                workers "w1"
            }
        "#;
        let result = parse_master_config(kdl);
        assert!(matches!(result.unwrap_err(), ConfigError::MissingField(_)));
    }

    #[test]
    fn test_unknown_scheduler_kind_rejected() {
        let kdl = r#"
            scheduler "weird" {
                kind "lunar"
                builders "b"
            }
        "#;
        let result = parse_master_config(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_zero_capacity_lock_rejected() {
        let kdl = r#"lock "bad" max-count=0"#;
        let result = parse_master_config(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_periodic_scheduler() {
        let kdl = r#"
            scheduler "nightly" {
                kind "periodic" interval=3600
                builders "full"
            }
        "#;
        let config = parse_master_config(kdl).unwrap();
        match &config.schedulers[0].kind {
            SchedulerKind::Periodic { interval } => {
                assert_eq!(*interval, Duration::from_secs(3600));
            }
            other => panic!("wrong kind: {:?}", other),
        }
    }
}
