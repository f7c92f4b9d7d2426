//! Config 单元测试
//!
//! 测试默认值、TOML 读写以及环境变量覆盖

use std::collections::HashMap;

use crate::runtime::scheduler::{ExecutionMode, DEFAULT_STACK_SIZE};
use crate::util::config::{
    ConfigError, ModeSetting, PolicySetting, RuntimeConfig,
};
use crate::util::logger::LogLevel;

fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[cfg(test)]
mod default_tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.cluster.nodes, 2);
        assert_eq!(config.cluster.max_long_request, 64 * 1024);
        assert_eq!(config.scheduler.wait_spins, 100);
        assert_eq!(config.scheduler.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.scheduler.policy, PolicySetting::WorkStealing);
        assert_eq!(config.log.level, LogLevel::Info);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_conversion() {
        let mut config = RuntimeConfig::default();
        config.scheduler.workers = Some(0);
        config.scheduler.mode = ModeSetting::Inline;
        config.scheduler.policy = PolicySetting::Fifo;
        config.cluster.max_medium = 512;

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.num_workers, 1);
        assert_eq!(scheduler.mode, ExecutionMode::Inline);
        assert!(!scheduler.use_work_stealing);

        let cluster = config.cluster_config();
        assert_eq!(cluster.limits.max_medium, 512);
        assert_eq!(cluster.hostname, "localhost");
    }
}

#[cfg(test)]
mod file_tests {
    use super::*;

    #[test]
    fn test_partial_document() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [cluster]
            nodes = 4

            [scheduler]
            mode = "inline"
            policy = "fifo"

            [log]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster.nodes, 4);
        assert_eq!(config.cluster.segment_len, 1024 * 1024);
        assert_eq!(config.scheduler.mode, ModeSetting::Inline);
        assert_eq!(config.scheduler.policy, PolicySetting::Fifo);
        assert_eq!(config.log.level, LogLevel::Debug);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = RuntimeConfig::default();
        config.cluster.hostname = "head-node".to_string();
        config.scheduler.workers = Some(3);

        config.save(&path).unwrap();
        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(RuntimeConfig::load_or_default(Some(&path)).unwrap(), config);
    }

    #[test]
    fn test_bad_documents() {
        assert!(matches!(
            RuntimeConfig::from_toml_str("[cluster]\nnodes = \"many\""),
            Err(ConfigError::Parse(_))
        ));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RuntimeConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}

#[cfg(test)]
mod env_tests {
    use super::*;

    #[test]
    fn test_overrides() {
        let mut config = RuntimeConfig::default();
        config
            .apply_overrides(lookup(&[
                ("NODES", "8"),
                ("WORKERS", " 2 "),
                ("POLICY", "fifo"),
                ("LOG", "warn"),
                ("HOSTNAME", "n0"),
            ]))
            .unwrap();
        assert_eq!(config.cluster.nodes, 8);
        assert_eq!(config.scheduler.workers, Some(2));
        assert_eq!(config.scheduler.policy, PolicySetting::Fifo);
        assert_eq!(config.log.level, LogLevel::Warn);
        assert_eq!(config.cluster.hostname, "n0");
    }

    #[test]
    fn test_invalid_override() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_overrides(lookup(&[("NODES", "lots")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value } => {
                assert_eq!(key, "NODEFLOW_NODES");
                assert_eq!(value, "lots");
            },
            other => panic!("unexpected error: {}", other),
        }
        assert!(config.apply_overrides(lookup(&[("MODE", "threads")])).is_err());
    }
}
