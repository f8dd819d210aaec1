use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ElasticError, Result};
use crate::executor::schedule::parse_cron;
use crate::sharding::strategy::ShardingStrategyType;

/// Job configuration, stored as JSON under `/{job}/config`.
///
/// The registry copy is authoritative once persisted: a local copy only
/// replaces it when `overwrite` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub job_name: String,
    /// Quartz-style cron expression with a seconds field (`0/5 * * * * ?`).
    pub cron: String,
    pub sharding_total_count: u32,
    /// `item=parameter` pairs separated by commas, e.g. `0=Beijing,1=Shanghai`.
    #[serde(default)]
    pub sharding_item_parameters: String,
    #[serde(default)]
    pub job_parameter: String,
    #[serde(default = "default_true")]
    pub monitor_execution: bool,
    #[serde(default)]
    pub failover: bool,
    #[serde(default = "default_true")]
    pub misfire: bool,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_minutes: u32,
    #[serde(default)]
    pub static_sharding: bool,
    #[serde(default = "default_strategy")]
    pub job_sharding_strategy_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_reconcile_interval() -> u32 {
    10
}

fn default_strategy() -> String {
    ShardingStrategyType::AverageAllocation.as_str().to_string()
}

impl JobConfig {
    pub fn new(job_name: impl Into<String>, cron: impl Into<String>, sharding_total_count: u32) -> Self {
        Self {
            job_name: job_name.into(),
            cron: cron.into(),
            sharding_total_count,
            sharding_item_parameters: String::new(),
            job_parameter: String::new(),
            monitor_execution: true,
            failover: false,
            misfire: true,
            reconcile_interval_minutes: default_reconcile_interval(),
            static_sharding: false,
            job_sharding_strategy_type: default_strategy(),
            description: String::new(),
            disabled: false,
            overwrite: false,
            props: BTreeMap::new(),
        }
    }

    pub fn with_sharding_item_parameters(mut self, parameters: impl Into<String>) -> Self {
        self.sharding_item_parameters = parameters.into();
        self
    }

    pub fn with_job_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.job_parameter = parameter.into();
        self
    }

    pub fn with_failover(mut self, failover: bool) -> Self {
        self.failover = failover;
        self
    }

    pub fn with_monitor_execution(mut self, monitor_execution: bool) -> Self {
        self.monitor_execution = monitor_execution;
        self
    }

    pub fn with_misfire(mut self, misfire: bool) -> Self {
        self.misfire = misfire;
        self
    }

    pub fn with_reconcile_interval_minutes(mut self, minutes: u32) -> Self {
        self.reconcile_interval_minutes = minutes;
        self
    }

    pub fn with_static_sharding(mut self, static_sharding: bool) -> Self {
        self.static_sharding = static_sharding;
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.job_sharding_strategy_type = strategy.into();
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Check the configuration before anything touches the registry.
    pub fn validate(&self) -> Result<()> {
        if self.job_name.trim().is_empty() {
            return Err(ElasticError::InvalidConfig("jobName can not be empty".to_string()));
        }
        if self.job_name.contains('/') {
            return Err(ElasticError::InvalidConfig(format!(
                "jobName '{}' can not contain '/'",
                self.job_name
            )));
        }
        if self.sharding_total_count == 0 {
            return Err(ElasticError::InvalidConfig(
                "shardingTotalCount should larger than zero".to_string(),
            ));
        }
        parse_cron(&self.cron)?;
        self.sharding_strategy_type()?;
        self.item_parameters()?;
        Ok(())
    }

    pub fn sharding_strategy_type(&self) -> Result<ShardingStrategyType> {
        self.job_sharding_strategy_type.parse()
    }

    /// Failover only applies while execution is monitored.
    pub fn is_failover_enabled(&self) -> bool {
        self.failover && self.monitor_execution
    }

    /// Parse `sharding_item_parameters` into an item → parameter map.
    pub fn item_parameters(&self) -> Result<BTreeMap<u32, String>> {
        let mut result = BTreeMap::new();
        let raw = self.sharding_item_parameters.trim();
        if raw.is_empty() {
            return Ok(result);
        }
        for pair in raw.split(',') {
            let (item, parameter) = pair.split_once('=').ok_or_else(|| {
                ElasticError::InvalidConfig(format!(
                    "sharding item parameters '{}' format error, should be int=xx,int=xx",
                    self.sharding_item_parameters
                ))
            })?;
            let item: u32 = item.trim().parse().map_err(|_| {
                ElasticError::InvalidConfig(format!(
                    "sharding item parameters key '{}' is not an integer",
                    item.trim()
                ))
            })?;
            result.insert(item, parameter.trim().to_string());
        }
        Ok(result)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Parse and validate in one go.
    pub fn from_valid_json(data: &str) -> Result<Self> {
        let config = Self::from_json(data)?;
        config.validate()?;
        Ok(config)
    }
}

/// Process-wide timing knobs for the coordination services.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Host address published under `/servers`; detected when unset.
    pub host_ip: Option<String>,
    /// Labels attached to this process's job instances.
    pub labels: Vec<String>,
    /// Base sleep between polls while waiting for a leader.
    pub election_poll_interval: Duration,
    /// Sleep between polls while waiting for sharding or running items to finish.
    pub sharding_poll_interval: Duration,
    /// Fixed delay between reconcile iterations.
    pub reconcile_tick: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host_ip: None,
            labels: Vec::new(),
            election_poll_interval: Duration::from_millis(100),
            sharding_poll_interval: Duration::from_millis(100),
            reconcile_tick: Duration::from_secs(60),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_host_ip(mut self, ip: impl Into<String>) -> Self {
        self.host_ip = Some(ip.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.election_poll_interval = interval;
        self.sharding_poll_interval = interval;
        self
    }

    pub fn with_reconcile_tick(mut self, tick: Duration) -> Self {
        self.reconcile_tick = tick;
        self
    }
}

/// Connection settings for the etcd registry center.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Etcd endpoints (env: ETCD_ENDPOINTS, comma-separated)
    pub endpoints: Vec<String>,
    /// Key prefix every job path is placed under (env: ELASTIC_NAMESPACE)
    pub namespace: String,
    /// Session lease TTL in seconds; ephemeral nodes vanish this long after a crash
    pub session_ttl: i64,
    /// Interval for lease keep-alive (1/3 of TTL recommended)
    pub keepalive_interval: Duration,
    /// Delay before re-granting a session after the lease was lost
    pub reconnect_delay: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_max_elapsed: Duration,
    pub backoff_multiplier: f64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            namespace: "elastic-lite".to_string(),
            session_ttl: 15,
            keepalive_interval: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(2),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            backoff_max_elapsed: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl EtcdConfig {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") {
            config.endpoints = endpoints.split(',').map(String::from).collect();
        }

        if let Ok(namespace) = std::env::var("ELASTIC_NAMESPACE") {
            config.namespace = namespace;
        }

        if let Ok(ttl) = std::env::var("ELASTIC_SESSION_TTL") {
            if let Ok(parsed) = ttl.parse::<i64>() {
                config.session_ttl = parsed;
                config.keepalive_interval = Duration::from_secs((parsed / 3).max(1) as u64);
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_config_new_uses_defaults() {
        let cfg = JobConfig::new("order-sync", "0/5 * * * * ?", 3);
        assert_eq!(cfg.job_name, "order-sync");
        assert_eq!(cfg.sharding_total_count, 3);
        assert!(cfg.monitor_execution);
        assert!(cfg.misfire);
        assert!(!cfg.failover);
        assert!(!cfg.static_sharding);
        assert!(!cfg.overwrite);
        assert_eq!(cfg.reconcile_interval_minutes, 10);
        assert_eq!(cfg.job_sharding_strategy_type, "AVG_ALLOCATION");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn job_config_rejects_zero_sharding_total_count() {
        let cfg = JobConfig::new("order-sync", "0/5 * * * * ?", 0);
        assert!(matches!(cfg.validate(), Err(ElasticError::InvalidConfig(_))));
    }

    #[test]
    fn job_config_rejects_negative_sharding_total_count_in_json() {
        let json = r#"{"jobName":"a","cron":"0/5 * * * * ?","shardingTotalCount":-1}"#;
        assert!(JobConfig::from_json(json).is_err());
    }

    #[test]
    fn job_config_rejects_empty_job_name() {
        let cfg = JobConfig::new("  ", "0/5 * * * * ?", 1);
        assert!(matches!(cfg.validate(), Err(ElasticError::InvalidConfig(_))));
    }

    #[test]
    fn job_config_rejects_unknown_strategy() {
        let cfg = JobConfig::new("a", "0/5 * * * * ?", 1).with_strategy("RANDOM");
        assert!(matches!(
            cfg.validate(),
            Err(ElasticError::UnknownShardingStrategy(_))
        ));
    }

    #[test]
    fn job_config_rejects_bad_cron() {
        let cfg = JobConfig::new("a", "not a cron", 1);
        assert!(matches!(cfg.validate(), Err(ElasticError::InvalidCron { .. })));
    }

    #[test]
    fn job_config_parses_item_parameters() {
        let cfg = JobConfig::new("a", "0/5 * * * * ?", 3)
            .with_sharding_item_parameters("0=Beijing, 1=Shanghai,2=Guangzhou");
        let params = cfg.item_parameters().unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params[&0], "Beijing");
        assert_eq!(params[&1], "Shanghai");
        assert_eq!(params[&2], "Guangzhou");
    }

    #[test]
    fn job_config_rejects_malformed_item_parameters() {
        let cfg = JobConfig::new("a", "0/5 * * * * ?", 3).with_sharding_item_parameters("0=A,B");
        assert!(cfg.validate().is_err());

        let cfg = JobConfig::new("a", "0/5 * * * * ?", 3).with_sharding_item_parameters("x=A");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn job_config_json_is_camel_case() {
        let cfg = JobConfig::new("a", "0/5 * * * * ?", 2).with_failover(true);
        let json = cfg.to_json().unwrap();
        assert!(json.contains("\"shardingTotalCount\":2"));
        assert!(json.contains("\"failover\":true"));
        assert!(json.contains("\"jobShardingStrategyType\":\"AVG_ALLOCATION\""));
        assert_eq!(JobConfig::from_json(&json).unwrap(), cfg);
    }

    #[test]
    fn job_config_json_fills_missing_fields_with_defaults() {
        let json = r#"{"jobName":"a","cron":"0/5 * * * * ?","shardingTotalCount":4}"#;
        let cfg = JobConfig::from_json(json).unwrap();
        assert!(cfg.monitor_execution);
        assert!(cfg.misfire);
        assert_eq!(cfg.reconcile_interval_minutes, 10);
        assert_eq!(cfg.job_sharding_strategy_type, "AVG_ALLOCATION");
    }

    #[test]
    fn failover_requires_monitor_execution() {
        let cfg = JobConfig::new("a", "0/5 * * * * ?", 2).with_failover(true);
        assert!(cfg.is_failover_enabled());
        let cfg = cfg.with_monitor_execution(false);
        assert!(!cfg.is_failover_enabled());
    }

    #[test]
    fn coordinator_config_default() {
        let cfg = CoordinatorConfig::default();
        assert!(cfg.host_ip.is_none());
        assert!(cfg.labels.is_empty());
        assert_eq!(cfg.election_poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.reconcile_tick, Duration::from_secs(60));
    }

    #[test]
    fn coordinator_config_builders() {
        let cfg = CoordinatorConfig::default()
            .with_host_ip("10.0.0.1")
            .with_label("zone-a")
            .with_poll_interval(Duration::from_millis(10));
        assert_eq!(cfg.host_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(cfg.labels, vec!["zone-a".to_string()]);
        assert_eq!(cfg.election_poll_interval, Duration::from_millis(10));
        assert_eq!(cfg.sharding_poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn etcd_config_default() {
        let cfg = EtcdConfig::default();
        assert_eq!(cfg.endpoints, vec!["http://127.0.0.1:2379".to_string()]);
        assert_eq!(cfg.namespace, "elastic-lite");
        assert_eq!(cfg.session_ttl, 15);
        assert_eq!(cfg.keepalive_interval, Duration::from_secs(5));
    }
}
