use config::{Config, ConfigError, Environment, File};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use a2b_core::{A2bError, NodeAddr};
use a2b_sim::{BusScenario, NodeScript};
use tracing::warn;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BusctlConfig {
    /// Slave nodes on the simulated bus, addressed `0..nodes`.
    pub nodes: u8,
    #[serde(deserialize_with = "deserialize_nodes")]
    pub failing_init: Vec<i16>,
    #[serde(deserialize_with = "deserialize_nodes")]
    pub failing_deinit: Vec<i16>,
    #[serde(deserialize_with = "deserialize_nodes")]
    pub absent_nodes: Vec<i16>,
    pub reply_latency_ticks: u32,
    pub tick_multiple: u32,
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    pub max_ticks: u64,
}

fn deserialize_nodes<'de, D>(deserializer: D) -> Result<Vec<i16>, D::Error>
where
    D: Deserializer<'de>,
{
    struct NodeListVisitor;

    impl<'de> Visitor<'de> for NodeListVisitor {
        type Value = Vec<i16>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a node address, a list of them, or a comma separated string")
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            i16::try_from(value)
                .map(|node| vec![node])
                .map_err(|_| E::custom(format!("node address {value} out of range")))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            i16::try_from(value)
                .map(|node| vec![node])
                .map_err(|_| E::custom(format!("node address {value} out of range")))
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value
                .split(|c| c == ',' || c == ';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<i16>().map_err(E::custom))
                .collect()
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut nodes = Vec::new();
            while let Some(node) = seq.next_element()? {
                nodes.push(node);
            }
            Ok(nodes)
        }
    }

    deserializer.deserialize_any(NodeListVisitor)
}

impl BusctlConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("nodes", 4)?
            .set_default("failing_init", Vec::<i64>::new())?
            .set_default("failing_deinit", Vec::<i64>::new())?
            .set_default("absent_nodes", Vec::<i64>::new())?
            .set_default("reply_latency_ticks", 0)?
            .set_default("tick_multiple", 1)?
            .set_default("tick_interval", "1ms")?
            .set_default("max_ticks", 10_000)?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix("A2B_BUSCTL").try_parsing(true));

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes == 0 {
            return Err(ConfigError::Message("nodes must be at least 1".into()));
        }
        if self.tick_multiple == 0 {
            return Err(ConfigError::Message("tick_multiple must be at least 1".into()));
        }
        Ok(())
    }

    /// Bus layout described by this configuration.
    pub fn scenario(&self) -> BusScenario {
        let mut scenario = BusScenario::healthy_chain(self.nodes);
        scenario.stack.tick_multiple = self.tick_multiple;
        for script in scenario.nodes.values_mut() {
            *script = NodeScript::default().with_latency(self.reply_latency_ticks);
        }
        for &node in &self.failing_init {
            match scenario.nodes.get_mut(&NodeAddr(node)) {
                Some(script) => script.init = Err(A2bError::ResourceUnavailable),
                None => warn!(node, "failing_init names a node outside the bus"),
            }
        }
        for &node in &self.failing_deinit {
            match scenario.nodes.get_mut(&NodeAddr(node)) {
                Some(script) => script.deinit = Err(A2bError::ResourceUnavailable),
                None => warn!(node, "failing_deinit names a node outside the bus"),
            }
        }
        for &node in &self.absent_nodes {
            scenario.nodes.remove(&NodeAddr(node));
        }
        scenario
    }
}
