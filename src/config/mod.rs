//! # Configuration
//!
//! TOML configuration for a tree node and for the built-in simulation.
//!
//! ```toml
//! [node]
//! identity_db = "./data/identity"
//! # hid = 12
//! # bit_index = 1
//!
//! [io]
//! input_pins = [7, 6, 5]
//! output_pins = [4, 3, 2]
//! pins_per_channel = 3
//! output_source = "inputs"
//! policy = "and"
//! report_rate_limit_ms = 50
//! auto_report = false
//! auto_report_interval_ms = 5000
//!
//! [aggregation]
//! max_devices = 64
//!
//! [logging]
//! level = "info"
//! file = "treemesh.log"
//! security_file = "treemesh-security.log"
//!
//! [simulation]
//! duration_ms = 2000
//!
//! [[simulation.nodes]]
//! hid = 1
//! bit_index = 0
//! ```
//!
//! Every section except `[node]` may be omitted and falls back to defaults.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::io::device::{OutputSource, PinLayout, DEFAULT_PINS_PER_CHANNEL, MAX_INPUT_PINS, MAX_OUTPUT_PINS};
use crate::io::policy;
use crate::node::NodeSettings;
use crate::tree::aggregate::DEFAULT_MAX_DEVICES;
use crate::tree::hid::Hid;
use crate::tree::identity::is_valid_bit_index;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Sled directory holding the persisted HID and bit index.
    pub identity_db: String,
    /// Applied to the store at start when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hid: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_index: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    #[serde(default = "default_input_pins")]
    pub input_pins: Vec<u8>,
    #[serde(default = "default_output_pins")]
    pub output_pins: Vec<u8>,
    #[serde(default = "default_pins_per_channel")]
    pub pins_per_channel: usize,
    #[serde(default)]
    pub output_source: OutputSource,
    /// Name of the root's output policy: "and" or "mirror".
    #[serde(default = "default_policy")]
    pub policy: String,
    #[serde(default = "default_report_rate_limit_ms")]
    pub report_rate_limit_ms: u64,
    #[serde(default)]
    pub auto_report: bool,
    #[serde(default = "default_auto_report_interval_ms")]
    pub auto_report_interval_ms: u64,
}

fn default_input_pins() -> Vec<u8> {
    vec![7, 6, 5]
}

fn default_output_pins() -> Vec<u8> {
    vec![4, 3, 2]
}

fn default_pins_per_channel() -> usize {
    DEFAULT_PINS_PER_CHANNEL
}

fn default_policy() -> String {
    "and".to_string()
}

fn default_report_rate_limit_ms() -> u64 {
    50
}

fn default_auto_report_interval_ms() -> u64 {
    5000
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            input_pins: default_input_pins(),
            output_pins: default_output_pins(),
            pins_per_channel: default_pins_per_channel(),
            output_source: OutputSource::default(),
            policy: default_policy(),
            report_rate_limit_ms: default_report_rate_limit_ms(),
            auto_report: false,
            auto_report_interval_ms: default_auto_report_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    pub max_devices: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_devices: DEFAULT_MAX_DEVICES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    #[serde(default)]
    pub security_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            security_file: None,
        }
    }
}

/// A scripted change of a simulated node's inputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputEvent {
    pub at_ms: u64,
    pub inputs: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimNodeConfig {
    pub hid: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_index: Option<u8>,
    #[serde(default)]
    pub events: Vec<InputEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Per-listener frame loss probability on the simulated air.
    #[serde(default)]
    pub loss: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub nodes: Vec<SimNodeConfig>,
}

fn default_duration_ms() -> u64 {
    2000
}

fn default_seed() -> u64 {
    1
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let node = |hid: u16, bit: u8, events: Vec<InputEvent>| SimNodeConfig {
            hid,
            bit_index: Some(bit),
            events,
        };
        Self {
            duration_ms: default_duration_ms(),
            loss: 0.0,
            seed: default_seed(),
            nodes: vec![
                node(1, 0, vec![InputEvent { at_ms: 300, inputs: 0b001 }]),
                node(12, 1, vec![InputEvent { at_ms: 500, inputs: 0b001 }]),
                node(13, 2, vec![]),
                node(
                    121,
                    5,
                    vec![
                        InputEvent { at_ms: 700, inputs: 0b011 },
                        InputEvent { at_ms: 1200, inputs: 0b000 },
                    ],
                ),
            ],
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(hid) = self.node.hid {
            if Hid::new(hid).is_none() {
                return Err(anyhow!("node.hid {} is reserved", hid));
            }
        }
        if let Some(bit) = self.node.bit_index {
            if !is_valid_bit_index(bit) {
                return Err(anyhow!("node.bit_index {} is out of range 0-31", bit));
            }
        }
        if self.io.input_pins.len() > MAX_INPUT_PINS {
            return Err(anyhow!("at most {} input pins are supported", MAX_INPUT_PINS));
        }
        if self.io.output_pins.len() > MAX_OUTPUT_PINS {
            return Err(anyhow!("at most {} output pins are supported", MAX_OUTPUT_PINS));
        }
        if self.io.pins_per_channel == 0 {
            return Err(anyhow!("io.pins_per_channel must be at least 1"));
        }
        if policy::by_name(&self.io.policy).is_none() {
            return Err(anyhow!("unknown io.policy '{}'", self.io.policy));
        }
        if !(0.0..=1.0).contains(&self.simulation.loss) {
            return Err(anyhow!("simulation.loss must be between 0 and 1"));
        }
        for node in &self.simulation.nodes {
            if Hid::new(node.hid).is_none() {
                return Err(anyhow!("simulation node hid {} is reserved", node.hid));
            }
        }
        Ok(())
    }

    pub fn pin_layout(&self) -> PinLayout {
        PinLayout {
            input_pins: self.io.input_pins.clone(),
            output_pins: self.io.output_pins.clone(),
            pins_per_channel: self.io.pins_per_channel,
            source: self.io.output_source,
        }
    }

    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            layout: self.pin_layout(),
            report_rate_limit: Duration::from_millis(self.io.report_rate_limit_ms),
            auto_report: self.io.auto_report,
            auto_report_interval: Duration::from_millis(self.io.auto_report_interval_ms),
            max_devices: self.aggregation.max_devices,
            policy: self.io.policy.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node: NodeConfig {
                identity_db: "./data/identity".to_string(),
                hid: None,
                bit_index: None,
            },
            io: IoConfig::default(),
            aggregation: AggregationConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("treemesh.log".to_string()),
                security_file: Some("treemesh-security.log".to_string()),
            },
            simulation: SimulationConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.io.input_pins, vec![7, 6, 5]);
        assert_eq!(parsed.io.output_source, OutputSource::Inputs);
        assert_eq!(parsed.simulation.nodes.len(), 4);
        assert_eq!(parsed.simulation.nodes[3].events[0], InputEvent { at_ms: 700, inputs: 3 });
        parsed.validate().unwrap();
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [node]
            identity_db = "/tmp/id"
            hid = 12
            "#,
        )
        .unwrap();
        assert_eq!(config.node.hid, Some(12));
        assert_eq!(config.aggregation.max_devices, 64);
        let settings = config.node_settings();
        assert_eq!(settings.report_rate_limit, Duration::from_millis(50));
        assert_eq!(settings.auto_report_interval, Duration::from_secs(5));
        assert_eq!(settings.layout.pins_per_channel, 3);
        assert!(!settings.auto_report);
    }

    #[test]
    fn test_output_source_parses_lowercase() {
        let config: Config = toml::from_str(
            r#"
            [node]
            identity_db = "/tmp/id"
            [io]
            output_source = "outputs"
            policy = "mirror"
            "#,
        )
        .unwrap();
        assert_eq!(config.io.output_source, OutputSource::Outputs);
        assert_eq!(config.pin_layout().source, OutputSource::Outputs);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Config)>)> = vec![
            ("reserved hid", Box::new(|c: &mut Config| c.node.hid = Some(0))),
            ("broadcast hid", Box::new(|c: &mut Config| c.node.hid = Some(0xFFFF))),
            ("bit index", Box::new(|c: &mut Config| c.node.bit_index = Some(32))),
            ("pins", Box::new(|c: &mut Config| c.io.output_pins = (0..9).collect())),
            ("pins per channel", Box::new(|c: &mut Config| c.io.pins_per_channel = 0)),
            ("policy", Box::new(|c: &mut Config| c.io.policy = "xor".to_string())),
            ("loss", Box::new(|c: &mut Config| c.simulation.loss = 1.5)),
        ];
        for (name, mutate) in cases {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "expected '{}' to be rejected", name);
        }
    }

    #[tokio::test]
    async fn test_create_default_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.node.identity_db, "./data/identity");
        assert_eq!(loaded.logging.file.as_deref(), Some("treemesh.log"));
    }
}
