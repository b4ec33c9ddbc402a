//! Service configuration
//!
//! Loaded once at startup from, in increasing priority:
//! 1. built-in defaults
//! 2. the YAML file (`config/dnp3srv.yaml` unless `--config` says otherwise)
//! 3. `DNP3SRV_` environment variables, nested with `__`
//!    (e.g. `DNP3SRV_MQTT__HOST=broker.local`)
//!
//! [`BridgeSettings::validate`] turns the raw settings into a [`BridgeConfig`],
//! the immutable configuration every component is built from.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use super::control::{ControlBinding, ControlKind, ControlMap};
use super::discovery::{self, DiscoverySettings};
use super::limiter::{PlantLimits, SafetyLimiter};
use super::modes::{ConstraintModes, ModeSettings};
use super::points::PointKind;
use super::telemetry::{TelemetryBinding, TelemetryMap};
use crate::error::{BridgeError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config/dnp3srv.yaml";
pub const ENV_PREFIX: &str = "DNP3SRV_";
pub const SERVICE_NAME: &str = "dnp3srv";

// ============================================================================
// Raw settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutstationSettings {
    /// Outstation link address
    pub address: u16,
    /// Link address of the SCADA master
    pub master_address: u16,
    pub listen_ip: String,
    pub listen_port: u16,
    pub event_buffer_size: usize,
}

impl Default for OutstationSettings {
    fn default() -> Self {
        Self {
            address: 101,
            master_address: 100,
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 20000,
            event_buffer_size: 20,
        }
    }
}

impl OutstationSettings {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.listen_ip.parse().map_err(|e| {
            BridgeError::config(format!("invalid listen_ip '{}': {}", self.listen_ip, e))
        })?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub base_topic: String,
    pub client_id: String,
    /// 0, 1 or 2
    pub qos: u8,
    pub keep_alive_secs: u64,
    /// Channel capacity between the client handle and its event loop
    pub request_capacity: usize,
    /// Pause before polling again after a connection error
    pub reconnect_delay_ms: u64,
    pub discovery: DiscoverySettings,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1884,
            username: None,
            password: None,
            base_topic: "scada".to_string(),
            client_id: SERVICE_NAME.to_string(),
            qos: 1,
            keep_alive_secs: 30,
            request_capacity: 64,
            reconnect_delay_ms: 5000,
            discovery: DiscoverySettings::default(),
        }
    }
}

impl MqttSettings {
    pub fn availability_topic(&self) -> String {
        format!("{}/availability", self.base_topic)
    }

    pub fn state_topic(&self, name: &str) -> String {
        format!("{}/{}/state", self.base_topic, name)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlBindingSettings {
    #[serde(default)]
    pub name: Option<String>,
    pub point_index: u16,
    /// Defaults to `point_index`
    #[serde(default)]
    pub output_index: Option<u16>,
    pub kind: ControlKind,
    #[serde(default)]
    pub targets: Vec<String>,
    /// Raw actuator units per engineering unit
    #[serde(default = "default_control_scale")]
    pub scale: f64,
}

fn default_control_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub generation_max_active_power_kw: f64,
    pub rated_total_nominal_active_power_kw: f64,
    pub ramp_step_kw: f64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            generation_max_active_power_kw: 125.0,
            rated_total_nominal_active_power_kw: 125.0,
            ramp_step_kw: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub debug: bool,
    /// Log file directory; `DNP3SRV_LOG_DIR` wins if set
    pub dir: Option<String>,
    /// Write the daily log file in addition to the console
    pub file: bool,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            debug: false,
            dir: None,
            file: true,
            json: false,
        }
    }
}

/// Everything read from file and environment, before validation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub outstation: OutstationSettings,
    pub mqtt: MqttSettings,
    pub telemetry: Vec<TelemetryBinding>,
    pub controls: Vec<ControlBindingSettings>,
    pub limits: LimitSettings,
    pub modes: ModeSettings,
    pub logging: LoggingSettings,
}

impl BridgeSettings {
    /// Merge defaults, the YAML file and the environment
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BridgeError::config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        Self::figment(path).extract().map_err(BridgeError::from)
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(self) -> Result<BridgeConfig> {
        let outstation = self.outstation;
        if outstation.event_buffer_size == 0 {
            return Err(BridgeError::config("event_buffer_size must be at least 1"));
        }
        if outstation.address == outstation.master_address {
            return Err(BridgeError::config(format!(
                "outstation and master share link address {}",
                outstation.address
            )));
        }
        outstation.listen_addr()?;

        let mqtt = self.mqtt;
        if mqtt.host.trim().is_empty() {
            return Err(BridgeError::config("mqtt.host must not be empty"));
        }
        if mqtt.qos > 2 {
            return Err(BridgeError::config(format!("mqtt.qos {} is not 0, 1 or 2", mqtt.qos)));
        }
        if mqtt.username.is_some() != mqtt.password.is_some() {
            return Err(BridgeError::config(
                "mqtt.username and mqtt.password must be set together",
            ));
        }
        if mqtt.keep_alive_secs < 5 {
            return Err(BridgeError::config(format!(
                "mqtt.keep_alive_secs {} is below 5",
                mqtt.keep_alive_secs
            )));
        }
        if mqtt.request_capacity == 0 {
            return Err(BridgeError::config("mqtt.request_capacity must be at least 1"));
        }
        if mqtt.discovery.enabled
            && (mqtt.discovery.prefix.trim().is_empty() || mqtt.discovery.node_id.trim().is_empty())
        {
            return Err(BridgeError::config(
                "mqtt.discovery.prefix and mqtt.discovery.node_id must not be empty",
            ));
        }

        let limits = PlantLimits::new(
            self.limits.generation_max_active_power_kw,
            self.limits.rated_total_nominal_active_power_kw,
        )
        .map_err(|_| BridgeError::InvalidLimits {
            max_kw: self.limits.generation_max_active_power_kw,
            rated_kw: self.limits.rated_total_nominal_active_power_kw,
            ramp_step_kw: self.limits.ramp_step_kw,
        })?;
        SafetyLimiter::new(limits, self.limits.ramp_step_kw)?;

        TelemetryMap::bind(&self.telemetry)?;

        let controls: Vec<ControlBinding> = self
            .controls
            .into_iter()
            .map(|c| ControlBinding {
                state_topic: c.name.as_deref().map(|name| mqtt.state_topic(name)),
                name: c.name,
                point_index: c.point_index,
                output_index: c.output_index.unwrap_or(c.point_index),
                kind: c.kind,
                targets: c.targets,
                scale: c.scale,
            })
            .collect();
        let control_map = ControlMap::bind(&controls)?;

        // Accepted setpoints are echoed into analog output status points
        for index in control_map.point_indexes() {
            if self
                .telemetry
                .iter()
                .any(|t| t.point_kind == PointKind::AnalogOutputStatus && t.point_index == index)
            {
                return Err(BridgeError::DuplicatePoint {
                    kind: PointKind::AnalogOutputStatus,
                    index,
                });
            }
        }

        let modes = ConstraintModes::from_settings(&self.modes, &mqtt)?;
        if let Some(modes) = &modes {
            for key in modes.keys() {
                if self.telemetry.iter().any(|t| t.key() == key) {
                    return Err(BridgeError::DuplicatePoint {
                        kind: key.kind,
                        index: key.index,
                    });
                }
            }
        }

        let config = BridgeConfig {
            outstation,
            mqtt,
            telemetry: self.telemetry,
            controls,
            limits,
            ramp_step_kw: self.limits.ramp_step_kw,
            modes,
            logging: self.logging,
        };
        discovery::entities(&config)?;
        Ok(config)
    }
}

// ============================================================================
// Validated configuration
// ============================================================================

/// Immutable, validated configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub outstation: OutstationSettings,
    pub mqtt: MqttSettings,
    pub telemetry: Vec<TelemetryBinding>,
    pub controls: Vec<ControlBinding>,
    pub limits: PlantLimits,
    pub ramp_step_kw: f64,
    /// Constraint mode indications, unless disabled
    pub modes: Option<ConstraintModes>,
    pub logging: LoggingSettings,
}

impl BridgeConfig {
    /// Load and validate in one step
    pub fn load(path: &Path) -> Result<Self> {
        BridgeSettings::load(path)?.validate()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::points::PointKey;
    use std::io::Write;

    const SAMPLE: &str = r#"
outstation:
  address: 10
  listen_port: 20001
mqtt:
  host: broker.local
  username: bridge
  password: secret
  base_topic: site
telemetry:
  - topic: modbus/SungrowLogger/total_active_power/state
    point_index: 0
  - topic: meter/grid_reactive_power/state
    point_index: 1
    scale: 0.001
controls:
  - name: export_limit
    point_index: 1
    kind: setpoint_absolute
    targets:
      - SG1/power_limitation_setting/set
      - SG2/power_limitation_setting/set
    scale: 1000
  - point_index: 1
    output_index: 2
    kind: ramp_up
    targets: [SG1/power_limitation_setting/set]
limits:
  generation_max_active_power_kw: 375
  rated_total_nominal_active_power_kw: 400
  ramp_step_kw: 10
modes:
  production_constraint_index: 4
  power_gradient_constraint_index: 5
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_and_validate() {
        let file = write_config(SAMPLE);
        let config = BridgeConfig::load(file.path()).unwrap();

        assert_eq!(config.outstation.address, 10);
        assert_eq!(config.outstation.master_address, 100);
        assert_eq!(config.outstation.listen_port, 20001);
        assert_eq!(config.outstation.event_buffer_size, 20);
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.telemetry.len(), 2);
        assert_eq!(config.telemetry[0].point_kind, PointKind::AnalogInput);
        assert_eq!(config.telemetry[1].scale, 0.001);

        assert_eq!(config.controls.len(), 2);
        let absolute = &config.controls[0];
        assert_eq!(absolute.output_index, 1);
        assert_eq!(absolute.scale, 1000.0);
        assert_eq!(
            absolute.state_topic.as_deref(),
            Some("site/export_limit/state")
        );
        assert_eq!(config.controls[1].output_index, 2);
        assert_eq!(config.controls[1].state_topic, None);

        assert_eq!(config.limits.max_active_power_kw, 375.0);
        assert_eq!(config.ramp_step_kw, 10.0);

        let modes = config.modes.unwrap();
        assert_eq!(modes.production.key, PointKey::new(PointKind::BinaryInput, 4));
        assert_eq!(modes.gradient.key, PointKey::new(PointKind::BinaryInput, 5));
        assert_eq!(
            modes.production.state_topic,
            "site/production_constraint_mode/state"
        );
        assert!(config.mqtt.discovery.enabled);
        assert_eq!(config.mqtt.discovery.prefix, "homeassistant");
    }

    #[test]
    fn test_shipped_config_validates() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.telemetry.len(), 3);
        assert_eq!(config.controls.len(), 3);
        // 3 telemetry sensors, 1 named control, 2 mode indications
        assert_eq!(discovery::announcements(&config).unwrap().len(), 6);
    }

    #[test]
    fn test_missing_file() {
        let err = BridgeSettings::load(Path::new("/nonexistent/dnp3srv.yaml")).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_defaults_validate() {
        let config = BridgeSettings::default().validate().unwrap();
        assert_eq!(config.outstation.address, 101);
        assert_eq!(config.mqtt.availability_topic(), "scada/availability");
        assert!(config.telemetry.is_empty());
        assert!(config.modes.is_some());
    }

    #[test]
    fn test_duplicate_topic_rejected() {
        let file = write_config(
            r#"
telemetry:
  - topic: a/b
    point_index: 0
  - topic: a/b
    point_index: 1
"#,
        );
        let err = BridgeConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateTopic(_)));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let mut settings = BridgeSettings::default();
        settings.limits.generation_max_active_power_kw = 500.0;
        settings.limits.rated_total_nominal_active_power_kw = 400.0;
        assert!(matches!(
            settings.validate(),
            Err(BridgeError::InvalidLimits { .. })
        ));

        let mut settings = BridgeSettings::default();
        settings.limits.ramp_step_kw = 0.0;
        assert!(matches!(
            settings.validate(),
            Err(BridgeError::InvalidLimits { .. })
        ));
    }

    #[test]
    fn test_zero_control_scale_rejected() {
        let mut settings = BridgeSettings::default();
        settings.controls.push(ControlBindingSettings {
            name: None,
            point_index: 0,
            output_index: None,
            kind: ControlKind::SetpointAbsolute,
            targets: vec!["inv/set".to_string()],
            scale: 0.0,
        });
        assert!(matches!(
            settings.validate(),
            Err(BridgeError::DivisionByZero(_))
        ));
    }

    #[test]
    fn test_credentials_must_pair() {
        let mut settings = BridgeSettings::default();
        settings.mqtt.username = Some("bridge".to_string());
        assert!(matches!(settings.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_bad_listen_ip() {
        let mut settings = BridgeSettings::default();
        settings.outstation.listen_ip = "not-an-ip".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_mode_point_collides_with_telemetry() {
        let file = write_config(
            r#"
telemetry:
  - topic: plant/breaker/state
    point_index: 1
    point_kind: binary_input
"#,
        );
        let err = BridgeConfig::load(file.path()).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::DuplicatePoint {
                kind: PointKind::BinaryInput,
                index: 1
            }
        ));

        let file = write_config(
            r#"
telemetry:
  - topic: plant/breaker/state
    point_index: 1
    point_kind: binary_input
modes:
  enabled: false
"#,
        );
        let config = BridgeConfig::load(file.path()).unwrap();
        assert!(config.modes.is_none());
    }

    #[test]
    fn test_empty_discovery_prefix_rejected() {
        let mut settings = BridgeSettings::default();
        settings.mqtt.discovery.prefix = " ".to_string();
        assert!(matches!(settings.validate(), Err(BridgeError::Config(_))));

        let mut settings = BridgeSettings::default();
        settings.mqtt.discovery.enabled = false;
        settings.mqtt.discovery.prefix = String::new();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_short_keep_alive_rejected() {
        let mut settings = BridgeSettings::default();
        settings.mqtt.keep_alive_secs = 2;
        assert!(matches!(settings.validate(), Err(BridgeError::Config(_))));
    }
}
