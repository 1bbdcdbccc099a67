//! Run configuration using Figment.
//!
//! Settings are read from a TOML or YAML document (chosen by file extension) and then
//! overridden by environment variables prefixed with `SAMPLE_FLOW_`. Nested keys are separated
//! by a double underscore:
//!
//! ```text
//! SAMPLE_FLOW_SAMPLE_STATE_FILE=/data/run-12/state.csv
//! SAMPLE_FLOW_WORKFLOW__IMAGING_TIMEOUT=45m
//! ```
//!
//! # Example
//!
//! ```toml
//! sample_state_file = "state.csv"
//! exp_job_ids = [2, 3, 4]
//!
//! [workflow]
//! gain_timeout = "5m"
//! imaging_timeout = "30m"
//! tracked_kinds = ["well", "field", "channel"]
//!
//! [well_layout]
//! x_fields = 2
//! y_fields = 3
//!
//! [[channels]]
//! channel = "green"
//! job_name = "green10x"
//! detector_num = 1
//! default_gain = 800
//! max_gain = 1000
//! ```

use crate::error::{FlowError, FlowResult};
use crate::sample::NodeKind;
use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SAMPLE_FLOW_";

/// Longest accepted workflow timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Top-level settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Declarative hierarchy file. Relative paths resolve against the configuration file.
    #[serde(default)]
    pub sample_state_file: Option<PathBuf>,
    /// Wells seeded when no state file is configured.
    #[serde(default)]
    pub plate_layout: Option<PlateLayout>,
    /// Timeouts and node tracking.
    #[serde(default)]
    pub workflow: WorkflowSettings,
    /// Per-channel gain policy.
    #[serde(default)]
    pub channels: Vec<ChannelGain>,
    /// Experiment job ids, used to derive the channel index of renamed images.
    #[serde(default)]
    pub exp_job_ids: Option<[u32; 3]>,
    /// Field grid of every well, used for gain-field coordinates.
    #[serde(default)]
    pub well_layout: Option<WellLayout>,
}

/// A full plate of wells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateLayout {
    /// Plate the wells are seeded into.
    #[serde(default = "default_plate_name")]
    pub plate_name: String,
    /// Wells along x.
    #[serde(default = "default_x_wells")]
    pub x_wells: u32,
    /// Wells along y.
    #[serde(default = "default_y_wells")]
    pub y_wells: u32,
}

impl Default for PlateLayout {
    fn default() -> Self {
        Self {
            plate_name: default_plate_name(),
            x_wells: default_x_wells(),
            y_wells: default_y_wells(),
        }
    }
}

/// Fields per well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WellLayout {
    /// Fields along x.
    pub x_fields: u32,
    /// Fields along y.
    pub y_fields: u32,
}

/// Workflow timers and node tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Deadline for `AwaitingGain`.
    #[serde(with = "humantime_serde", default = "default_gain_timeout")]
    pub gain_timeout: Duration,
    /// Deadline for `Imaging`.
    #[serde(with = "humantime_serde", default = "default_imaging_timeout")]
    pub imaging_timeout: Duration,
    /// Node kinds that run the workflow. Other kinds are hierarchy-only.
    #[serde(default = "default_tracked_kinds")]
    pub tracked_kinds: Vec<NodeKind>,
    /// Queue depth of each node mailbox and of the router.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            gain_timeout: default_gain_timeout(),
            imaging_timeout: default_imaging_timeout(),
            tracked_kinds: default_tracked_kinds(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl WorkflowSettings {
    /// Whether nodes of `kind` run the workflow.
    pub fn tracks(&self, kind: NodeKind) -> bool {
        self.tracked_kinds.contains(&kind)
    }
}

/// Gain policy of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelGain {
    /// Channel name, e.g. `green`.
    pub channel: String,
    /// Acquisition job the gain is applied to.
    pub job_name: String,
    /// Detector number on the instrument.
    pub detector_num: u32,
    /// Used when the estimator reports no gain.
    #[serde(default)]
    pub default_gain: Option<u32>,
    /// Upper bound applied to every gain.
    pub max_gain: u32,
}

fn default_plate_name() -> String {
    "00".to_string()
}

fn default_x_wells() -> u32 {
    12
}

fn default_y_wells() -> u32 {
    8
}

fn default_gain_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_imaging_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_tracked_kinds() -> Vec<NodeKind> {
    vec![NodeKind::Well, NodeKind::Field, NodeKind::Channel]
}

fn default_mailbox_capacity() -> usize {
    64
}

impl Settings {
    /// Loads settings from `path` with environment overrides, then validates them.
    pub fn load_from<P: AsRef<Path>>(path: P) -> FlowResult<Self> {
        let path = path.as_ref();
        let figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
            Some("toml") => Figment::new().merge(Toml::file(path)),
            other => {
                return Err(FlowError::Configuration(format!(
                    "unsupported configuration format {:?} for '{}'",
                    other.unwrap_or(""),
                    path.display()
                )))
            }
        };
        if !path.exists() {
            return Err(FlowError::Configuration(format!(
                "configuration file '{}' not found",
                path.display()
            )));
        }

        let mut settings: Settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        if let (Some(file), Some(dir)) = (settings.sample_state_file.as_ref(), path.parent()) {
            if file.is_relative() {
                settings.sample_state_file = Some(dir.join(file));
            }
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Parses settings from TOML text without environment overrides.
    pub fn from_toml_str(text: &str) -> FlowResult<Self> {
        let settings: Settings = Figment::new().merge(Toml::string(text)).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> FlowResult<()> {
        if let Some(file) = &self.sample_state_file {
            let is_csv = file
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            if !is_csv {
                return Err(FlowError::Configuration(format!(
                    "sample_state_file '{}' must be a .csv file",
                    file.display()
                )));
            }
        }

        if let Some(layout) = &self.plate_layout {
            if layout.plate_name.trim().is_empty() {
                return Err(FlowError::Configuration(
                    "plate_layout.plate_name must not be empty".to_string(),
                ));
            }
            if layout.x_wells == 0 || layout.y_wells == 0 {
                return Err(FlowError::Configuration(
                    "plate_layout needs at least one well in each direction".to_string(),
                ));
            }
        }
        if let Some(layout) = &self.well_layout {
            if layout.x_fields == 0 || layout.y_fields == 0 {
                return Err(FlowError::Configuration(
                    "well_layout needs at least one field in each direction".to_string(),
                ));
            }
        }

        let workflow = &self.workflow;
        if workflow.gain_timeout.is_zero() || workflow.imaging_timeout.is_zero() {
            return Err(FlowError::Configuration(
                "workflow timeouts must be greater than zero".to_string(),
            ));
        }
        for (name, timeout) in [
            ("gain_timeout", workflow.gain_timeout),
            ("imaging_timeout", workflow.imaging_timeout),
        ] {
            if timeout > MAX_TIMEOUT {
                return Err(FlowError::Configuration(format!(
                    "workflow.{} of {:?} exceeds the maximum of {:?}",
                    name, timeout, MAX_TIMEOUT
                )));
            }
        }
        if workflow.mailbox_capacity == 0 {
            return Err(FlowError::Configuration(
                "workflow.mailbox_capacity must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.channel.as_str()) {
                return Err(FlowError::Configuration(format!(
                    "channel '{}' is configured more than once",
                    channel.channel
                )));
            }
            if let Some(default_gain) = channel.default_gain {
                if channel.max_gain < default_gain {
                    return Err(FlowError::Configuration(format!(
                        "channel '{}': max_gain {} is below default_gain {}",
                        channel.channel, channel.max_gain, default_gain
                    )));
                }
            }
        }
        Ok(())
    }

    /// Gain policy for a channel name.
    pub fn channel(&self, name: &str) -> Option<&ChannelGain> {
        self.channels.iter().find(|c| c.channel == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
sample_state_file = "state.csv"
exp_job_ids = [2, 3, 4]

[workflow]
gain_timeout = "2m"
tracked_kinds = ["well", "channel"]

[[channels]]
channel = "green"
job_name = "green10x"
detector_num = 1
default_gain = 800
max_gain = 1000
"#;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert!(settings.sample_state_file.is_none());
        assert_eq!(settings.workflow.gain_timeout, Duration::from_secs(300));
        assert_eq!(settings.workflow.imaging_timeout, Duration::from_secs(1800));
        assert!(settings.workflow.tracks(NodeKind::Field));
        assert!(!settings.workflow.tracks(NodeKind::Plate));
        assert_eq!(settings.workflow.mailbox_capacity, 64);
    }

    #[test]
    fn test_parse_sample() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(settings.workflow.gain_timeout, Duration::from_secs(120));
        assert_eq!(
            settings.workflow.tracked_kinds,
            vec![NodeKind::Well, NodeKind::Channel]
        );
        assert_eq!(settings.exp_job_ids, Some([2, 3, 4]));
        let green = settings.channel("green").unwrap();
        assert_eq!(green.default_gain, Some(800));
        assert!(settings.channel("red").is_none());
    }

    #[test]
    fn test_plate_layout_defaults() {
        let settings = Settings::from_toml_str("[plate_layout]\n").unwrap();
        assert_eq!(settings.plate_layout, Some(PlateLayout::default()));
        assert_eq!(PlateLayout::default().x_wells, 12);
        assert_eq!(PlateLayout::default().y_wells, 8);
    }

    #[test]
    fn test_rejects_gain_above_max() {
        let text = r#"
[[channels]]
channel = "red"
job_name = "red10x"
detector_num = 2
default_gain = 900
max_gain = 700
"#;
        let err = Settings::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("max_gain 700 is below default_gain 900"));
    }

    #[test]
    fn test_rejects_duplicate_channels() {
        let text = r#"
[[channels]]
channel = "red"
job_name = "a"
detector_num = 1
max_gain = 700

[[channels]]
channel = "red"
job_name = "b"
detector_num = 2
max_gain = 700
"#;
        assert!(Settings::from_toml_str(text).is_err());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Settings::from_toml_str("sample_state_file = \"state.txt\"").is_err());
        assert!(Settings::from_toml_str("[workflow]\nimaging_timeout = \"0s\"").is_err());
        assert!(Settings::from_toml_str("[well_layout]\nx_fields = 0\ny_fields = 2").is_err());
        assert!(Settings::from_toml_str("[plate_layout]\nx_wells = 0").is_err());
    }

    #[test]
    fn test_rejects_oversized_timeouts() {
        let err = Settings::from_toml_str("[workflow]\ngain_timeout = \"500000000000years\"")
            .unwrap_err();
        assert!(err.to_string().contains("workflow.gain_timeout"));
        assert!(Settings::from_toml_str("[workflow]\nimaging_timeout = \"2years\"").is_err());
        assert!(Settings::from_toml_str("[workflow]\nimaging_timeout = \"30days\"").is_ok());
    }

    #[test]
    fn test_load_from_resolves_relative_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(
            settings.sample_state_file,
            Some(dir.path().join("state.csv"))
        );
    }

    #[test]
    fn test_load_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(&path, "workflow:\n  imaging_timeout: 45m\n").unwrap();
        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.workflow.imaging_timeout, Duration::from_secs(45 * 60));
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = Settings::load_from("/nonexistent/flow.toml").unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }
}
