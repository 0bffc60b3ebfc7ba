use crate::emotion::{EmotionClass, EmotionSet};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, net::SocketAddr, path::Path, time::Duration};
use url::Url;

pub const DEFAULT_DEVICE_ADDRESS: &str = "tcp://127.0.0.1:9559";
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:6000";
pub const DEFAULT_THRESHOLD: f32 = 0.3;
pub const DEFAULT_SENTENCE_BOUNDARY: &str = ". ";
pub const DEFAULT_STREAK_THRESHOLD: u32 = 5;
pub const ENV_DEVICE_ADDRESS: &str = "AFFECT_DEVICE_ADDRESS";
pub const ENV_LISTEN_ADDRESS: &str = "AFFECT_LISTEN_ADDRESS";
pub const ENV_CONFIG_PATH: &str = "AFFECT_CONFIG";

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new<S: Into<String>>(value: S) -> Result<Self, ConfigError> {
        let v = value.into();
        if v.trim().is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        let url = Url::parse(v.trim()).map_err(|_| ConfigError::InvalidAddress(v.clone()))?;
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidAddress(v));
        }
        Ok(Self(v.trim().to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.0).map_err(|_| ConfigError::InvalidAddress(self.0.clone()))
    }
}

impl Default for DeviceAddress {
    fn default() -> Self {
        Self(DEFAULT_DEVICE_ADDRESS.to_owned())
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceAddress({})", self.0)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceAddress> for String {
    fn from(addr: DeviceAddress) -> Self {
        addr.0
    }
}

/// Voice-shaping parameters for one emotion class.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProsodyEntry {
    /// Pitch multiplier, 1.0 is the stock voice.
    pub pitch: f32,
    /// Speaking-rate multiplier.
    pub rate: f32,
    /// Output volume, 0..=100.
    pub volume: u8,
    /// Pause inserted between phrases, in milliseconds.
    pub pause_ms: u64,
}

impl ProsodyEntry {
    pub const fn new(pitch: f32, rate: f32, volume: u8, pause_ms: u64) -> Self {
        Self {
            pitch,
            rate,
            volume,
            pause_ms,
        }
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

impl Default for ProsodyEntry {
    fn default() -> Self {
        Self::new(1.0, 1.0, 80, 100)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub min_sample_interval_ms: u64,
    pub settle_delay_ms: u64,
    pub animation_cooldown_ms: u64,
    pub unit_spacing_ms: u64,
    pub pass_spacing_ms: u64,
    pub min_utterance_delay_ms: u64,
    pub speech_wait_timeout_ms: u64,
    /// Bound on one liveness ping before the session counts as unhealthy.
    pub probe_timeout_ms: u64,
    /// How long a story-mode sender may take to deliver its label.
    pub label_read_timeout_ms: u64,
    /// Bound on ordinary bridge requests. Blocking speech calls use
    /// `speech_wait_timeout_ms` instead.
    pub bridge_request_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            min_sample_interval_ms: 5_000,
            settle_delay_ms: 3_000,
            animation_cooldown_ms: 5_500,
            unit_spacing_ms: 500,
            pass_spacing_ms: 1_000,
            min_utterance_delay_ms: 3_000,
            speech_wait_timeout_ms: 30_000,
            probe_timeout_ms: 3_000,
            label_read_timeout_ms: 5_000,
            bridge_request_timeout_ms: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn min_sample_interval(&self) -> Duration {
        Duration::from_millis(self.min_sample_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn animation_cooldown(&self) -> Duration {
        Duration::from_millis(self.animation_cooldown_ms)
    }

    pub fn unit_spacing(&self) -> Duration {
        Duration::from_millis(self.unit_spacing_ms)
    }

    pub fn pass_spacing(&self) -> Duration {
        Duration::from_millis(self.pass_spacing_ms)
    }

    pub fn min_utterance_delay(&self) -> Duration {
        Duration::from_millis(self.min_utterance_delay_ms)
    }

    pub fn speech_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.speech_wait_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn label_read_timeout(&self) -> Duration {
        Duration::from_millis(self.label_read_timeout_ms)
    }

    pub fn bridge_request_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_request_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 2_000,
        }
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub device_address: DeviceAddress,
    pub listen_address: String,
    pub classes: EmotionSet,
    pub default_threshold: f32,
    pub thresholds: BTreeMap<EmotionClass, f32>,
    pub gestures: BTreeMap<EmotionClass, Vec<String>>,
    pub prosody: BTreeMap<EmotionClass, ProsodyEntry>,
    pub timing: TimingConfig,
    pub reconnect: ReconnectConfig,
    pub sentence_boundary: String,
    pub streak_threshold: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            device_address: DeviceAddress::default(),
            listen_address: DEFAULT_LISTEN_ADDRESS.to_owned(),
            classes: EmotionSet::default(),
            default_threshold: DEFAULT_THRESHOLD,
            thresholds: BTreeMap::new(),
            gestures: default_gestures(),
            prosody: default_prosody(),
            timing: TimingConfig::default(),
            reconnect: ReconnectConfig::default(),
            sentence_boundary: DEFAULT_SENTENCE_BOUNDARY.to_owned(),
            streak_threshold: DEFAULT_STREAK_THRESHOLD,
        }
    }
}

fn default_gestures() -> BTreeMap<EmotionClass, Vec<String>> {
    let table: [(EmotionClass, &[&str]); 5] = [
        (
            EmotionClass::Happy,
            &[
                "animations/Stand/Gestures/Happy_1",
                "animations/Stand/Gestures/WideOpenBothHands_1",
                "animations/Stand/Gestures/GoToStance_Exclamation_Center",
            ],
        ),
        (
            EmotionClass::Sad,
            &[
                "animations/Stand/Gestures/SlowBowWithArms_1",
                "animations/Stand/Gestures/Confused_1",
                "animations/Stand/Gestures/RightArmUpAndDownWithBump_HeadShake_1",
            ],
        ),
        (
            EmotionClass::Angry,
            &[
                "animations/Stand/Gestures/GoToStance_Enumeration_Center",
                "animations/Stand/Gestures/GoToStance_Negation_Center",
                "animations/Stand/Gestures/CircleBothArmsLeaningFront_1",
                "animations/Stand/Gestures/GoToStance_SpaceAndTime_LeanRight",
            ],
        ),
        (
            EmotionClass::Surprised,
            &[
                "animations/Stand/Gestures/LittleArmsBump_1",
                "animations/Stand/Gestures/StrongBothArmsUpAndDown_LeanLeft_1",
                "animations/Stand/Gestures/BothArmsUpAndDown_HeadShake_1",
            ],
        ),
        (EmotionClass::Neutral, &["animations/Stand/Gestures/Chill_1"]),
    ];
    table
        .into_iter()
        .map(|(class, ids)| (class, ids.iter().map(|s| (*s).to_owned()).collect()))
        .collect()
}

fn default_prosody() -> BTreeMap<EmotionClass, ProsodyEntry> {
    BTreeMap::from([
        (EmotionClass::Neutral, ProsodyEntry::new(1.0, 1.0, 80, 100)),
        (EmotionClass::Happy, ProsodyEntry::new(1.5, 1.0, 80, 100)),
        (EmotionClass::Sad, ProsodyEntry::new(0.8, 0.7, 65, 1_000)),
        (EmotionClass::Angry, ProsodyEntry::new(0.6, 1.0, 100, 100)),
        (EmotionClass::Surprised, ProsodyEntry::new(1.3, 1.0, 88, 300)),
    ])
}

/// Profiles for the classes the device can report but the default set leaves out.
/// A config that adds one of these classes without its own entry picks it up here.
fn extra_prosody(class: EmotionClass) -> Option<ProsodyEntry> {
    match class {
        EmotionClass::Fear => Some(ProsodyEntry::new(0.9, 0.8, 72, 700)),
        EmotionClass::Confused => Some(ProsodyEntry::new(1.0, 0.9, 72, 500)),
        EmotionClass::Disgust => Some(ProsodyEntry::new(0.7, 0.9, 80, 400)),
        _ => None,
    }
}

impl ControllerConfig {
    /// Checks every setting the controller relies on. Thresholds, gestures and prosody
    /// may only name classes from the configured set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_address
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidListenAddress(self.listen_address.clone()))?;

        if !self.default_threshold.is_finite() {
            return Err(ConfigError::InvalidThreshold(EmotionClass::Neutral));
        }
        for (class, threshold) in &self.thresholds {
            if !self.classes.contains(*class) {
                return Err(ConfigError::UnknownClass {
                    field: "thresholds",
                    class: *class,
                });
            }
            if !threshold.is_finite() {
                return Err(ConfigError::InvalidThreshold(*class));
            }
        }
        for (class, gestures) in &self.gestures {
            if !self.classes.contains(*class) {
                return Err(ConfigError::UnknownClass {
                    field: "gestures",
                    class: *class,
                });
            }
            if gestures.is_empty() || gestures.iter().any(|g| g.trim().is_empty()) {
                return Err(ConfigError::EmptyGestureList(*class));
            }
        }
        for (class, entry) in &self.prosody {
            if !self.classes.contains(*class) {
                return Err(ConfigError::UnknownClass {
                    field: "prosody",
                    class: *class,
                });
            }
            if !(entry.pitch.is_finite() && entry.pitch > 0.0)
                || !(entry.rate.is_finite() && entry.rate > 0.0)
                || entry.volume > 100
            {
                return Err(ConfigError::InvalidProsody(*class));
            }
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::ZeroReconnectAttempts);
        }
        if self.sentence_boundary.is_empty() {
            return Err(ConfigError::EmptySentenceBoundary);
        }
        if self.streak_threshold < 2 {
            return Err(ConfigError::StreakThresholdTooLow(self.streak_threshold));
        }
        Ok(())
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_address
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddress(self.listen_address.clone()))
    }
}

pub fn load_config_file(path: &Path) -> Result<ControllerConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        details: e.to_string(),
    })?;
    parse_config(&raw)
}

/// Parses a JSON config. Gesture and prosody tables the file leaves out are taken
/// from the defaults and fitted to the configured class set; tables the file does
/// give are validated as written.
pub fn parse_config(raw: &str) -> Result<ControllerConfig, ConfigError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let has_gestures = value.get("gestures").is_some();
    let has_prosody = value.get("prosody").is_some();
    let mut cfg: ControllerConfig =
        serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    if !has_gestures {
        cfg.gestures.retain(|class, _| cfg.classes.contains(*class));
    }
    if !has_prosody {
        cfg.prosody = fitted_prosody(&cfg.classes);
    }
    cfg.validate()?;
    Ok(cfg)
}

fn fitted_prosody(classes: &EmotionSet) -> BTreeMap<EmotionClass, ProsodyEntry> {
    let defaults = default_prosody();
    classes
        .iter()
        .filter_map(|class| {
            let entry = defaults.get(&class).copied().or_else(|| extra_prosody(class))?;
            Some((class, entry))
        })
        .collect()
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("device address must not be empty")]
    EmptyAddress,
    #[error("invalid device address: {0}")]
    InvalidAddress(String),
    #[error("invalid listen address: {0}")]
    InvalidListenAddress(String),
    #[error("emotion class set must include neutral")]
    MissingNeutral,
    #[error("emotion class {0} listed more than once")]
    DuplicateClass(EmotionClass),
    #[error("{field} references class {class} which is not in the configured set")]
    UnknownClass {
        field: &'static str,
        class: EmotionClass,
    },
    #[error("gesture list for {0} must be non-empty")]
    EmptyGestureList(EmotionClass),
    #[error("threshold for {0} must be finite")]
    InvalidThreshold(EmotionClass),
    #[error("prosody for {0} is out of range")]
    InvalidProsody(EmotionClass),
    #[error("poll interval must be > 0 ms")]
    ZeroPollInterval,
    #[error("reconnect attempts must be > 0")]
    ZeroReconnectAttempts,
    #[error("sentence boundary must not be empty")]
    EmptySentenceBoundary,
    #[error("streak threshold must be >= 2, got {0}")]
    StreakThresholdTooLow(u32),
    #[error("phrase table must contain at least one entry")]
    EmptyPhraseTable,
    #[error("phrase {0} has no non-empty neutral variant")]
    PhraseMissingNeutral(usize),
    #[error("failed to read config {path}: {details}")]
    Read { path: String, details: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
}

pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct StdEnv;

impl Env for StdEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: BTreeMap<String, String>,
}

impl MapEnv {
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

pub fn resolve_optional_string(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
) -> Option<String> {
    match cli_value {
        Some(v) => Some(v),
        None => env.var(env_key),
    }
}

/// CLI value, then environment, then whatever the config file (or default) holds.
pub fn resolve_device_address(
    cli_value: Option<String>,
    env: &impl Env,
    fallback: &DeviceAddress,
) -> Result<DeviceAddress, ConfigError> {
    match resolve_optional_string(cli_value, ENV_DEVICE_ADDRESS, env) {
        Some(v) => DeviceAddress::new(v),
        None => Ok(fallback.clone()),
    }
}
