//! Deterministic corruption of agent output for resilience drills.
//!
//! When enabled, the injector intercepts raw agent output before
//! extraction and damages it in one of six ways. A fixed seed makes a
//! drill reproducible end to end.

use std::borrow::Cow;
use std::fmt;
use std::sync::{LazyLock, Mutex};

use daedalus_store::RoleKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ── Compiled patterns ────────────────────────────────────────────────────────

/// First bare integer value, e.g. `"count": 42`.
static RE_INT_VALUE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(:\s*)(-?\d+)").unwrap());

/// First object key.
static RE_FIRST_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([A-Za-z_][A-Za-z0-9_]*)"(\s*:)"#).unwrap());

// ── Configuration ────────────────────────────────────────────────────────────

/// The ways agent output can be damaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionKind {
    /// Structural damage that makes the payload unparseable.
    SyntaxError,
    /// A value changes type while the JSON stays valid.
    TypeError,
    /// The first key is renamed so required fields go missing.
    MissingFields,
    /// The payload is replaced with a validly shaped but alien object.
    UnexpectedStructure,
    /// The payload is cut short mid-stream.
    TruncatedJson,
    /// Control and marker characters are spliced into the payload.
    InvalidCharacters,
}

impl CorruptionKind {
    /// Every corruption category.
    pub const ALL: [CorruptionKind; 6] = [
        CorruptionKind::SyntaxError,
        CorruptionKind::TypeError,
        CorruptionKind::MissingFields,
        CorruptionKind::UnexpectedStructure,
        CorruptionKind::TruncatedJson,
        CorruptionKind::InvalidCharacters,
    ];
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CorruptionKind::SyntaxError => "syntax_error",
            CorruptionKind::TypeError => "type_error",
            CorruptionKind::MissingFields => "missing_fields",
            CorruptionKind::UnexpectedStructure => "unexpected_structure",
            CorruptionKind::TruncatedJson => "truncated_json",
            CorruptionKind::InvalidCharacters => "invalid_characters",
        };
        write!(f, "{name}")
    }
}

/// Injection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosConfig {
    /// Master switch; everything below is inert while this is false.
    #[serde(default)]
    pub enabled: bool,

    /// Roles whose output may be corrupted. Empty means every role.
    #[serde(default)]
    pub target_roles: Vec<RoleKind>,

    /// Percentage of eligible outputs to corrupt, 0 to 100.
    #[serde(default = "default_injection_rate")]
    pub injection_rate: u8,

    /// Corruption categories to draw from.
    #[serde(default = "default_error_types")]
    pub error_types: Vec<CorruptionKind>,

    /// Fixed RNG seed for reproducible drills.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_injection_rate() -> u8 {
    10
}

fn default_error_types() -> Vec<CorruptionKind> {
    CorruptionKind::ALL.to_vec()
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_roles: Vec::new(),
            injection_rate: default_injection_rate(),
            error_types: default_error_types(),
            seed: None,
        }
    }
}

// ── Injector ─────────────────────────────────────────────────────────────────

/// Applies configured corruption to agent output.
#[derive(Debug)]
pub struct ErrorInjector {
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl ErrorInjector {
    /// Build an injector, clamping out-of-range rates.
    pub fn new(mut config: ChaosConfig) -> Self {
        if config.injection_rate > 100 {
            warn!(
                rate = config.injection_rate,
                "injection_rate above 100 clamped"
            );
            config.injection_rate = 100;
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    /// An injector that never fires.
    pub fn disabled() -> Self {
        Self::new(ChaosConfig::default())
    }

    /// Effective settings after clamping.
    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    /// Whether injection can fire at all.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Possibly corrupt `payload` produced by `role`.
    ///
    /// Returns `Some(corrupted)` when the dice land on injection; `None`
    /// means the payload passes through untouched.
    pub fn maybe_corrupt(&self, role: RoleKind, payload: &str) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        if !self.config.target_roles.is_empty() && !self.config.target_roles.contains(&role) {
            return None;
        }
        if self.config.error_types.is_empty() {
            return None;
        }

        let kind = {
            let mut rng = match self.rng.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if rng.gen_range(0..100u8) >= self.config.injection_rate {
                return None;
            }
            self.config.error_types[rng.gen_range(0..self.config.error_types.len())]
        };

        let corrupted = corrupt(kind, payload);
        info!(
            %role,
            %kind,
            prefix = %crate::extract::excerpt(&corrupted, 60),
            "injected corruption into agent output"
        );
        Some(corrupted)
    }
}

/// Apply one corruption category to a payload.
fn corrupt(kind: CorruptionKind, payload: &str) -> String {
    match kind {
        CorruptionKind::SyntaxError => match payload.find(':') {
            Some(pos) => {
                let mut damaged = String::with_capacity(payload.len());
                damaged.push_str(&payload[..pos]);
                damaged.push_str(&payload[pos + 1..]);
                damaged
            }
            None => format!("{payload}{{"),
        },
        CorruptionKind::TypeError => {
            match RE_INT_VALUE.replace(payload, "${1}\"${2}\"") {
                Cow::Owned(damaged) => damaged,
                // No integer to requote; change the top-level type instead.
                Cow::Borrowed(_) => format!("[{payload}]"),
            }
        }
        CorruptionKind::MissingFields => {
            match RE_FIRST_KEY.replace(payload, "\"_${1}\"${2}") {
                Cow::Owned(damaged) => damaged,
                Cow::Borrowed(_) => String::from("{}"),
            }
        }
        CorruptionKind::UnexpectedStructure => {
            String::from(r#"{"unexpected": {"nested": ["structure"]}}"#)
        }
        CorruptionKind::TruncatedJson => {
            let mut cut = payload.len() * 3 / 5;
            while cut > 0 && !payload.is_char_boundary(cut) {
                cut -= 1;
            }
            payload[..cut].to_string()
        }
        CorruptionKind::InvalidCharacters => {
            let mut damaged = String::with_capacity(payload.len() + 4);
            damaged.push('\u{FEFF}');
            match payload.find('{') {
                Some(pos) => {
                    damaged.push_str(&payload[..=pos]);
                    damaged.push('\u{0}');
                    damaged.push_str(&payload[pos + 1..]);
                }
                None => damaged.push_str(payload),
            }
            damaged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{"summary": "done", "count": 42}"#;

    fn firing_config(kinds: Vec<CorruptionKind>) -> ChaosConfig {
        ChaosConfig {
            enabled: true,
            injection_rate: 100,
            error_types: kinds,
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn disabled_injector_passes_through() {
        let injector = ErrorInjector::disabled();
        assert!(injector
            .maybe_corrupt(RoleKind::Developer, PAYLOAD)
            .is_none());
    }

    #[test]
    fn zero_rate_never_fires() {
        let mut config = firing_config(CorruptionKind::ALL.to_vec());
        config.injection_rate = 0;
        let injector = ErrorInjector::new(config);
        for _ in 0..100 {
            assert!(injector
                .maybe_corrupt(RoleKind::Developer, PAYLOAD)
                .is_none());
        }
    }

    #[test]
    fn full_rate_always_fires() {
        let injector = ErrorInjector::new(firing_config(CorruptionKind::ALL.to_vec()));
        for _ in 0..50 {
            assert!(injector
                .maybe_corrupt(RoleKind::Developer, PAYLOAD)
                .is_some());
        }
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let mut config = firing_config(CorruptionKind::ALL.to_vec());
        config.injection_rate = 50;
        let first = ErrorInjector::new(config.clone());
        let second = ErrorInjector::new(config);

        for _ in 0..100 {
            assert_eq!(
                first.maybe_corrupt(RoleKind::Reviewer, PAYLOAD),
                second.maybe_corrupt(RoleKind::Reviewer, PAYLOAD)
            );
        }
    }

    #[test]
    fn respects_target_roles() {
        let mut config = firing_config(CorruptionKind::ALL.to_vec());
        config.target_roles = vec![RoleKind::Developer];
        let injector = ErrorInjector::new(config);

        assert!(injector
            .maybe_corrupt(RoleKind::Architect, PAYLOAD)
            .is_none());
        assert!(injector
            .maybe_corrupt(RoleKind::Developer, PAYLOAD)
            .is_some());
    }

    #[test]
    fn rate_above_100_is_clamped() {
        let mut config = firing_config(CorruptionKind::ALL.to_vec());
        config.injection_rate = 250;
        let injector = ErrorInjector::new(config);
        assert_eq!(injector.config().injection_rate, 100);
    }

    #[test]
    fn syntax_error_breaks_parsing() {
        let damaged = corrupt(CorruptionKind::SyntaxError, PAYLOAD);
        assert!(serde_json::from_str::<serde_json::Value>(&damaged).is_err());
    }

    #[test]
    fn type_error_keeps_json_valid_but_changes_type() {
        let damaged = corrupt(CorruptionKind::TypeError, PAYLOAD);
        let value: serde_json::Value = serde_json::from_str(&damaged).expect("still valid JSON");
        assert_eq!(value["count"], "42");
    }

    #[test]
    fn missing_fields_renames_first_key() {
        let damaged = corrupt(CorruptionKind::MissingFields, PAYLOAD);
        let value: serde_json::Value = serde_json::from_str(&damaged).expect("still valid JSON");
        assert!(value.get("summary").is_none());
        assert_eq!(value["_summary"], "done");
    }

    #[test]
    fn unexpected_structure_replaces_payload() {
        let damaged = corrupt(CorruptionKind::UnexpectedStructure, PAYLOAD);
        let value: serde_json::Value = serde_json::from_str(&damaged).expect("still valid JSON");
        assert!(value.get("unexpected").is_some());
    }

    #[test]
    fn truncation_shortens_payload() {
        let damaged = corrupt(CorruptionKind::TruncatedJson, PAYLOAD);
        assert!(damaged.len() < PAYLOAD.len());
        assert!(serde_json::from_str::<serde_json::Value>(&damaged).is_err());
    }

    #[test]
    fn invalid_characters_splice_markers_in() {
        let damaged = corrupt(CorruptionKind::InvalidCharacters, PAYLOAD);
        assert!(damaged.starts_with('\u{FEFF}'));
        assert!(damaged.contains('\u{0}'));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let payload = r#"{"заметка": "длинное значение для усечения"}"#;
        let damaged = corrupt(CorruptionKind::TruncatedJson, payload);
        assert!(damaged.len() < payload.len());
    }
}
