//! Model routing: pick a capability tier for a task from its command kind
//! and prompt signals, using a weighted score.

use serde::{Deserialize, Serialize};

/// Model capability tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Cheap/fast models for trivial reads and summaries.
    Lite,
    /// Default tier for everyday edits.
    Standard,
    /// Most capable models for writes with architectural blast radius.
    Premium,
}

impl ModelTier {
    /// Default model identifier for this tier.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Lite => "lite-1",
            Self::Standard => "standard-1",
            Self::Premium => "premium-1",
        }
    }
}

impl std::str::FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lite" => Ok(Self::Lite),
            "standard" => Ok(Self::Standard),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Unknown model tier: {s}")),
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lite => write!(f, "lite"),
            Self::Standard => write!(f, "standard"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

/// Commands that mutate the project.
const WRITE_COMMANDS: &[&str] = &["fix", "build", "refactor", "implement", "deploy", "migrate"];

/// Commands that only read.
const READ_COMMANDS: &[&str] = &["review", "explain", "summarize", "status", "decompose"];

/// Prompt phrases that raise the score toward premium.
const HEAVY_SIGNALS: &[&str] = &[
    "architecture",
    "migration",
    "concurrency",
    "security",
    "rewrite",
    "across the codebase",
];

/// Score a task and map it to a tier.
///
/// Write commands start at 40, reads at 10, unknown commands at 25. Long
/// prompts and heavy phrases add weight. Thresholds: < 25 lite, < 60
/// standard, else premium.
pub fn route_model(command: &str, prompt: &str) -> ModelTier {
    let mut score: u32 = if WRITE_COMMANDS.contains(&command) {
        40
    } else if READ_COMMANDS.contains(&command) {
        10
    } else {
        25
    };

    if prompt.len() > 400 {
        score += 15;
    }
    if prompt.len() > 1200 {
        score += 10;
    }
    let lowered = prompt.to_lowercase();
    for signal in HEAVY_SIGNALS {
        if lowered.contains(signal) {
            score += 15;
        }
    }

    if score < 25 {
        ModelTier::Lite
    } else if score < 60 {
        ModelTier::Standard
    } else {
        ModelTier::Premium
    }
}
