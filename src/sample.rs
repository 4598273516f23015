//! The shared data model: `State`, `Sample`, and `Generation`. These are used
//! identically by the PUCT evaluator, the wire protocol, and the on-disk
//! generation files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A finite vector of binary base propositions. Equality and hashing are by
/// element-wise identity, since states are the deduplication key throughout
/// the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct State(pub Vec<u8>);

impl State {
    pub fn new(bits: Vec<u8>) -> Self {
        State(bits)
    }
}

/// One training example: the state, the search-derived policy target, the
/// eventual per-role outcome, and bookkeeping about where in the game it
/// occurred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub state: State,
    /// Sparse mapping from legal-action index to probability; sums to ~1.0.
    pub policy: HashMap<u32, f64>,
    /// Per-role final score, each in [0, 1].
    pub final_score: Vec<f64>,
    pub depth: u32,
    pub game_length: u32,
    pub lead_role_index: u8,
}

/// A single numbered training cycle: the samples that fed it and the
/// network identifiers that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub game: String,
    pub with_policy_generation: String,
    pub with_score_generation: String,
    pub num_samples: usize,
    pub samples: Vec<Sample>,
}

impl Generation {
    pub fn new(
        game: impl Into<String>,
        with_policy_generation: impl Into<String>,
        with_score_generation: impl Into<String>,
        samples: Vec<Sample>,
    ) -> Self {
        Self {
            game: game.into(),
            with_policy_generation: with_policy_generation.into(),
            with_score_generation: with_score_generation.into(),
            num_samples: samples.len(),
            samples,
        }
    }

    /// Write this generation once to `store_path/gendata_<step>.json`.
    /// Generation files are never modified after this call succeeds.
    pub fn write_once(&self, store_path: &std::path::Path, step: u64) -> std::io::Result<std::path::PathBuf> {
        std::fs::create_dir_all(store_path)?;
        let path = store_path.join(format!("gendata_{step}.json"));
        let text = serde_json::to_string(self).expect("Generation always serialises");
        std::fs::write(&path, text)?;
        Ok(path)
    }

    pub fn read(path: &std::path::Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
