//! Coordinator configuration: on-disk format, defaults, validation, and the
//! crash-safe save rollover described in the store design (see `store`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, PipelineResult};

/// Network size buckets recognised by the training harness. The harness
/// itself is out of scope; only the label matters to the coordinator, which
/// uses it to decide whether policy and score networks are trained together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkSize {
    Tiny,
    Smaller,
    Small,
    Normal,
}

impl Default for NetworkSize {
    fn default() -> Self {
        NetworkSize::Normal
    }
}

/// Move-choice strategy for the PUCT evaluator. See `search::choose`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChooseStrategy {
    ChooseTopVisits,
    ChooseConverge,
    ChooseTemperature,
}

impl Default for ChooseStrategy {
    fn default() -> Self {
        ChooseStrategy::ChooseTopVisits
    }
}

/// PUCT search hyperparameters. One instance each for the policy-choosing
/// and score-estimating roles (`policy_player_conf` / `score_player_conf`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PUCTPlayerConfig {
    pub name: String,
    pub verbose: bool,
    pub generation: String,

    pub playouts_per_iteration: u32,
    pub playouts_per_iteration_noop: u32,

    pub puct_before_expansions: u32,
    pub puct_before_root_expansions: u32,

    pub puct_constant_before: f64,
    pub puct_constant_after: f64,
    pub puct_constant_tune: bool,

    pub dirichlet_noise_pct: f64,
    pub dirichlet_noise_alpha: f64,

    /// -1 disables root pre-expansion.
    pub expand_root: i64,

    pub choose: ChooseStrategy,

    pub max_dump_depth: u32,

    pub random_scale: f64,
    pub temperature: f64,
    pub depth_temperature_start: u32,
    pub depth_temperature_increment: f64,
    pub depth_temperature_stop: u32,
}

impl Default for PUCTPlayerConfig {
    fn default() -> Self {
        Self {
            name: "PUCTPlayer".to_string(),
            verbose: true,
            generation: "latest".to_string(),
            playouts_per_iteration: 800,
            playouts_per_iteration_noop: 1,
            puct_before_expansions: 4,
            puct_before_root_expansions: 4,
            puct_constant_before: 0.75,
            puct_constant_after: 0.75,
            puct_constant_tune: false,
            dirichlet_noise_pct: 0.25,
            dirichlet_noise_alpha: 0.1,
            expand_root: -1,
            choose: ChooseStrategy::ChooseTopVisits,
            max_dump_depth: 2,
            random_scale: 0.5,
            temperature: 1.0,
            depth_temperature_start: 5,
            depth_temperature_increment: 0.5,
            depth_temperature_stop: 10,
        }
    }
}

/// Reference description of what a conforming worker's own config looks
/// like. The worker process itself is out of scope; this type exists so
/// integration tests (and any future worker implementation) have a shared,
/// documented shape for the handshake's other half.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub connect_ip_addr: String,
    pub connect_port: u16,
    pub do_training: bool,
    pub do_self_play: bool,
    pub concurrent_plays: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connect_ip_addr: "127.0.0.1".to_string(),
            connect_port: 9000,
            do_training: false,
            do_self_play: false,
            concurrent_plays: 1,
        }
    }
}

/// The coordinator's own configuration: everything needed to run the event
/// loop, schedule workers, and drive generation rollover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub game: String,
    pub current_step: u64,

    pub policy_network_size: NetworkSize,
    pub score_network_size: NetworkSize,

    pub generation_prefix: String,
    pub store_path: PathBuf,

    pub policy_player_conf: PUCTPlayerConfig,
    pub score_player_conf: PUCTPlayerConfig,

    pub generation_size: usize,
    pub max_growth_while_training: f64,

    pub validation_split: f64,
    pub batch_size: u32,
    pub epochs: u32,
    pub max_sample_count: usize,

    pub run_post_training_cmds: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            game: "breakthrough".to_string(),
            current_step: 0,
            policy_network_size: NetworkSize::Normal,
            score_network_size: NetworkSize::Normal,
            generation_prefix: "v2_".to_string(),
            store_path: PathBuf::from("somewhere"),
            policy_player_conf: PUCTPlayerConfig {
                name: "PolicyPlayer".to_string(),
                choose: ChooseStrategy::ChooseTemperature,
                ..PUCTPlayerConfig::default()
            },
            score_player_conf: PUCTPlayerConfig::default(),
            generation_size: 1024,
            max_growth_while_training: 0.2,
            validation_split: 0.8,
            batch_size: 32,
            epochs: 10,
            max_sample_count: 250_000,
            run_post_training_cmds: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Field-level validation beyond what serde's types already enforce.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.generation_size == 0 {
            return Err(ConfigError::FieldInvalid {
                field: "generation_size",
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(ConfigError::FieldInvalid {
                field: "validation_split",
                reason: "must be in (0, 1)".to_string(),
            }
            .into());
        }
        if self.max_growth_while_training < 0.0 {
            return Err(ConfigError::FieldInvalid {
                field: "max_growth_while_training",
                reason: "must be non-negative".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Whether the policy and score networks differ in size, which
    /// determines whether a training round needs one or two `TrainNNRequest`s.
    pub fn networks_differ(&self) -> bool {
        self.policy_network_size != self.score_network_size
    }

    /// Load the config at `path`, synthesising and persisting defaults if it
    /// does not yet exist.
    pub fn load_or_init(path: &Path) -> PipelineResult<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Missing {
                path: path.display().to_string(),
                source,
            })?;
            let config: Self =
                serde_json::from_str(&text).map_err(|source| ConfigError::Invalid {
                    path: path.display().to_string(),
                    source,
                })?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(path, SaveKind::Fresh)?;
            Ok(config)
        }
    }

    /// Persist this config to `path`, following the backup-then-replace
    /// rollover: the *current* primary (if any) is copied to a side path
    /// first, then the new content overwrites the primary directly. The side
    /// file therefore holds the previous config, not a staged draft of this
    /// one.
    pub fn save(&self, path: &Path, kind: SaveKind) -> PipelineResult<()> {
        if path.exists() {
            let side_path = kind.side_path(path, self.current_step);
            std::fs::copy(path, &side_path).map_err(|source| ConfigError::WriteFailed {
                path: side_path.display().to_string(),
                source,
            })?;
        }
        let text = serde_json::to_string_pretty(self).expect("ServerConfig always serialises");
        std::fs::write(path, text).map_err(|source| ConfigError::WriteFailed {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }
}

/// Distinguishes an ordinary save from a generation-rollover save, which
/// changes the side-file naming convention (see `ServerConfig::save`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    Fresh,
    Ordinary,
    Roll,
}

impl SaveKind {
    fn side_path(self, primary: &Path, current_step: u64) -> PathBuf {
        match self {
            SaveKind::Fresh | SaveKind::Ordinary => {
                PathBuf::from(format!("{}-bak", primary.display()))
            }
            SaveKind::Roll => {
                let previous_step = current_step.saturating_sub(1);
                PathBuf::from(format!("{}-{}", primary.display(), previous_step))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_generation_size() {
        let mut config = ServerConfig::default();
        config.generation_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_or_init_synthesises_defaults() {
        let dir = std::env::temp_dir().join(format!("zero-pipeline-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("conf.json");
        let loaded = ServerConfig::load_or_init(&path).unwrap();
        assert_eq!(loaded, ServerConfig::default());
        assert!(path.exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn save_backs_up_previous_content_before_overwrite() {
        let dir = std::env::temp_dir().join(format!("zero-pipeline-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("conf.json");

        let mut original = ServerConfig::default();
        original.current_step = 0;
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(serde_json::to_string(&original).unwrap().as_bytes())
            .unwrap();
        drop(file);

        let mut rolled = original.clone();
        rolled.current_step = 1;
        rolled.save(&path, SaveKind::Roll).unwrap();

        let side_path = dir.join("conf.json-0");
        let side_content: ServerConfig =
            serde_json::from_str(&std::fs::read_to_string(&side_path).unwrap()).unwrap();
        assert_eq!(side_content.current_step, 0);

        let primary_content: ServerConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(primary_content.current_step, 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
