// Generation pipeline library - core module organization.
//
// This crate implements the PUCT search core and the generation-coordinator
// protocol for a distributed two-role general-game-playing training loop.
// The game-description-language state machine and the neural network are
// out of scope; `search::game::GameModel` and `search::oracle::Oracle` are
// the interfaces a caller supplies.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod sample;
pub mod search;

pub use config::{PUCTPlayerConfig, ServerConfig, WorkerConfig};
pub use coordinator::Coordinator;
pub use error::{PipelineError, PipelineResult};
pub use sample::{Generation, Sample, State};
pub use search::{Action, GameModel, Oracle, PuctEvaluator};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
