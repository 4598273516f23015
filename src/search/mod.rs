//! The PUCT evaluator: the search tree, the oracle boundary it predicts
//! against, and the game-model boundary it expands against.

pub mod game;
pub mod oracle;
pub mod tree;

pub use game::GameModel;
pub use oracle::{Action, Oracle, PredictRequest, Prediction, ScriptedOracle, UniformMockOracle};
pub use tree::{Budget, Child, Node, PuctEvaluator, SearchTree};
