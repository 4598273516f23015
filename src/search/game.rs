//! The game-description-language state machine is out of scope: this trait
//! is the entire interface the PUCT evaluator needs from it (legal moves,
//! goal values, terminal check, successor states).

use crate::sample::State;
use crate::search::oracle::Action;

/// Two-role general-game-playing state machine boundary. Every
/// implementation must uphold the lead-role convention: at any non-terminal
/// state, exactly one role has a single legal action, `noop`, and the other
/// is the lead role whose real choices are enumerated by `legal_actions`.
pub trait GameModel: Send + Sync {
    /// Legal actions for whichever role acts at `state`, in the order the
    /// state machine enumerates them. For the non-lead role this is the
    /// single-element `[noop]`.
    fn legal_actions(&self, state: &State) -> Vec<Action>;

    /// Which role (0 or 1) is the lead (non-noop) role at `state`.
    fn lead_role_index(&self, state: &State) -> u8;

    fn is_terminal(&self, state: &State) -> bool;

    /// Per-role goal value in [0, 100], present only once `is_terminal`.
    fn terminal_scores(&self, state: &State) -> Option<Vec<f64>>;

    fn apply(&self, state: &State, action: Action) -> State;
}
