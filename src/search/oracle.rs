//! The neural policy/value oracle boundary. The network itself is out of
//! scope; this module only defines the batched predict interface the PUCT
//! evaluator calls against, plus a deterministic mock used by tests.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::SearchError;
use crate::sample::State;

pub type Action = u32;

/// One oracle response: a policy distribution over the legal actions that
/// were asked about, and a per-role value estimate for the state itself.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub policy: HashMap<Action, f64>,
    pub value_per_role: Vec<f64>,
}

/// A single prediction request: the state, the legal actions at that state
/// (the oracle only needs to return a probability for each of these), and
/// the perspective role asking.
#[derive(Debug, Clone)]
pub struct PredictRequest {
    pub state: State,
    pub legal_actions: Vec<Action>,
    pub lead_role_index: u8,
}

/// Batched policy/value predictor. Concrete neural-network implementations
/// are out of scope for this crate; callers provide one (or use
/// `MockOracle` in tests).
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn predict_batch(
        &self,
        requests: &[PredictRequest],
    ) -> Result<Vec<Prediction>, SearchError>;

    /// Convenience single-request form built on `predict_batch`.
    async fn predict_one(&self, request: PredictRequest) -> Result<Prediction, SearchError> {
        let mut results = self.predict_batch(std::slice::from_ref(&request)).await?;
        results
            .pop()
            .ok_or_else(|| SearchError::OraclePredictionFailed("empty batch response".to_string()))
    }
}

/// A deterministic, in-process oracle for tests: uniform policy over legal
/// actions, and a configurable fixed value. Never fails.
pub struct UniformMockOracle {
    pub value_per_role: Vec<f64>,
}

impl UniformMockOracle {
    pub fn new(value_per_role: Vec<f64>) -> Self {
        Self { value_per_role }
    }
}

#[async_trait]
impl Oracle for UniformMockOracle {
    async fn predict_batch(
        &self,
        requests: &[PredictRequest],
    ) -> Result<Vec<Prediction>, SearchError> {
        Ok(requests
            .iter()
            .map(|req| {
                let n = req.legal_actions.len().max(1) as f64;
                let policy = req
                    .legal_actions
                    .iter()
                    .map(|&a| (a, 1.0 / n))
                    .collect();
                Prediction {
                    policy,
                    value_per_role: self.value_per_role.clone(),
                }
            })
            .collect())
    }
}

/// An oracle that returns caller-supplied predictions keyed by state, for
/// tests that need to steer the search toward specific outcomes (e.g. S4's
/// "child B has NN value 0.99").
pub struct ScriptedOracle {
    pub responses: HashMap<State, Prediction>,
    pub fallback_value: Vec<f64>,
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn predict_batch(
        &self,
        requests: &[PredictRequest],
    ) -> Result<Vec<Prediction>, SearchError> {
        Ok(requests
            .iter()
            .map(|req| {
                if let Some(p) = self.responses.get(&req.state) {
                    p.clone()
                } else {
                    let n = req.legal_actions.len().max(1) as f64;
                    let policy = req.legal_actions.iter().map(|&a| (a, 1.0 / n)).collect();
                    Prediction {
                        policy,
                        value_per_role: self.fallback_value.clone(),
                    }
                }
            })
            .collect())
    }
}
