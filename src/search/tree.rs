//! Arena-allocated PUCT search tree.
//!
//! Nodes live in a single `Vec<Node>` owned by `SearchTree`; parent, child,
//! and expansion links are `usize` handles into that arena rather than
//! `Rc`/`RefCell` graphs. Detaching a subtree (on external move
//! application) is a handle-invalidation on the parent's child slot; the
//! orphaned arena entries are simply abandoned along with the rest of the
//! discarded tree.

use rand::Rng;
use rand_distr::{Distribution, Gamma};
use std::time::Instant;

use crate::config::{ChooseStrategy, PUCTPlayerConfig};
use crate::error::SearchError;
use crate::sample::State;
use crate::search::game::GameModel;
use crate::search::oracle::{Action, Oracle, PredictRequest};

/// One legal move out of a node, and (once expanded) the node it leads to.
#[derive(Debug, Clone)]
pub struct Child {
    pub action: Action,
    pub policy_prob: f64,
    pub to_node: Option<usize>,
}

/// One position in the search tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub state: State,
    pub parent: Option<usize>,
    pub lead_role_index: u8,
    pub is_terminal: bool,
    pub predicted: bool,
    /// Per-role value as returned by the oracle (meaningless until `predicted`).
    pub final_score: Vec<f64>,
    /// Per-role goal value in [0, 100], set only for terminal nodes.
    pub terminal_scores: Option<Vec<f64>>,
    pub mc_visits: u32,
    pub mc_score: Vec<f64>,
    pub children: Vec<Child>,
}

impl Node {
    fn new_unexpanded(state: State, parent: Option<usize>, game: &dyn GameModel) -> Self {
        if game.is_terminal(&state) {
            let terminal_scores = game
                .terminal_scores(&state)
                .expect("terminal state must carry goal values");
            let mc_score: Vec<f64> = terminal_scores.iter().map(|s| s / 100.0).collect();
            let lead_role_index = game.lead_role_index(&state);
            Node {
                state,
                parent,
                lead_role_index,
                is_terminal: true,
                predicted: true,
                final_score: mc_score.clone(),
                terminal_scores: Some(terminal_scores),
                mc_visits: 0,
                mc_score,
                children: Vec::new(),
            }
        } else {
            let lead_role_index = game.lead_role_index(&state);
            let legal = game.legal_actions(&state);
            let n = legal.len().max(1) as f64;
            let children = legal
                .into_iter()
                .map(|action| Child {
                    action,
                    policy_prob: 1.0 / n,
                    to_node: None,
                })
                .collect();
            Node {
                state,
                parent,
                lead_role_index,
                is_terminal: false,
                predicted: false,
                final_score: vec![0.0, 0.0],
                terminal_scores: None,
                mc_visits: 0,
                mc_score: vec![0.0, 0.0],
                children,
            }
        }
    }
}

pub struct SearchTree {
    pub nodes: Vec<Node>,
    pub root: usize,
}

impl SearchTree {
    fn with_root_state(state: State, game: &dyn GameModel) -> Self {
        let root = Node::new_unexpanded(state, None, game);
        SearchTree {
            nodes: vec![root],
            root: 0,
        }
    }

    fn add_node(&mut self, node: Node) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(node);
        idx
    }

    /// Request the node's own prediction (policy over its children, value
    /// for itself). A no-op for already-predicted or terminal nodes.
    async fn predict_node(
        &mut self,
        idx: usize,
        oracle: &dyn Oracle,
    ) -> Result<(), SearchError> {
        if self.nodes[idx].predicted {
            return Ok(());
        }
        let legal_actions: Vec<Action> = self.nodes[idx].children.iter().map(|c| c.action).collect();
        let request = PredictRequest {
            state: self.nodes[idx].state.clone(),
            legal_actions,
            lead_role_index: self.nodes[idx].lead_role_index,
        };
        let prediction = oracle.predict_one(request).await?;

        let node = &mut self.nodes[idx];
        node.final_score = prediction.value_per_role;
        node.mc_score = node.final_score.clone();
        for child in node.children.iter_mut() {
            child.policy_prob = prediction.policy.get(&child.action).copied().unwrap_or(0.0);
        }
        normalise(&mut node.children);
        node.children
            .sort_by(|a, b| b.policy_prob.partial_cmp(&a.policy_prob).unwrap());
        node.predicted = true;
        Ok(())
    }
}

fn normalise(children: &mut [Child]) {
    let sum: f64 = children.iter().map(|c| c.policy_prob).sum();
    if sum > 0.0 {
        for c in children.iter_mut() {
            c.policy_prob /= sum;
        }
    } else {
        let n = children.len().max(1) as f64;
        for c in children.iter_mut() {
            c.policy_prob = 1.0 / n;
        }
    }
}

/// A symmetric Dirichlet(alpha) sample over `n` dimensions, built from `n`
/// independent Gamma(alpha, 1) draws normalised to sum to 1 — the standard
/// Gamma-ratio construction. Used only for root exploration noise.
fn sample_dirichlet<R: Rng + ?Sized>(alpha: f64, n: usize, rng: &mut R) -> Vec<f64> {
    let gamma = Gamma::new(alpha.max(1e-6), 1.0).expect("alpha must be positive");
    let draws: Vec<f64> = (0..n).map(|_| gamma.sample(rng)).collect();
    let sum: f64 = draws.iter().sum::<f64>().max(1e-12);
    draws.into_iter().map(|d| d / sum).collect()
}

/// Search budget: either a fixed number of playouts or a wall-clock deadline.
#[derive(Debug, Clone, Copy)]
pub enum Budget {
    Iterations(u32),
    Deadline(Instant),
}

impl Budget {
    fn exhausted(&self, done: u32) -> bool {
        match self {
            Budget::Iterations(n) => done >= *n,
            Budget::Deadline(at) => Instant::now() >= *at,
        }
    }
}

/// Owns the persistent search tree across moves and drives playouts against
/// a `GameModel` + `Oracle` pair.
pub struct PuctEvaluator<'a> {
    pub game: &'a dyn GameModel,
    pub oracle: &'a dyn Oracle,
    pub config: PUCTPlayerConfig,
    pub tree: Option<SearchTree>,
}

impl<'a> PuctEvaluator<'a> {
    pub fn new(game: &'a dyn GameModel, oracle: &'a dyn Oracle, config: PUCTPlayerConfig) -> Self {
        Self {
            game,
            oracle,
            config,
            tree: None,
        }
    }

    /// Establish (or reuse) the root for `state`, predicting it if needed
    /// and optionally pre-expanding its top `expand_root` children in one
    /// batch. Pre-expansion happens strictly after the root prediction is
    /// applied, since normalisation re-sorts children by policy.
    pub async fn establish_root(&mut self, state: &State) -> Result<(), SearchError> {
        if self.tree.is_none() {
            self.tree = Some(SearchTree::with_root_state(state.clone(), self.game));
        }
        let tree = self.tree.as_mut().unwrap();
        if tree.root >= tree.nodes.len() || tree.nodes[tree.root].state != *state {
            *tree = SearchTree::with_root_state(state.clone(), self.game);
        }
        let root = tree.root;
        tree.predict_node(root, self.oracle).await?;

        if self.config.expand_root > 0 && !tree.nodes[root].is_terminal {
            let count = (self.config.expand_root as usize).min(tree.nodes[root].children.len());
            let mut requests = Vec::with_capacity(count);
            let mut new_states = Vec::with_capacity(count);
            for i in 0..count {
                let action = tree.nodes[root].children[i].action;
                let next_state = self.game.apply(&tree.nodes[root].state, action);
                let legal_actions = self.game.legal_actions(&next_state);
                let lead_role_index = self.game.lead_role_index(&next_state);
                requests.push(PredictRequest {
                    state: next_state.clone(),
                    legal_actions,
                    lead_role_index,
                });
                new_states.push(next_state);
            }
            // Terminal children never reach the oracle batch; they're
            // created and scored directly from the game model. `pred_iter`
            // below relies on `pending_requests` preserving `new_states`'
            // relative order.
            let mut pending_requests = Vec::new();
            for (i, next_state) in new_states.iter().enumerate() {
                if !self.game.is_terminal(next_state) {
                    pending_requests.push(requests[i].clone());
                }
            }
            let predictions = if pending_requests.is_empty() {
                Vec::new()
            } else {
                self.oracle.predict_batch(&pending_requests).await?
            };

            let tree = self.tree.as_mut().unwrap();
            let mut pred_iter = predictions.into_iter();
            for (i, next_state) in new_states.into_iter().enumerate() {
                let mut new_node = Node::new_unexpanded(next_state, Some(root), self.game);
                if !new_node.is_terminal {
                    let prediction = pred_iter.next().expect("one prediction per pending child");
                    new_node.final_score = prediction.value_per_role;
                    new_node.mc_score = new_node.final_score.clone();
                    for child in new_node.children.iter_mut() {
                        child.policy_prob = prediction.policy.get(&child.action).copied().unwrap_or(0.0);
                    }
                    normalise(&mut new_node.children);
                    new_node
                        .children
                        .sort_by(|a, b| b.policy_prob.partial_cmp(&a.policy_prob).unwrap());
                }
                new_node.predicted = true;
                let new_idx = tree.add_node(new_node);
                tree.nodes[root].children[i].to_node = Some(new_idx);
            }
        }
        Ok(())
    }

    /// Run one playout: select from the root to a leaf, expand it if
    /// necessary, and back-propagate the resulting per-role scores.
    async fn playout(&mut self, rng: &mut impl Rng, disable_root_noise: bool) -> Result<(), SearchError> {
        let mut path = vec![self.tree.as_ref().unwrap().root];
        let mut depth = 0u32;

        let scores = loop {
            let node_idx = *path.last().unwrap();
            if self.tree.as_ref().unwrap().nodes[node_idx].is_terminal {
                break self.tree.as_ref().unwrap().nodes[node_idx].mc_score.clone();
            }

            let child_slot = self.select_child(node_idx, depth, rng, disable_root_noise);
            let to_node = self.tree.as_ref().unwrap().nodes[node_idx].children[child_slot].to_node;

            if let Some(child_idx) = to_node {
                path.push(child_idx);
                depth += 1;
                continue;
            }

            let action = self.tree.as_ref().unwrap().nodes[node_idx].children[child_slot].action;
            let parent_state = self.tree.as_ref().unwrap().nodes[node_idx].state.clone();
            let new_state = self.game.apply(&parent_state, action);
            let new_node = Node::new_unexpanded(new_state, Some(node_idx), self.game);
            let tree = self.tree.as_mut().unwrap();
            let new_idx = tree.add_node(new_node);
            tree.nodes[node_idx].children[child_slot].to_node = Some(new_idx);
            tree.predict_node(new_idx, self.oracle).await?;
            path.push(new_idx);
            break self.tree.as_ref().unwrap().nodes[new_idx].mc_score.clone();
        };

        let tree = self.tree.as_mut().unwrap();
        for &idx in path.iter().rev() {
            let node = &mut tree.nodes[idx];
            let visits = node.mc_visits as f64;
            for i in 0..scores.len().min(node.mc_score.len()) {
                node.mc_score[i] = (visits * node.mc_score[i] + scores[i]) / (visits + 1.0);
            }
            node.mc_visits += 1;
        }
        Ok(())
    }

    /// PUCT child selection at `node_idx`, depth `depth` of the current
    /// descent (0 == root). Optional Dirichlet noise is applied only at
    /// depth 0, and only affects this selection call's scoring, never the
    /// stored `policy_prob`.
    fn select_child(
        &self,
        node_idx: usize,
        depth: u32,
        rng: &mut impl Rng,
        disable_root_noise: bool,
    ) -> usize {
        let tree = self.tree.as_ref().unwrap();
        let node = &tree.nodes[node_idx];

        let expanded_children = node.children.iter().filter(|c| c.to_node.is_some()).count();
        let threshold = if depth == 0 {
            self.config.puct_before_root_expansions
        } else {
            self.config.puct_before_expansions
        } as usize;
        let mut puct_const = if expanded_children < threshold {
            self.config.puct_constant_before
        } else {
            self.config.puct_constant_after
        };
        if self.config.puct_constant_tune {
            puct_const *= node.final_score[node.lead_role_index as usize];
        }

        let blended: Option<Vec<f64>> = if depth == 0
            && !disable_root_noise
            && self.config.dirichlet_noise_alpha >= 0.0
            && !node.children.is_empty()
        {
            let noise = sample_dirichlet(self.config.dirichlet_noise_alpha, node.children.len(), rng);
            let eps = self.config.dirichlet_noise_pct;
            Some(
                node.children
                    .iter()
                    .zip(noise.iter())
                    .map(|(c, n)| (1.0 - eps) * c.policy_prob + eps * n)
                    .collect(),
            )
        } else {
            None
        };

        let mut best_idx = 0usize;
        let mut best_score = f64::NEG_INFINITY;
        for (i, child) in node.children.iter().enumerate() {
            let child_pct = blended.as_ref().map(|b| b[i]).unwrap_or(child.policy_prob);
            let (child_visits, node_score) = match child.to_node {
                Some(cn_idx) => {
                    let cn = &tree.nodes[cn_idx];
                    let raw = cn.mc_score[node.lead_role_index as usize];
                    let scored = if cn.is_terminal { raw * 1.02 } else { raw };
                    (cn.mc_visits, scored)
                }
                None => (0, 0.0),
            };
            let puct_score =
                puct_const * child_pct * ((node.mc_visits as f64 + 1.0).sqrt()) / (child_visits as f64 + 1.0);
            let jitter = rng.gen::<f64>() * 1e-9;
            let score = node_score + puct_score + jitter;
            if score > best_score {
                best_score = score;
                best_idx = i;
            }
        }
        best_idx
    }

    /// Run playouts until `budget` is exhausted, then choose a move per
    /// `config.choose`. `game_depth` is the move index within the game,
    /// used only by `choose_temperature`.
    pub async fn search(
        &mut self,
        root_state: &State,
        budget: Budget,
        game_depth: u32,
        rng: &mut impl Rng,
    ) -> Result<Action, SearchError> {
        self.establish_root(root_state).await?;

        let mut done = 0u32;
        while !budget.exhausted(done) {
            self.playout(rng, false).await?;
            done += 1;
        }

        let action = match self.config.choose {
            ChooseStrategy::ChooseTopVisits => self.choose_top_visits(),
            ChooseStrategy::ChooseConverge => self.choose_converge(budget, rng).await?,
            ChooseStrategy::ChooseTemperature => self.choose_temperature(game_depth, rng),
        };

        self.apply_external_move(action);
        Ok(action)
    }

    fn root_children(&self) -> &[Child] {
        &self.tree.as_ref().unwrap().nodes[self.tree.as_ref().unwrap().root].children
    }

    fn visits_of(&self, child: &Child) -> u32 {
        child
            .to_node
            .map(|idx| self.tree.as_ref().unwrap().nodes[idx].mc_visits)
            .unwrap_or(0)
    }

    fn score_of(&self, child: &Child) -> f64 {
        let tree = self.tree.as_ref().unwrap();
        let lead = tree.nodes[tree.root].lead_role_index as usize;
        match child.to_node {
            Some(idx) => tree.nodes[idx].mc_score[lead],
            None => 0.0,
        }
    }

    fn choose_top_visits(&self) -> Action {
        let children = self.root_children();
        let mut best = 0usize;
        let mut best_visits = self.visits_of(&children[0]);
        for (i, c) in children.iter().enumerate().skip(1) {
            let v = self.visits_of(c);
            if v > best_visits {
                best_visits = v;
                best = i;
            }
        }
        children[best].action
    }

    fn best_by_score_index(&self) -> usize {
        let children = self.root_children();
        let mut best = 0usize;
        let mut best_score = self.score_of(&children[0]);
        for (i, c) in children.iter().enumerate().skip(1) {
            let s = self.score_of(c);
            if s > best_score {
                best_score = s;
                best = i;
            }
        }
        best
    }

    fn best_by_visits_index(&self) -> usize {
        let children = self.root_children();
        let mut best = 0usize;
        let mut best_visits = self.visits_of(&children[0]);
        for (i, c) in children.iter().enumerate().skip(1) {
            let v = self.visits_of(c);
            if v > best_visits {
                best_visits = v;
                best = i;
            }
        }
        best
    }

    /// Returns immediately once the leading score is decisive (>=0.9 or
    /// <=0.1); otherwise re-searches with root Dirichlet noise disabled
    /// until best-by-visits and best-by-score agree or the deadline passes.
    async fn choose_converge(&mut self, budget: Budget, rng: &mut impl Rng) -> Result<Action, SearchError> {
        let best_visits_idx = self.best_by_visits_index();
        let leading_score = self.score_of(&self.root_children()[best_visits_idx]);
        if leading_score >= 0.9 || leading_score <= 0.1 {
            return Ok(self.root_children()[best_visits_idx].action);
        }

        loop {
            let by_visits = self.best_by_visits_index();
            let by_score = self.best_by_score_index();
            if by_visits == by_score {
                break;
            }
            if let Budget::Deadline(at) = budget {
                if Instant::now() >= at {
                    break;
                }
            }
            self.playout(rng, true).await?;
        }
        Ok(self.root_children()[self.best_by_visits_index()].action)
    }

    /// Early-game exploration: weight children by
    /// `((visits+1)/total_visits)^temp`, normalise, and sample by
    /// inverse-CDF against `U(0, random_scale)`.
    fn choose_temperature(&self, game_depth: u32, rng: &mut impl Rng) -> Action {
        let cfg = &self.config;
        if game_depth > cfg.depth_temperature_stop {
            return self.choose_top_visits();
        }
        let depth = ((game_depth.saturating_sub(cfg.depth_temperature_start)) as f64
            * cfg.depth_temperature_increment)
            .max(1.0);
        let temp = cfg.temperature * depth;

        let children = self.root_children();
        let total_visits: f64 = children.iter().map(|c| self.visits_of(c) as f64).sum::<f64>().max(1.0);
        let mut weights: Vec<f64> = children
            .iter()
            .map(|c| ((self.visits_of(c) as f64 + 1.0) / total_visits).powf(temp))
            .collect();
        let sum: f64 = weights.iter().sum::<f64>().max(1e-12);
        for w in weights.iter_mut() {
            *w /= sum;
        }

        let target = rng.gen::<f64>() * cfg.random_scale;
        let mut cumulative = 0.0;
        for (i, w) in weights.iter().enumerate() {
            cumulative += w;
            if cumulative >= target {
                return children[i].action;
            }
        }
        children.last().unwrap().action
    }

    /// Visit-count distribution over the root's children, sorted by
    /// descending visits; this is the probability distribution the search
    /// contract returns alongside the chosen action.
    pub fn visit_distribution(&self) -> Vec<(Action, f64)> {
        let children = self.root_children();
        let total: u32 = children.iter().map(|c| self.visits_of(c)).sum();
        let total = total.max(1) as f64;
        let mut dist: Vec<(Action, f64)> = children
            .iter()
            .map(|c| (c.action, self.visits_of(c) as f64 / total))
            .collect();
        dist.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        dist
    }

    /// Re-root the persistent tree on an externally applied move: if the
    /// played child has been expanded, its subtree becomes the new root;
    /// otherwise the tree is discarded (the next `establish_root` rebuilds
    /// from scratch). All sibling subtrees are abandoned.
    pub fn apply_external_move(&mut self, action: Action) {
        let tree = match self.tree.as_mut() {
            Some(t) => t,
            None => return,
        };
        let root = tree.root;
        let played = tree.nodes[root].children.iter().find(|c| c.action == action).cloned();
        match played.and_then(|c| c.to_node) {
            Some(new_root) => {
                tree.root = new_root;
                tree.nodes[new_root].parent = None;
            }
            None => {
                self.tree = None;
            }
        }
    }
}
