//! The generation coordinator: accumulates samples from self-play workers,
//! drives training rounds against a registered trainer, and rolls over to
//! the next generation. Concurrency is logically single-threaded — every
//! method here assumes exclusive access to `Coordinator`, and the binary
//! that owns it routes all worker events through one task.

pub mod server;
pub mod session;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use uuid::Uuid;

use crate::config::{SaveKind, ServerConfig};
use crate::error::{CoordinatorError, PipelineResult};
use crate::protocol::Message;
use crate::sample::{Generation, Sample, State};
use session::{WorkerKind, WorkerSession};

/// Where the coordinator is in the roll cycle. Every transition besides a
/// fatal error eventually returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Writing,
    Training,
    Rolling,
    PostCmds,
}

/// The single coordinator value driving one run of the pipeline.
pub struct Coordinator {
    pub config: ServerConfig,
    pub config_path: PathBuf,
    pub phase: Phase,

    pub workers: HashMap<Uuid, WorkerSession>,
    pub the_trainer: Option<Uuid>,

    accumulated_samples: Vec<Sample>,
    /// Parallel to `accumulated_samples`: every accepted state in arrival
    /// order, the basis workers' cursors are sliced against. Kept the same
    /// length as `accumulated_samples` at all times (I1).
    unique_states_sequence: Vec<State>,
    seen_states: HashSet<State>,
    pending_trainings: u32,
}

impl Coordinator {
    pub fn new(config: ServerConfig, config_path: PathBuf) -> Self {
        Self {
            config,
            config_path,
            phase: Phase::Idle,
            workers: HashMap::new(),
            the_trainer: None,
            accumulated_samples: Vec::new(),
            unique_states_sequence: Vec::new(),
            seen_states: HashSet::new(),
            pending_trainings: 0,
        }
    }

    /// Current generation label workers should train/play against.
    pub fn current_generation(&self) -> String {
        format!("{}{}", self.config.generation_prefix, self.config.current_step)
    }

    /// Remaining room in the in-flight generation before a training round
    /// should begin.
    pub fn capacity(&self) -> usize {
        self.config
            .generation_size
            .saturating_sub(self.accumulated_samples.len())
    }

    /// Ceiling on accumulated samples while a training round may still be
    /// in flight: `generation_size * (1 + max_growth_while_training)`.
    fn growth_ceiling(&self) -> usize {
        let ceiling =
            self.config.generation_size as f64 * (1.0 + self.config.max_growth_while_training);
        ceiling.floor() as usize
    }

    /// Whether the coordinator still wants more self-play samples. False
    /// once the growth ceiling is hit, independent of `ready_to_train`,
    /// which fires at the lower plain `generation_size` threshold.
    pub fn wants_more_samples(&self) -> bool {
        self.accumulated_samples.len() < self.growth_ceiling()
    }

    pub fn num_accumulated(&self) -> usize {
        self.accumulated_samples.len()
    }

    // --- worker lifecycle -------------------------------------------------

    pub fn connect_worker(&mut self, id: Uuid) {
        self.workers.insert(id, WorkerSession::new());
    }

    /// Drop a disconnected worker's session. No resume: a reconnecting
    /// worker gets a brand new session and starts over at sample index 0.
    pub fn disconnect_worker(&mut self, id: Uuid) {
        self.workers.remove(&id);
        if self.the_trainer == Some(id) {
            self.the_trainer = None;
        }
    }

    pub fn declare_self_play(&mut self, id: Uuid) {
        if let Some(session) = self.workers.get_mut(&id) {
            session.kind = WorkerKind::SelfPlay;
        }
    }

    /// Register `id` as the trainer. Fatal if a different trainer is
    /// already registered.
    pub fn declare_trainer(&mut self, id: Uuid) -> PipelineResult<()> {
        if let Some(existing) = self.the_trainer {
            if existing != id {
                return Err(CoordinatorError::DuplicateTrainer.into());
            }
        }
        if let Some(session) = self.workers.get_mut(&id) {
            session.kind = WorkerKind::Trainer;
        }
        self.the_trainer = Some(id);
        Ok(())
    }

    /// Drive the handshake/steady-state schedule for every connected
    /// self-play worker: query not-yet-configured workers for their
    /// networks, and hand configured workers their next slice of known
    /// states once capacity allows. A configured worker with an answer
    /// still outstanding, or one we don't want more samples from right
    /// now, is left parked until its next interaction.
    pub fn schedule_free_workers(&mut self) -> Vec<(Uuid, Message)> {
        let game = self.config.game.clone();
        let generation = self.current_generation();
        let wants_more = self.wants_more_samples();
        let sequence_len = self.unique_states_sequence.len();
        let mut outgoing = Vec::new();

        for (&id, session) in self.workers.iter_mut() {
            if session.kind != WorkerKind::SelfPlay {
                continue;
            }
            if !session.configured {
                if !session.query_sent {
                    session.query_sent = true;
                    outgoing.push((
                        id,
                        Message::SelfPlayQuery {
                            game: game.clone(),
                            policy_gen: generation.clone(),
                            score_gen: generation.clone(),
                        },
                    ));
                }
                continue;
            }
            if wants_more && !session.pending_request {
                let new_states =
                    self.unique_states_sequence[session.next_unseen_sample_index..].to_vec();
                session.next_unseen_sample_index = sequence_len;
                session.pending_request = true;
                outgoing.push((id, Message::RequestSample { new_states }));
            }
        }
        outgoing
    }

    /// Compose `ConfigureApproxTrainer` for a self-play worker that just
    /// confirmed, via `SelfPlayResponse`, that it has the current
    /// generation's networks available.
    pub fn configure_self_play_worker(&self) -> Message {
        let generation = self.current_generation();
        Message::ConfigureApproxTrainer {
            game: self.config.game.clone(),
            policy_generation: generation.clone(),
            score_generation: generation,
            temperature: self.config.policy_player_conf.temperature,
            policy_puct_player_conf: self.config.policy_player_conf.clone(),
            score_puct_player_conf: self.config.score_player_conf.clone(),
        }
    }

    /// A self-play worker has answered `Ok("configured")`; it is now
    /// eligible for `RequestSample` scheduling.
    pub fn mark_configured(&mut self, id: Uuid) {
        if let Some(session) = self.workers.get_mut(&id) {
            session.configured = true;
        }
    }

    // --- sample ingest ------------------------------------------------

    /// Append `sample` if its state has not already been accumulated this
    /// generation. Returns whether it was newly added.
    pub fn ingest_sample(&mut self, sample: Sample) -> bool {
        if self.seen_states.contains(&sample.state) {
            return false;
        }
        self.seen_states.insert(sample.state.clone());
        self.unique_states_sequence.push(sample.state.clone());
        self.accumulated_samples.push(sample);
        true
    }

    /// Absorb a worker's `RequestSampleResponse`: its freshly produced
    /// sample, if any, is ingested (duplicates are simply dropped; the
    /// caller logs `duplicates_seen` as a warning), and the worker's
    /// in-flight request is cleared so it can be rescheduled. Returns
    /// whether the sample was newly added.
    pub fn handle_request_sample_response(&mut self, worker: Uuid, sample: Option<Sample>) -> bool {
        if let Some(session) = self.workers.get_mut(&worker) {
            session.pending_request = false;
        }
        match sample {
            Some(sample) => self.ingest_sample(sample),
            None => false,
        }
    }

    // --- training round -------------------------------------------------

    /// True once the in-flight generation is full and a training round
    /// should begin.
    pub fn ready_to_train(&self) -> bool {
        self.phase == Phase::Idle && self.capacity() == 0
    }

    /// Snapshot the accumulated samples to a write-once generation file and
    /// advance to `Training`. Only the first `generation_size` samples are
    /// snapshotted; any overflow accrued while training was still pending
    /// (via `max_growth_while_training`) carries over as the new
    /// generation's starting prefix rather than being dropped.
    pub fn write_generation(&mut self) -> PipelineResult<PathBuf> {
        let generation_label = self.current_generation();
        let take_count = self.config.generation_size.min(self.accumulated_samples.len());
        let overflow = self.accumulated_samples.split_off(take_count);
        let samples = std::mem::replace(&mut self.accumulated_samples, overflow);
        let states_overflow = self.unique_states_sequence.split_off(take_count);
        self.unique_states_sequence = states_overflow;
        let consumed: HashSet<State> = samples.iter().map(|s| s.state.clone()).collect();
        self.seen_states.retain(|s| !consumed.contains(s));
        debug_assert_eq!(self.accumulated_samples.len(), self.unique_states_sequence.len());
        debug_assert_eq!(self.accumulated_samples.len(), self.seen_states.len());
        let generation = Generation::new(
            self.config.game.clone(),
            generation_label.clone(),
            generation_label,
            samples,
        );
        let path = generation.write_once(&self.config.store_path, self.config.current_step)?;
        self.phase = Phase::Writing;
        Ok(path)
    }

    /// Compose the `TrainNNRequest`(s) for this round: one if the policy and
    /// score networks share a size, two otherwise.
    pub fn compose_train_requests(&self) -> Vec<Message> {
        let generation = self.current_generation();
        let base = |network_size: &str| Message::TrainNNRequest {
            game: self.config.game.clone(),
            generation_prefix: self.config.generation_prefix.clone(),
            store_path: self.config.store_path.display().to_string(),
            current_step: self.config.current_step,
            network_size: network_size.to_string(),
            generation: generation.clone(),
            validation_split: self.config.validation_split,
            batch_size: self.config.batch_size,
            epochs: self.config.epochs,
        };
        if self.config.networks_differ() {
            vec![
                base(network_size_label(self.config.policy_network_size)),
                base(network_size_label(self.config.score_network_size)),
            ]
        } else {
            vec![base(network_size_label(self.config.policy_network_size))]
        }
    }

    /// Begin the training round: requires a registered trainer, sends the
    /// composed requests, and moves to `Training`.
    pub fn begin_training(&mut self) -> PipelineResult<Vec<Message>> {
        if self.the_trainer.is_none() {
            return Err(CoordinatorError::NoTrainer.into());
        }
        let requests = self.compose_train_requests();
        self.pending_trainings = requests.len() as u32;
        self.phase = Phase::Training;
        Ok(requests)
    }

    /// Acknowledge one `Ok("network_trained")` from the trainer. Once every
    /// pending training completes, advances to `Rolling`.
    pub fn ack_training(&mut self) -> PipelineResult<()> {
        if self.the_trainer.is_none() {
            return Err(CoordinatorError::NoTrainer.into());
        }
        self.pending_trainings = self.pending_trainings.saturating_sub(1);
        if self.pending_trainings == 0 {
            self.phase = Phase::Rolling;
        }
        Ok(())
    }

    /// Advance the step counter, persist the config with roll-style
    /// backup naming, and move to `PostCmds`.
    pub fn roll_generation(&mut self) -> PipelineResult<()> {
        self.config.current_step += 1;
        self.config.save(&self.config_path, SaveKind::Roll)?;
        for session in self.workers.values_mut() {
            session.reset_for_rollover();
        }
        self.phase = Phase::PostCmds;
        Ok(())
    }

    /// Run (conceptually) `run_post_training_cmds`, then return to `Idle`.
    /// The commands themselves are an external-process concern out of scope
    /// here; only the phase transition is modelled.
    pub fn finish_post_cmds(&mut self) {
        self.phase = Phase::Idle;
    }
}

fn network_size_label(size: crate::config::NetworkSize) -> &'static str {
    use crate::config::NetworkSize::*;
    match size {
        Tiny => "tiny",
        Smaller => "smaller",
        Small => "small",
        Normal => "normal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Sample;
    use std::collections::HashMap as Map;

    fn sample(bits: &[u8]) -> Sample {
        Sample {
            state: State::new(bits.to_vec()),
            policy: Map::from([(0, 1.0)]),
            final_score: vec![0.5, 0.5],
            depth: 1,
            game_length: 5,
            lead_role_index: 0,
        }
    }

    fn coordinator(generation_size: usize) -> Coordinator {
        let mut config = ServerConfig::default();
        config.generation_size = generation_size;
        config.store_path = std::env::temp_dir().join(format!("zero-pipeline-coord-{}", Uuid::new_v4()));
        Coordinator::new(config, std::env::temp_dir().join("unused-conf.json"))
    }

    /// I1: duplicate states are not appended twice.
    #[test]
    fn duplicate_sample_is_not_ingested_twice() {
        let mut c = coordinator(10);
        assert!(c.ingest_sample(sample(&[0, 0])));
        assert!(!c.ingest_sample(sample(&[0, 0])));
        assert_eq!(c.num_accumulated(), 1);
    }

    #[test]
    fn capacity_reflects_remaining_room() {
        let mut c = coordinator(2);
        assert_eq!(c.capacity(), 2);
        c.ingest_sample(sample(&[1]));
        assert_eq!(c.capacity(), 1);
        c.ingest_sample(sample(&[2]));
        assert_eq!(c.capacity(), 0);
        assert!(c.ready_to_train());
    }

    /// S6-shaped: a second distinct worker trying to register as trainer
    /// while one is already registered is fatal.
    #[test]
    fn duplicate_trainer_registration_is_fatal() {
        let mut c = coordinator(10);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        c.connect_worker(a);
        c.connect_worker(b);
        c.declare_trainer(a).unwrap();
        assert!(c.declare_trainer(b).is_err());
    }

    /// Full round: write -> train -> roll -> idle, with the step counter
    /// advanced and the config rollover backup written.
    #[test]
    fn full_round_sequences_through_every_phase() {
        let mut c = coordinator(1);
        let trainer = Uuid::new_v4();
        c.connect_worker(trainer);
        c.declare_trainer(trainer).unwrap();
        c.ingest_sample(sample(&[0]));
        assert!(c.ready_to_train());

        c.write_generation().unwrap();
        assert_eq!(c.phase, Phase::Writing);

        let requests = c.begin_training().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(c.phase, Phase::Training);

        c.ack_training().unwrap();
        assert_eq!(c.phase, Phase::Rolling);

        let step_before = c.config.current_step;
        c.roll_generation().unwrap();
        assert_eq!(c.config.current_step, step_before + 1);
        assert_eq!(c.phase, Phase::PostCmds);

        c.finish_post_cmds();
        assert_eq!(c.phase, Phase::Idle);

        std::fs::remove_dir_all(&c.config.store_path).ok();
    }

    /// I5: a rollover preserves the tail of `accumulated_samples` beyond
    /// `generation_size` as the new generation's starting prefix.
    #[test]
    fn rollover_preserves_overflow_tail() {
        let mut c = coordinator(2);
        c.ingest_sample(sample(&[0]));
        c.ingest_sample(sample(&[1]));
        c.ingest_sample(sample(&[2])); // accrued past capacity during training
        assert_eq!(c.num_accumulated(), 3);

        c.write_generation().unwrap();
        assert_eq!(c.num_accumulated(), 1);
        assert!(c.ingest_sample(sample(&[2])) == false, "state [2] is still tracked as seen");

        std::fs::remove_dir_all(&c.config.store_path).ok();
    }

    /// S1: two workers reporting the same state both get deduplicated to a
    /// single retained sample.
    #[test]
    fn duplicate_state_from_two_workers_keeps_one_sample() {
        let mut c = coordinator(4);
        assert!(c.ingest_sample(sample(&[0, 0, 1, 0])));
        assert!(!c.ingest_sample(sample(&[0, 0, 1, 0])));
        assert_eq!(c.num_accumulated(), 1);
    }

    /// S2: matching network sizes produce exactly one TrainNNRequest.
    #[test]
    fn matching_network_sizes_produce_one_train_request() {
        let mut c = coordinator(2);
        c.config.policy_network_size = crate::config::NetworkSize::Normal;
        c.config.score_network_size = crate::config::NetworkSize::Normal;
        let trainer = Uuid::new_v4();
        c.connect_worker(trainer);
        c.declare_trainer(trainer).unwrap();
        c.ingest_sample(sample(&[0]));
        c.ingest_sample(sample(&[1]));
        c.write_generation().unwrap();
        let requests = c.begin_training().unwrap();
        assert_eq!(requests.len(), 1);
        std::fs::remove_dir_all(&c.config.store_path).ok();
    }

    /// S3: differing network sizes produce two TrainNNRequests, and
    /// rollover only happens once both are acknowledged.
    #[test]
    fn differing_network_sizes_produce_two_train_requests_and_wait_for_both() {
        let mut c = coordinator(2);
        c.config.policy_network_size = crate::config::NetworkSize::Small;
        c.config.score_network_size = crate::config::NetworkSize::Normal;
        let trainer = Uuid::new_v4();
        c.connect_worker(trainer);
        c.declare_trainer(trainer).unwrap();
        c.ingest_sample(sample(&[0]));
        c.ingest_sample(sample(&[1]));
        c.write_generation().unwrap();
        let requests = c.begin_training().unwrap();
        assert_eq!(requests.len(), 2);

        c.ack_training().unwrap();
        assert_eq!(c.phase, Phase::Training, "only one of two acks received");
        c.ack_training().unwrap();
        assert_eq!(c.phase, Phase::Rolling);

        std::fs::remove_dir_all(&c.config.store_path).ok();
    }

    #[test]
    fn disconnecting_the_trainer_clears_its_slot() {
        let mut c = coordinator(10);
        let trainer = Uuid::new_v4();
        c.connect_worker(trainer);
        c.declare_trainer(trainer).unwrap();
        c.disconnect_worker(trainer);
        assert!(c.the_trainer.is_none());
    }

    /// Capacity: the growth ceiling, not the plain `generation_size`
    /// threshold, gates whether more samples are still wanted.
    #[test]
    fn growth_ceiling_extends_past_generation_size() {
        let mut c = coordinator(2);
        c.config.max_growth_while_training = 0.5; // ceiling = 3
        c.ingest_sample(sample(&[0]));
        c.ingest_sample(sample(&[1]));
        assert!(c.ready_to_train(), "plain generation_size threshold reached");
        assert!(c.wants_more_samples(), "growth ceiling not yet reached");
        c.ingest_sample(sample(&[2]));
        assert!(!c.wants_more_samples(), "growth ceiling of 3 reached");
    }

    /// An unconfigured self-play worker is sent `SelfPlayQuery` exactly
    /// once; a configured one with room to grow gets `RequestSample` with
    /// every state accrued since its cursor, and a worker with a request
    /// already in flight is left parked.
    #[test]
    fn schedule_free_workers_drives_handshake_then_sample_requests() {
        let mut c = coordinator(10);
        let worker = Uuid::new_v4();
        c.connect_worker(worker);
        c.declare_self_play(worker);

        let outgoing = c.schedule_free_workers();
        assert_eq!(outgoing.len(), 1);
        assert!(matches!(outgoing[0].1, Message::SelfPlayQuery { .. }));
        assert!(c.schedule_free_workers().is_empty(), "query not resent");

        c.mark_configured(worker);
        c.ingest_sample(sample(&[0, 0]));
        let outgoing = c.schedule_free_workers();
        assert_eq!(outgoing.len(), 1);
        match &outgoing[0].1 {
            Message::RequestSample { new_states } => assert_eq!(new_states.len(), 1),
            other => panic!("expected RequestSample, got {other:?}"),
        }

        assert!(
            c.schedule_free_workers().is_empty(),
            "worker stays parked while its request is in flight"
        );
    }

    /// S1-shaped: a worker's own freshly produced sample is ingested from
    /// `RequestSampleResponse`, and a duplicate is dropped without being
    /// double-counted, while the worker's in-flight flag always clears.
    #[test]
    fn request_sample_response_ingests_and_clears_in_flight() {
        let mut c = coordinator(10);
        let worker = Uuid::new_v4();
        c.connect_worker(worker);
        if let Some(session) = c.workers.get_mut(&worker) {
            session.pending_request = true;
        }

        assert!(c.handle_request_sample_response(worker, Some(sample(&[0, 0, 1, 0]))));
        assert!(!c.workers[&worker].pending_request);
        assert_eq!(c.num_accumulated(), 1);

        if let Some(session) = c.workers.get_mut(&worker) {
            session.pending_request = true;
        }
        assert!(!c.handle_request_sample_response(worker, Some(sample(&[0, 0, 1, 0]))));
        assert_eq!(c.num_accumulated(), 1, "duplicate state is dropped");
    }

    /// roll_generation resets every worker's handshake/cursor state, not
    /// just its `configured` flag.
    #[test]
    fn roll_generation_resets_worker_sessions() {
        let mut c = coordinator(1);
        let trainer = Uuid::new_v4();
        c.connect_worker(trainer);
        c.declare_trainer(trainer).unwrap();
        let worker = Uuid::new_v4();
        c.connect_worker(worker);
        if let Some(session) = c.workers.get_mut(&worker) {
            session.configured = true;
            session.query_sent = true;
            session.pending_request = true;
            session.next_unseen_sample_index = 7;
        }
        c.ingest_sample(sample(&[0]));
        c.write_generation().unwrap();
        c.begin_training().unwrap();
        c.ack_training().unwrap();
        c.roll_generation().unwrap();

        let session = &c.workers[&worker];
        assert!(!session.configured);
        assert!(!session.query_sent);
        assert!(!session.pending_request);
        assert_eq!(session.next_unseen_sample_index, 0);

        std::fs::remove_dir_all(&c.config.store_path).ok();
    }
}
