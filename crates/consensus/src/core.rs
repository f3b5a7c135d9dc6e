use std::collections::{BTreeMap, HashMap};

use alloy_rlp::Decodable;
use tessera_primitives::{Address, Bytes, B256};
use tessera_types::{Block, Committee};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::backlog::BacklogEntry;
use crate::config::Config;
use crate::error::{ConsensusError, InvalidMessage};
use crate::message::{commit_seal_input, Message, MsgCode, Proposal, Step, Vote};
use crate::messages::{AddVote, MessagesMap};
use crate::timeout::{StepTimeout, TimeoutEvent};

/// Internal events posted back into the engine loop by timers and by the
/// engine itself.
#[derive(Debug)]
pub(crate) enum CoreEvent {
    Timeout(TimeoutEvent),
    /// A proposal whose block becomes valid after a delay is fed back later.
    Requeue(Message),
    /// A commit ended the height; initialize the next one on the next tick.
    AdvanceHeight,
}

/// The per-height consensus state machine. Strictly single-threaded: only the
/// engine event loop touches it, one event at a time.
pub(crate) struct Core<B: Backend> {
    pub(crate) backend: B,
    pub(crate) config: Config,
    pub(crate) address: Address,

    pub(crate) height: u64,
    pub(crate) round: u64,
    pub(crate) step: Step,
    pub(crate) committee: Committee,

    pub(crate) messages: MessagesMap,
    pub(crate) locked_round: Option<u64>,
    pub(crate) locked_value: Option<Block>,
    pub(crate) valid_round: Option<u64>,
    pub(crate) valid_value: Option<Block>,

    pub(crate) sent_prevote: bool,
    pub(crate) sent_precommit: bool,
    // Latch for the once-per-round "first prevote quorum observed" rule.
    pub(crate) valid_value_seen: bool,
    pub(crate) committed: bool,

    pub(crate) backlogs: HashMap<Address, Vec<BacklogEntry>>,
    pub(crate) backlog_unchecked: BTreeMap<u64, Vec<Message>>,
    pub(crate) future_round_change: BTreeMap<u64, HashMap<Address, u64>>,

    pub(crate) propose_timeout: StepTimeout,
    pub(crate) prevote_timeout: StepTimeout,
    pub(crate) precommit_timeout: StepTimeout,
    pub(crate) event_tx: mpsc::UnboundedSender<CoreEvent>,
}

impl<B: Backend> Core<B> {
    pub(crate) fn new(backend: B, config: Config) -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let address = backend.address();
        let core = Self {
            backend,
            config,
            address,
            height: 0,
            round: 0,
            step: Step::Propose,
            committee: Committee::default(),
            messages: MessagesMap::new(),
            locked_round: None,
            locked_value: None,
            valid_round: None,
            valid_value: None,
            sent_prevote: false,
            sent_precommit: false,
            valid_value_seen: false,
            committed: false,
            backlogs: HashMap::new(),
            backlog_unchecked: BTreeMap::new(),
            future_round_change: BTreeMap::new(),
            propose_timeout: StepTimeout::default(),
            prevote_timeout: StepTimeout::default(),
            precommit_timeout: StepTimeout::default(),
            event_tx,
        };
        (core, event_rx)
    }

    // --- round lifecycle ---

    /// Enters the given round at step PROPOSE. Round 0 also turns the height
    /// over from the backend's latest committed block.
    pub(crate) fn start_round(&mut self, round: u64) -> Result<(), ConsensusError> {
        if round == 0 {
            self.begin_height()?;
        }

        self.round = round;
        self.step = Step::Propose;
        self.sent_prevote = false;
        self.sent_precommit = false;
        self.valid_value_seen = false;
        self.future_round_change = self.future_round_change.split_off(&(round + 1));
        self.cancel_timeouts();

        debug!(height = self.height, round, "entering round");

        let proposer = self.committee.proposer(self.height, round).address;
        if proposer == self.address {
            let block = match &self.valid_value {
                Some(block) => block.clone(),
                None => self
                    .backend
                    .build_block(self.height)
                    .map_err(Self::backend_fault)?,
            };
            info!(
                height = self.height,
                round,
                hash = %block.hash(),
                "proposing block"
            );
            let proposal = Proposal {
                round,
                height: self.height,
                valid_round: self.valid_round,
                block,
            };
            let msg = self.sign_message(
                MsgCode::Proposal,
                alloy_rlp::encode(&proposal).into(),
                None,
            )?;
            self.broadcast_and_process(msg)?;
        } else {
            self.propose_timeout.schedule(
                self.event_tx.clone(),
                self.config.timeout(Step::Propose, round),
                TimeoutEvent {
                    height: self.height,
                    round,
                    step: Step::Propose,
                },
            );
        }

        if round == 0 {
            self.process_unchecked_backlog();
        }
        self.process_backlog();
        Ok(())
    }

    fn begin_height(&mut self) -> Result<(), ConsensusError> {
        let (last_block, _last_proposer) = self.backend.last_committed();
        let height = last_block.number() + 1;
        let committee = self
            .backend
            .committee(last_block.hash())
            .map_err(Self::backend_fault)?;
        if committee.is_empty() {
            return Err(ConsensusError::Backend(format!(
                "empty committee for height {height}"
            )));
        }

        info!(height, "starting consensus height");
        self.height = height;
        self.committee = committee;
        self.messages = MessagesMap::new();
        self.locked_round = None;
        self.locked_value = None;
        self.valid_round = None;
        self.valid_value = None;
        self.committed = false;
        self.future_round_change.clear();
        Ok(())
    }

    fn set_step(&mut self, step: Step) {
        debug!(height = self.height, round = self.round, ?step, "step transition");
        self.step = step;
        if step == Step::Prevote && !self.prevote_timeout.scheduled() {
            self.prevote_timeout.schedule(
                self.event_tx.clone(),
                self.config.timeout(Step::Prevote, self.round),
                TimeoutEvent {
                    height: self.height,
                    round: self.round,
                    step: Step::Prevote,
                },
            );
        }
        self.process_backlog();
    }

    pub(crate) fn cancel_timeouts(&mut self) {
        self.propose_timeout.cancel();
        self.prevote_timeout.cancel();
        self.precommit_timeout.cancel();
    }

    // --- inbound message path ---

    /// Decodes and fully validates a wire payload, then processes it.
    pub(crate) fn handle_payload(&mut self, payload: &[u8]) -> Result<(), ConsensusError> {
        let msg =
            Message::decode(&mut &payload[..]).map_err(|_| InvalidMessage::Malformed)?;
        self.handle_msg(msg)
    }

    /// Validation pipeline: height gating, committee membership, signature
    /// recovery and, for precommits, the committed seal.
    pub(crate) fn handle_msg(&mut self, msg: Message) -> Result<(), ConsensusError> {
        let (_round, height) = msg.round_and_height()?;

        // Height gating comes before any signature work; future-height
        // messages are buffered unchecked until their height starts.
        if height > self.height {
            self.store_unchecked_backlog(msg, height);
            return Err(ConsensusError::FutureHeight);
        }
        if height < self.height {
            return Err(ConsensusError::OldHeight);
        }

        if !self.committee.contains(msg.sender) {
            return Err(InvalidMessage::UnknownSender(msg.sender).into());
        }
        msg.verify_signature()?;
        if msg.code == MsgCode::Precommit {
            let vote = msg.decode_vote()?;
            if !vote.is_nil() {
                msg.verify_committed_seal(&vote)?;
            }
        }

        self.handle_checked_msg(msg)
    }

    /// Round/step gating of a validated current-height message. Future
    /// messages are buffered; old-round precommits are still aggregated.
    pub(crate) fn handle_checked_msg(&mut self, msg: Message) -> Result<(), ConsensusError> {
        let (round, _height) = msg.round_and_height()?;

        if round > self.round {
            let sender = msg.sender;
            let power = self
                .committee
                .member(sender)
                .expect("sender membership checked before gating")
                .voting_power;
            self.store_backlog(msg, round);

            self.future_round_change
                .entry(round)
                .or_default()
                .insert(sender, power);
            let round_power: u64 = self.future_round_change[&round].values().sum();
            if round_power >= self.committee.f_plus_one() && !self.committed {
                info!(
                    height = self.height,
                    round, "f+1 validators ahead, skipping to their round"
                );
                self.start_round(round)?;
            }
            return Err(ConsensusError::FutureRound);
        }
        if round < self.round {
            if msg.code == MsgCode::Precommit {
                return self.handle_precommit(msg);
            }
            return Err(ConsensusError::OldRound);
        }
        if msg.step() > self.step {
            self.store_backlog(msg, round);
            return Err(ConsensusError::FutureStep);
        }

        self.dispatch(msg)
    }

    pub(crate) fn dispatch(&mut self, msg: Message) -> Result<(), ConsensusError> {
        match msg.code {
            MsgCode::Proposal => self.handle_proposal(msg),
            MsgCode::Prevote => self.handle_prevote(msg),
            MsgCode::Precommit => self.handle_precommit(msg),
        }
    }

    // --- step handlers ---

    fn handle_proposal(&mut self, msg: Message) -> Result<(), ConsensusError> {
        let proposal = msg.decode_proposal()?;
        let round = proposal.round;

        if self.committee.proposer(self.height, round).address != msg.sender {
            return Err(InvalidMessage::NotFromProposer(msg.sender).into());
        }

        match self.backend.verify(&proposal.block) {
            Ok(delay) if !delay.is_zero() => {
                debug!(?delay, "proposed block not yet valid, requeueing");
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = event_tx.send(CoreEvent::Requeue(msg));
                });
                return Ok(());
            }
            Ok(_) => {}
            Err(err) => {
                // An invalid proposal still concludes the propose step.
                if self.step == Step::Propose && !self.sent_prevote {
                    self.send_prevote(None)?;
                    self.set_step(Step::Prevote);
                }
                return Err(InvalidMessage::InvalidBlock(err.to_string()).into());
            }
        }

        let block_hash = proposal.block.hash();
        let valid_round = proposal.valid_round;
        self.messages.round_mut(round).set_proposal(proposal, msg);
        debug!(height = self.height, round, hash = %block_hash, "accepted proposal");

        if self.step == Step::Propose && !self.sent_prevote {
            let quorum = self.committee.quorum();
            let locked_hash = self.locked_value.as_ref().map(Block::hash);
            let prevote_hash = match valid_round {
                None => {
                    if self.locked_round.is_none() || locked_hash == Some(block_hash) {
                        Some(block_hash)
                    } else {
                        None
                    }
                }
                Some(vr) if vr < round => {
                    let quorum_at_vr = self
                        .messages
                        .round(vr)
                        .is_some_and(|rm| rm.prevotes().power(block_hash) >= quorum);
                    if quorum_at_vr {
                        Some(block_hash)
                    } else {
                        None
                    }
                }
                Some(_) => None,
            };
            self.send_prevote(prevote_hash)?;
            self.set_step(Step::Prevote);
        }

        // Quorums may have formed before the body arrived.
        self.check_prevote_quorum(round)?;
        self.try_commit(round)?;
        Ok(())
    }

    fn handle_prevote(&mut self, msg: Message) -> Result<(), ConsensusError> {
        let vote = msg.decode_vote()?;
        let sender = msg.sender;
        let power = self
            .committee
            .member(sender)
            .expect("sender membership checked before gating")
            .voting_power;

        let outcome = self.messages.round_mut(vote.round).prevotes_mut().add(vote, msg, power);
        if outcome == AddVote::Conflict {
            warn!(%sender, round = vote.round, "conflicting prevotes recorded as evidence");
        }

        self.check_prevote_quorum(vote.round)
    }

    fn check_prevote_quorum(&mut self, round: u64) -> Result<(), ConsensusError> {
        if round != self.round || self.committed {
            return Ok(());
        }
        let quorum = self.committee.quorum();

        let Some(round_messages) = self.messages.round(round) else {
            return Ok(());
        };
        let proposal_hash = round_messages.proposal_block_hash();
        let proposal_power = proposal_hash.map_or(0, |hash| round_messages.prevotes().power(hash));
        let nil_power = round_messages.prevotes().nil_power();
        let total_power = round_messages.prevotes().total_power();

        if let Some(hash) = proposal_hash {
            if proposal_power >= quorum && self.step >= Step::Prevote {
                let block = self
                    .messages
                    .round(round)
                    .and_then(|rm| rm.proposal())
                    .map(|(p, _)| p.block.clone())
                    .expect("proposal checked above");

                if !self.valid_value_seen {
                    debug!(round, hash = %hash, "prevote quorum, recording valid value");
                    self.valid_value_seen = true;
                    self.valid_round = Some(round);
                    self.valid_value = Some(block.clone());
                }
                if self.step == Step::Prevote && !self.sent_precommit {
                    self.locked_round = Some(round);
                    self.locked_value = Some(block);
                    self.send_precommit(Some(hash))?;
                    self.set_step(Step::Precommit);
                }
                return Ok(());
            }
        }

        if nil_power >= quorum && self.step == Step::Prevote && !self.sent_precommit {
            self.send_precommit(None)?;
            self.set_step(Step::Precommit);
            return Ok(());
        }

        if total_power >= quorum
            && self.step == Step::Prevote
            && !self.prevote_timeout.scheduled()
        {
            self.prevote_timeout.schedule(
                self.event_tx.clone(),
                self.config.timeout(Step::Prevote, round),
                TimeoutEvent {
                    height: self.height,
                    round,
                    step: Step::Prevote,
                },
            );
        }
        Ok(())
    }

    fn handle_precommit(&mut self, msg: Message) -> Result<(), ConsensusError> {
        let vote = msg.decode_vote()?;
        let sender = msg.sender;
        let power = self
            .committee
            .member(sender)
            .expect("sender membership checked before gating")
            .voting_power;

        let outcome = self
            .messages
            .round_mut(vote.round)
            .precommits_mut()
            .add(vote, msg, power);
        if outcome == AddVote::Conflict {
            warn!(%sender, round = vote.round, "conflicting precommits recorded as evidence");
        }

        self.try_commit(vote.round)?;
        if self.committed || vote.round != self.round {
            return Ok(());
        }

        let total_power = self
            .messages
            .round(vote.round)
            .map_or(0, |rm| rm.precommits().total_power());
        if total_power >= self.committee.quorum() && !self.precommit_timeout.scheduled() {
            self.precommit_timeout.schedule(
                self.event_tx.clone(),
                self.config.timeout(Step::Precommit, self.round),
                TimeoutEvent {
                    height: self.height,
                    round: self.round,
                    step: Step::Precommit,
                },
            );
        }
        Ok(())
    }

    /// Commits as soon as some round has a precommit quorum on a hash whose
    /// proposal body is known. Called again whenever either part arrives.
    fn try_commit(&mut self, round: u64) -> Result<(), ConsensusError> {
        if self.committed {
            return Ok(());
        }
        let quorum = self.committee.quorum();
        let Some(round_messages) = self.messages.round(round) else {
            return Ok(());
        };
        let Some(hash) = round_messages.precommits().quorum_hash(quorum) else {
            return Ok(());
        };
        let Some((proposal, _)) = round_messages.proposal() else {
            debug!(round, %hash, "precommit quorum reached, waiting for proposal body");
            return Ok(());
        };
        if proposal.block.hash() != hash {
            warn!(round, %hash, "precommit quorum on a block we do not hold");
            return Ok(());
        }

        let block = proposal.block.clone();
        let committed_seals = round_messages.precommits().seals_for(hash);
        info!(
            height = self.height,
            round,
            %hash,
            seals = committed_seals.len(),
            "committing block"
        );
        self.backend
            .commit(block, round, committed_seals)
            .map_err(Self::backend_fault)?;

        self.committed = true;
        self.cancel_timeouts();
        // Height turnover happens on the loop's next tick so that the commit
        // unwinds out of whatever handler chain triggered it.
        let _ = self.event_tx.send(CoreEvent::AdvanceHeight);
        Ok(())
    }

    // --- timeouts ---

    pub(crate) fn handle_timeout(&mut self, event: TimeoutEvent) -> Result<(), ConsensusError> {
        if self.committed || event.height != self.height || event.round != self.round {
            debug!(?event, "discarding stale timeout");
            return Ok(());
        }
        match event.step {
            Step::Propose => {
                if self.step == Step::Propose {
                    info!(height = self.height, round = self.round, "propose timeout");
                    if !self.sent_prevote {
                        self.send_prevote(None)?;
                    }
                    self.set_step(Step::Prevote);
                }
            }
            Step::Prevote => {
                if self.step == Step::Prevote {
                    info!(height = self.height, round = self.round, "prevote timeout");
                    if !self.sent_precommit {
                        self.send_precommit(None)?;
                    }
                    self.set_step(Step::Precommit);
                }
            }
            Step::Precommit => {
                info!(height = self.height, round = self.round, "precommit timeout");
                self.start_round(self.round + 1)?;
            }
        }
        Ok(())
    }

    // --- outbound ---

    fn send_prevote(&mut self, hash: Option<B256>) -> Result<(), ConsensusError> {
        let vote = Vote {
            round: self.round,
            height: self.height,
            proposed_block_hash: hash.unwrap_or_default(),
        };
        debug!(height = self.height, round = self.round, nil = hash.is_none(), "sending prevote");
        let msg = self.sign_message(MsgCode::Prevote, alloy_rlp::encode(vote).into(), None)?;
        self.sent_prevote = true;
        self.broadcast_and_process(msg)
    }

    fn send_precommit(&mut self, hash: Option<B256>) -> Result<(), ConsensusError> {
        let committed_seal = match hash {
            Some(hash) => {
                let input = commit_seal_input(hash, self.round, self.height);
                let seal = self.backend.sign(&input).map_err(Self::backend_fault)?;
                Bytes::from(seal.to_vec())
            }
            None => Bytes::new(),
        };
        let vote = Vote {
            round: self.round,
            height: self.height,
            proposed_block_hash: hash.unwrap_or_default(),
        };
        debug!(height = self.height, round = self.round, nil = hash.is_none(), "sending precommit");
        let msg = self.sign_message(
            MsgCode::Precommit,
            alloy_rlp::encode(vote).into(),
            Some(committed_seal),
        )?;
        self.sent_precommit = true;
        self.broadcast_and_process(msg)
    }

    fn sign_message(
        &self,
        code: MsgCode,
        payload: Bytes,
        committed_seal: Option<Bytes>,
    ) -> Result<Message, ConsensusError> {
        let mut msg = Message {
            code,
            payload,
            sender: self.address,
            signature: Bytes::new(),
            committed_seal: committed_seal.unwrap_or_default(),
        };
        let signature = self
            .backend
            .sign(&msg.signature_input())
            .map_err(Self::backend_fault)?;
        msg.signature = Bytes::from(signature.to_vec());
        Ok(msg)
    }

    /// Gossips an own message and feeds it through the regular inbound path.
    /// Own votes ahead of the current step wait in the backlog like any other.
    fn broadcast_and_process(&mut self, msg: Message) -> Result<(), ConsensusError> {
        self.backend
            .broadcast(&self.committee, alloy_rlp::encode(&msg).into());
        match self.handle_checked_msg(msg) {
            Ok(()) | Err(ConsensusError::FutureStep | ConsensusError::FutureRound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn backend_fault(err: B::Error) -> ConsensusError {
        ConsensusError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use tessera_primitives::{keccak256, Address, Bytes, Signer, B256};
    use tessera_types::{Committee, CommitteeMember};

    use crate::backend::Backend;
    use crate::config::Config;
    use crate::error::ConsensusError;
    use crate::message::{commit_seal_input, Message, MsgCode, Step, Vote};

    use super::{Core, CoreEvent};
    use tokio::sync::mpsc;

    #[derive(Clone)]
    struct NullBackend {
        signer: Signer,
    }

    impl Backend for NullBackend {
        type Error = String;

        fn address(&self) -> Address {
            self.signer.address()
        }

        fn committee(&self, _: B256) -> Result<Committee, Self::Error> {
            unimplemented!("not exercised by state machine tests")
        }

        fn sign(&self, data: &[u8]) -> Result<[u8; 65], Self::Error> {
            Ok(self.signer.sign_prehash(keccak256(data).0))
        }

        fn verify(&self, _: &tessera_types::Block) -> Result<std::time::Duration, Self::Error> {
            Ok(std::time::Duration::ZERO)
        }

        fn build_block(&self, _: u64) -> Result<tessera_types::Block, Self::Error> {
            unimplemented!("not exercised by state machine tests")
        }

        fn broadcast(&self, _: &Committee, _: Bytes) {}

        fn commit(
            &self,
            _: tessera_types::Block,
            _: u64,
            _: Vec<Bytes>,
        ) -> Result<(), Self::Error> {
            unimplemented!("not exercised by state machine tests")
        }

        fn last_committed(&self) -> (tessera_types::Block, Address) {
            unimplemented!("not exercised by state machine tests")
        }
    }

    struct TestSetup {
        core: Core<NullBackend>,
        signers: Vec<Signer>,
        _event_rx: mpsc::UnboundedReceiver<CoreEvent>,
    }

    fn setup(height: u64, round: u64, step: Step) -> TestSetup {
        let signers: Vec<Signer> = (1u8..=4).map(|i| Signer::new([i; 32]).unwrap()).collect();
        let committee = Committee::new(
            signers
                .iter()
                .map(|s| CommitteeMember {
                    address: s.address(),
                    voting_power: 1,
                })
                .collect(),
        )
        .unwrap();

        let (mut core, event_rx) = Core::new(
            NullBackend {
                signer: signers[0],
            },
            Config::default(),
        );
        core.height = height;
        core.round = round;
        core.step = step;
        core.committee = committee;

        TestSetup {
            core,
            signers,
            _event_rx: event_rx,
        }
    }

    fn prevote(sender: Address, round: u64, height: u64) -> Message {
        let vote = Vote {
            round,
            height,
            proposed_block_hash: B256::with_last_byte(1),
        };
        Message {
            code: MsgCode::Prevote,
            payload: alloy_rlp::encode(vote).into(),
            sender,
            signature: Bytes::new(),
            committed_seal: Bytes::new(),
        }
    }

    fn signed_precommit(signer: &Signer, round: u64, height: u64) -> Message {
        let vote = Vote {
            round,
            height,
            proposed_block_hash: B256::with_last_byte(1),
        };
        let seal = signer.sign_prehash(
            keccak256(commit_seal_input(
                vote.proposed_block_hash,
                vote.round,
                vote.height,
            ))
            .0,
        );
        let mut msg = Message {
            code: MsgCode::Precommit,
            payload: alloy_rlp::encode(vote).into(),
            sender: signer.address(),
            signature: Bytes::new(),
            committed_seal: Bytes::from(seal.to_vec()),
        };
        let signature = signer.sign_prehash(keccak256(msg.signature_input()).0);
        msg.signature = Bytes::from(signature.to_vec());
        msg
    }

    #[tokio::test]
    async fn gating_buffers_future_messages() {
        // Future step: engine still proposing, prevote for the same view.
        let mut setup1 = setup(2, 1, Step::Propose);
        let sender = setup1.signers[1].address();
        let msg = prevote(sender, 1, 2);
        assert_eq!(
            setup1.core.handle_checked_msg(msg.clone()),
            Err(ConsensusError::FutureStep)
        );
        assert_eq!(setup1.core.backlogs[&sender][0].msg, msg);

        // Future round at the same height.
        let msg = prevote(sender, 2, 2);
        assert_eq!(
            setup1.core.handle_checked_msg(msg.clone()),
            Err(ConsensusError::FutureRound)
        );
        assert_eq!(setup1.core.backlogs[&sender][1].msg, msg);

        // Future height, before any signature checks.
        let mut setup2 = setup(2, 0, Step::Propose);
        let msg = prevote(sender, 0, 3);
        assert_eq!(
            setup2.core.handle_msg(msg.clone()),
            Err(ConsensusError::FutureHeight)
        );
        assert_eq!(setup2.core.backlog_unchecked[&3], vec![msg]);
    }

    #[tokio::test]
    async fn old_height_messages_are_dropped() {
        let mut setup = setup(2, 1, Step::Propose);
        let msg = prevote(setup.signers[1].address(), 2, 1);
        assert_eq!(
            setup.core.handle_msg(msg),
            Err(ConsensusError::OldHeight)
        );
        assert!(setup.core.backlogs.is_empty());
        assert!(setup.core.backlog_unchecked.is_empty());
    }

    #[tokio::test]
    async fn old_round_prevotes_are_dropped() {
        let mut setup = setup(2, 5, Step::Precommit);
        let msg = prevote(setup.signers[1].address(), 2, 2);
        assert_eq!(
            setup.core.handle_checked_msg(msg),
            Err(ConsensusError::OldRound)
        );
        assert!(setup.core.messages.round(2).is_none());
    }

    #[tokio::test]
    async fn on_time_prevote_is_counted() {
        let mut setup = setup(2, 0, Step::Prevote);
        let sender = setup.signers[1].address();
        let msg = prevote(sender, 0, 2);

        assert_eq!(setup.core.handle_checked_msg(msg), Ok(()));
        let prevotes = setup.core.messages.round(0).unwrap().prevotes();
        assert_eq!(prevotes.power(B256::with_last_byte(1)), 1);
        assert!(prevotes.get(sender).is_some());
    }

    #[tokio::test]
    async fn precommit_seal_is_stored_with_the_vote() {
        let mut setup = setup(2, 0, Step::Precommit);
        let signer = setup.signers[1];
        let msg = signed_precommit(&signer, 0, 2);

        assert_eq!(setup.core.handle_msg(msg), Ok(()));
        let (_, stored) = setup
            .core
            .messages
            .round(0)
            .unwrap()
            .precommits()
            .get(signer.address())
            .unwrap();
        assert_eq!(stored.committed_seal.len(), 65);
    }

    #[tokio::test]
    async fn far_future_round_precommits_are_buffered() {
        let mut setup = setup(2, 5, Step::Precommit);
        let signer = setup.signers[1];
        let msg = signed_precommit(&signer, 20, 2);
        assert_eq!(
            setup.core.handle_checked_msg(msg),
            Err(ConsensusError::FutureRound)
        );
        assert_eq!(setup.core.backlogs[&signer.address()].len(), 1);
    }

    #[tokio::test]
    async fn f_plus_one_future_round_messages_skip_ahead() {
        let mut setup = setup(2, 0, Step::Propose);

        let msg = prevote(setup.signers[1].address(), 5, 2);
        assert_eq!(
            setup.core.handle_checked_msg(msg),
            Err(ConsensusError::FutureRound)
        );
        assert_eq!(setup.core.round, 0);

        let msg = prevote(setup.signers[2].address(), 5, 2);
        assert_eq!(
            setup.core.handle_checked_msg(msg),
            Err(ConsensusError::FutureRound)
        );

        // Two of four validators are at round 5: jump there.
        assert_eq!(setup.core.round, 5);
        assert_eq!(setup.core.step, Step::Propose);
        assert!(setup.core.propose_timeout.scheduled());
    }

    #[tokio::test]
    async fn propose_timeout_prevotes_nil() {
        let mut setup = setup(2, 0, Step::Propose);
        let event = crate::timeout::TimeoutEvent {
            height: 2,
            round: 0,
            step: Step::Propose,
        };
        assert_eq!(setup.core.handle_timeout(event), Ok(()));

        assert_eq!(setup.core.step, Step::Prevote);
        assert!(setup.core.sent_prevote);
        // The own nil prevote went through the backlog and was replayed.
        let prevotes = setup.core.messages.round(0).unwrap().prevotes();
        assert_eq!(prevotes.nil_power(), 1);
    }

    #[tokio::test]
    async fn stale_timeouts_are_discarded() {
        let mut setup = setup(2, 3, Step::Prevote);
        let event = crate::timeout::TimeoutEvent {
            height: 2,
            round: 1,
            step: Step::Prevote,
        };
        assert_eq!(setup.core.handle_timeout(event), Ok(()));
        assert_eq!(setup.core.step, Step::Prevote);
        assert_eq!(setup.core.round, 3);
        assert!(!setup.core.sent_precommit);
    }
}
