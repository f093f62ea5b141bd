//! The consensus driver.
//!
//! [`Core`] owns the round state machine. A single receive thread drains
//! the bounded message queue and the timeout ticker, and is the only
//! writer of [`RoundState`]; every transition runs under the state lock
//! and is guarded by a precondition on `(height, round, step)`, which
//! makes transitions idempotent and safe to invoke from both the message
//! path and the timer path.
//!
//! ```text
//!  peers ─RecvMsg──► msg queue ─┐
//!                               ├──► receive thread ──► transitions ──► Committee
//!  TimeoutTicker ───fires───────┘         │                (broadcast, send, commit)
//!                                         ▼
//!                                    RoundState
//! ```
//!
//! Step flow for one round:
//!
//! ```text
//! NewHeight → NewRound → Propose → Prevote → PrevoteFetch ⇄ PrevoteWait
//!           → Precommit → PrecommitFetch ⇄ PrecommitWait → Commit
//! ```
//!
//! Everything downstream of a +2/3 observation happens inside one lock
//! hold, so the post-add triggers of a vote are atomic with its
//! admission.

use {
    crate::{
        committee::{Committee, PeerId, PrivateValidator, Validators},
        config::Config,
        error::{ConsensusError, Result},
        height_vote_set::HeightVoteSet,
        message::{
            unix_millis, AppState, ConsensusMessage, FetchVotesReq, FetchVotesRsp, ProposedData,
            Vote, VoteType, NIL_DATA,
        },
        round_state::{RoundState, RoundStep},
        timeout::{TimeoutInfo, TimeoutTicker},
    },
    crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError},
    log::*,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex, RwLock,
        },
        thread::{Builder, JoinHandle},
        time::{Duration, Instant},
    },
};

/// An inbound message together with the peer it came from, if any.
#[derive(Debug)]
struct MsgInfo {
    msg: ConsensusMessage,
    peer: Option<PeerId>,
}

/// Driver state guarded by the single state lock.
struct CoreState {
    rs: RoundState,
    /// Whether a peer's commit for the current height was received; if
    /// so, our own commit broadcast is suppressed.
    has_recv_commit_records: bool,
    /// Test-only prevote override.
    byzantine_prevote: Option<ProposedData>,
    /// The ticker of the current run; `None` while stopped.
    ticker: Option<Arc<TimeoutTicker>>,
    /// Self-originated messages dropped on a full queue.
    dropped_internal: u64,
}

/// Handles owned for the duration of one run.
struct ReceiveHandle {
    done_tx: Sender<()>,
    thread: JoinHandle<()>,
    ticker: Arc<TimeoutTicker>,
}

struct CoreInner {
    name: String,
    cfg: Config,
    validators: Arc<Validators>,
    state: RwLock<CoreState>,
    msg_tx: Sender<MsgInfo>,
    msg_rx: Receiver<MsgInfo>,
    started: AtomicBool,
    in_start_or_stop: AtomicBool,
    lifecycle: Mutex<Option<ReceiveHandle>>,
}

/// The BFT consensus core.
///
/// Drives a committee of validators through rounds of proposal, prevote,
/// precommit, and commit over opaque proposed values, tolerating up to
/// `f` faults out of `3f + 1` by voting power.
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    /// Create a stopped core. `committee` and `signer` are the host's
    /// capability handles; nothing runs until [`Core::start`].
    pub fn new(
        name: impl Into<String>,
        cfg: Config,
        committee: Arc<dyn Committee>,
        signer: Arc<dyn PrivateValidator>,
    ) -> Self {
        let validators = Arc::new(Validators::new(committee, signer));
        let (msg_tx, msg_rx) = bounded(cfg.msg_queue_size);
        let votes = HeightVoteSet::new(0, validators.clone(), NIL_DATA);
        Self {
            inner: Arc::new(CoreInner {
                name: name.into(),
                cfg,
                validators,
                state: RwLock::new(CoreState {
                    rs: RoundState::new(votes),
                    has_recv_commit_records: false,
                    byzantine_prevote: None,
                    ticker: None,
                    dropped_internal: 0,
                }),
                msg_tx,
                msg_rx,
                started: AtomicBool::new(false),
                in_start_or_stop: AtomicBool::new(false),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    /// Start the receive thread and schedule round 0 of the height the
    /// committee's application state names.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner
            .in_start_or_stop
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ConsensusError::StartStopInProgress);
        }
        let result = self.do_start();
        inner.in_start_or_stop.store(false, Ordering::Release);
        result
    }

    fn do_start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.started.load(Ordering::Acquire) {
            return Err(ConsensusError::AlreadyRunning);
        }

        let ticker = Arc::new(TimeoutTicker::new());
        ticker.start()?;

        let app_state = inner.validators.committee().app_state();
        {
            let mut st = inner.state.write().unwrap();
            st.ticker = Some(ticker.clone());
            st.has_recv_commit_records = false;
            st.rs.commit_round = None;
            inner.update_to_app_state(&mut st, app_state);
            // leave a grace period before the first round
            st.rs.start_time = unix_millis() + 1_000;
            inner.schedule_round0(&mut st);
        }

        let (done_tx, done_rx) = bounded(1);
        let thread_inner = Arc::clone(&self.inner);
        let thread_ticker = Arc::clone(&ticker);
        let msg_rx = inner.msg_rx.clone();
        let thread = Builder::new()
            .name(format!("tsrBftCore-{}", inner.name))
            .spawn(move || thread_inner.receive_routine(msg_rx, thread_ticker, done_rx))
            .expect("failed to spawn consensus receive thread");

        *inner.lifecycle.lock().unwrap() = Some(ReceiveHandle {
            done_tx,
            thread,
            ticker,
        });
        inner.started.store(true, Ordering::Release);
        info!("[{}] consensus core started at height {}", inner.name, {
            inner.state.read().unwrap().rs.height
        });
        Ok(())
    }

    /// Stop the ticker, signal the receive thread, and join it.
    /// Undelivered queue items are dropped.
    pub fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if inner
            .in_start_or_stop
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ConsensusError::StartStopInProgress);
        }
        let result = self.do_stop();
        inner.in_start_or_stop.store(false, Ordering::Release);
        result
    }

    fn do_stop(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.started.load(Ordering::Acquire) {
            return Err(ConsensusError::NotRunning);
        }
        let handle = inner
            .lifecycle
            .lock()
            .unwrap()
            .take()
            .expect("running core has a receive handle");
        handle.ticker.stop();
        let _ = handle.done_tx.send(());
        let _ = handle.thread.join();
        inner.state.write().unwrap().ticker = None;
        inner.started.store(false, Ordering::Release);
        info!("[{}] consensus core stopped", inner.name);
        Ok(())
    }

    /// Enqueue a peer message. Blocks when the queue is full; returns an
    /// error when the core is stopped or the message is malformed.
    pub fn recv_msg(&self, msg: ConsensusMessage, peer: Option<PeerId>) -> Result<()> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(ConsensusError::NotRunning);
        }
        if let Err(err) = msg.validate_basic() {
            error!("[{}] refusing {}: {err}", self.inner.name, msg.kind());
            return Err(err);
        }
        self.inner
            .msg_tx
            .send(MsgInfo { msg, peer })
            .map_err(|_| ConsensusError::NotRunning)
    }

    /// A copy of the current round state.
    pub fn round_state(&self) -> RoundState {
        self.inner.state.read().unwrap().rs.clone()
    }

    /// The commit proved by the previous height's precommits, if this
    /// node holds them.
    pub fn last_commit(&self) -> Option<crate::message::Commit> {
        let st = self.inner.state.read().unwrap();
        st.rs
            .last_commit
            .as_ref()
            .and_then(|set| set.make_commit().ok())
    }

    /// Force the next prevote to `data` regardless of protocol rules.
    #[cfg(test)]
    pub(crate) fn set_byzantine_prevote(&self, data: Option<ProposedData>) {
        self.inner.state.write().unwrap().byzantine_prevote = data;
    }
}

impl CoreInner {
    // -- Receive loop --

    /// Keeps the round state and is the only thing that updates it.
    /// Transitions happen on timeouts, complete proposals, and +2/3
    /// majorities.
    fn receive_routine(
        self: Arc<Self>,
        msg_rx: Receiver<MsgInfo>,
        ticker: Arc<TimeoutTicker>,
        done_rx: Receiver<()>,
    ) {
        let mut msg_count: u64 = 0;
        let mut busy = Duration::ZERO;
        loop {
            select! {
                recv(done_rx) -> _ => {
                    debug!("[{}] receive loop done", self.name);
                    return;
                },
                recv(msg_rx) -> msg => {
                    let Ok(mi) = msg else { return };
                    let started_at = Instant::now();
                    self.handle_msg(mi);
                    busy += started_at.elapsed();
                    msg_count += 1;
                    if msg_count % 100 == 0 {
                        debug!(
                            "[{}] average time to process a consensus msg: {:?}",
                            self.name,
                            busy / msg_count as u32
                        );
                    }
                },
                recv(ticker.fired()) -> fired => {
                    let Ok(ti) = fired else { return };
                    self.handle_timeout(ti);
                },
            }
        }
    }

    fn handle_msg(&self, mi: MsgInfo) {
        let mut st = self.state.write().unwrap();
        trace!("[{}] handle {}", self.name, mi.msg.kind());
        match mi.msg {
            ConsensusMessage::Vote(vote) => {
                // non-validators only observe
                if !self.is_validator() {
                    return;
                }
                if let Err(err) = self.try_add_vote(&mut st, &vote) {
                    match err {
                        ConsensusError::VoteHeightMismatch { .. }
                        | ConsensusError::ConflictingVotes(_) => {}
                        err => {
                            error!(
                                "[{}] error with vote at {}/{}: {err}",
                                self.name, st.rs.height, st.rs.round
                            );
                        }
                    }
                }
            }
            ConsensusMessage::Commit(commit) => {
                if let Err(err) = commit.validate_basic() {
                    error!("[{}] bad commit message: {err}", self.name);
                    return;
                }
                if commit.height == st.rs.height {
                    st.has_recv_commit_records = true;
                }
                if commit.height >= st.rs.height {
                    for vote in &commit.precommits {
                        let _ = self.try_add_vote(&mut st, vote);
                    }
                }
            }
            ConsensusMessage::FetchVotesReq(req) => self.handle_fetch(&mut st, req, mi.peer),
            ConsensusMessage::FetchVotesRsp(rsp) => self.handle_fetch_rsp(&mut st, rsp),
        }
    }

    fn handle_fetch(&self, st: &mut CoreState, req: FetchVotesReq, peer: Option<PeerId>) {
        debug!(
            "[{}] fetch votes request for {} {}/{}",
            self.name, req.vote_type, req.height, req.round
        );
        let rsp = if req.height < st.rs.height {
            match self.validators.committee().commit_history(req.height) {
                Some(commit) => Some(FetchVotesRsp {
                    vote_type: VoteType::Precommit,
                    height: req.height,
                    round: req.round,
                    missing_votes: commit.precommits,
                    address: Default::default(),
                    signature: Default::default(),
                }),
                None => {
                    error!(
                        "[{}] no commit history for height {}",
                        self.name, req.height
                    );
                    None
                }
            }
        } else if req.height == st.rs.height && req.round <= st.rs.round {
            match req.vote_type {
                VoteType::Prevote => st.rs.votes.prevotes_mut(req.round).make_fetch_votes_rsp(&req),
                VoteType::Precommit => st
                    .rs
                    .votes
                    .precommits_mut(req.round)
                    .make_fetch_votes_rsp(&req),
                VoteType::Proposal => None,
            }
        } else {
            None
        };

        if let Some(mut rsp) = rsp {
            self.validators.sign(&mut rsp);
            debug!(
                "[{}] sending fetch votes response with {} votes",
                self.name,
                rsp.missing_votes.len()
            );
            self.validators
                .committee()
                .send(ConsensusMessage::FetchVotesRsp(rsp), peer);
        }
    }

    fn handle_fetch_rsp(&self, st: &mut CoreState, rsp: FetchVotesRsp) {
        if st.rs.height != rsp.height || st.rs.round > rsp.round {
            return;
        }
        if st.rs.step != RoundStep::PrevoteFetch && st.rs.step != RoundStep::PrecommitFetch {
            return;
        }
        for vote in &rsp.missing_votes {
            let _ = self.try_add_vote(st, vote);
        }
    }

    fn handle_timeout(&self, ti: TimeoutInfo) {
        let mut st = self.state.write().unwrap();
        debug!(
            "[{}] timeout {:?} for {}/{}/{}",
            self.name, ti.duration, ti.height, ti.round, ti.step
        );

        // timeouts must be for the current height, round, step
        if ti.height != st.rs.height
            || ti.round < st.rs.round
            || (ti.round == st.rs.round && ti.step < st.rs.step)
        {
            debug!(
                "[{}] ignoring timeout, we are ahead at {}/{}/{}",
                self.name, st.rs.height, st.rs.round, st.rs.step
            );
            return;
        }

        match ti.step {
            RoundStep::NewHeight => self.enter_new_round(&mut st, ti.height, 0),
            RoundStep::NewRound => self.enter_propose(&mut st, ti.height, 0),
            RoundStep::Propose => self.enter_prevote(&mut st, ti.height, ti.round),
            RoundStep::PrevoteFetch | RoundStep::PrecommitFetch => {
                self.fetch_missing_votes(&mut st)
            }
            RoundStep::PrevoteWait => self.enter_precommit(&mut st, ti.height, ti.round),
            RoundStep::PrecommitWait => {
                // the re-entered precommit may still flip the lock, so it
                // must run before the round advances
                self.enter_precommit(&mut st, ti.height, ti.round);
                self.enter_new_round(&mut st, ti.height, ti.round + 1);
            }
            step => panic!("invalid timeout step {step}"),
        }
    }

    // -- State transitions --

    fn enter_new_round(&self, st: &mut CoreState, height: u64, round: u32) {
        if st.rs.height != height
            || round < st.rs.round
            || (st.rs.round == round && st.rs.step != RoundStep::NewHeight)
        {
            debug!(
                "[{}] enter_new_round({height}/{round}): invalid args, current {}/{}/{}",
                self.name, st.rs.height, st.rs.round, st.rs.step
            );
            return;
        }

        let now = unix_millis();
        if st.rs.start_time > now {
            info!(
                "[{}] entering round {}ms before the height's start time",
                self.name,
                st.rs.start_time - now
            );
        }
        info!(
            "[{}] enter_new_round({height}/{round}), current {}/{}/{}",
            self.name, st.rs.height, st.rs.round, st.rs.step
        );

        st.rs.update_round_step(round, RoundStep::NewRound);
        if round > 0 {
            // round 0 keeps a proposal that may have arrived during
            // NewHeight; later rounds start clean
            info!("[{}] resetting proposal at {height}/{round}", self.name);
            st.rs.proposal = None;
        }
        // track the next round as well, to admit round-skip votes
        st.rs.votes.set_round(round + 1);

        self.enter_propose(st, height, round);
    }

    fn enter_propose(&self, st: &mut CoreState, height: u64, round: u32) {
        if st.rs.height != height
            || round < st.rs.round
            || (st.rs.round == round && RoundStep::Propose <= st.rs.step)
        {
            debug!(
                "[{}] enter_propose({height}/{round}): invalid args, current {}/{}/{}",
                self.name, st.rs.height, st.rs.round, st.rs.step
            );
            return;
        }
        info!(
            "[{}] enter_propose({height}/{round}), current {}/{}/{}",
            self.name, st.rs.height, st.rs.round, st.rs.step
        );

        // prevote nil if the proposal does not show up in time
        self.schedule_timeout(st, self.cfg.propose(round), height, round, RoundStep::Propose);

        let self_key = self.validators.self_pub_key();
        if !self.validators.committee().is_validator(&self_key) {
            debug!("[{}] this node is not a validator", self.name);
        } else if self.validators.committee().current_proposer(round) == self_key {
            info!("[{}] our turn to propose at {height}/{round}", self.name);
            self.do_propose(st, height, round);
        } else {
            debug!(
                "[{}] waiting for a proposal from {}",
                self.name,
                self.validators.committee().current_proposer(round)
            );
        }

        st.rs.update_round_step(round, RoundStep::Propose);
        // with a proposal in hand, or a lock standing in for one, there
        // is nothing to wait for
        if st.rs.proposal.is_some() || st.rs.locked_round.is_some() {
            let current_round = st.rs.round;
            self.enter_prevote(st, height, current_round);
        }
    }

    fn do_propose(&self, st: &mut CoreState, height: u64, round: u32) {
        let data = self.validators.committee().decides_proposal();
        let mut proposal = Vote::new(
            VoteType::Proposal,
            height,
            round,
            data,
            st.rs.last_committed_data,
        );
        // a standing lock overrides whatever the application offers
        if st.rs.locked_round.is_some() {
            if let Some(locked) = &st.rs.locked_proposal {
                proposal.proposed = locked.proposed;
            }
        }
        if let Some(signed) = self.sign_add_vote(st, proposal) {
            st.rs.proposal = Some(signed);
        }
    }

    fn enter_prevote(&self, st: &mut CoreState, height: u64, round: u32) {
        if st.rs.height != height
            || round < st.rs.round
            || (st.rs.round == round && RoundStep::Prevote <= st.rs.step)
        {
            debug!(
                "[{}] enter_prevote({height}/{round}): invalid args, current {}/{}/{}",
                self.name, st.rs.height, st.rs.round, st.rs.step
            );
            return;
        }
        info!(
            "[{}] enter_prevote({height}/{round}), current {}/{}/{}",
            self.name, st.rs.height, st.rs.round, st.rs.step
        );

        self.do_prevote(st, height, round);
        st.rs.update_round_step(round, RoundStep::Prevote);
        // once any +2/3 prevotes arrive, the vote fan-in moves us to
        // PrevoteWait
        self.enter_prevote_fetch(st, height, round);
    }

    fn do_prevote(&self, st: &mut CoreState, height: u64, round: u32) {
        if let Some(byzantine) = st.byzantine_prevote {
            if byzantine != NIL_DATA {
                let vote = Vote::new(
                    VoteType::Prevote,
                    height,
                    round,
                    byzantine,
                    st.rs.last_committed_data,
                );
                self.sign_add_vote(st, vote);
                return;
            }
        }

        let locked = st
            .rs
            .locked_round
            .and_then(|_| st.rs.locked_proposal.as_ref());
        let proposed = if let Some(locked) = locked {
            info!(
                "[{}] prevoting the locked proposal {}",
                self.name, locked.proposed
            );
            locked.proposed
        } else if let Some(proposal) = &st.rs.proposal {
            if self.validators.committee().validate_proposal(proposal.proposed) {
                proposal.proposed
            } else {
                info!("[{}] proposal failed validation, prevoting nil", self.name);
                NIL_DATA
            }
        } else {
            info!("[{}] no proposal, prevoting nil", self.name);
            NIL_DATA
        };

        let vote = Vote::new(
            VoteType::Prevote,
            height,
            round,
            proposed,
            st.rs.last_committed_data,
        );
        self.sign_add_vote(st, vote);
    }

    fn enter_prevote_fetch(&self, st: &mut CoreState, height: u64, round: u32) {
        info!(
            "[{}] enter_prevote_fetch({height}/{round}), current {}/{}/{}",
            self.name, st.rs.height, st.rs.round, st.rs.step
        );
        st.rs.update_round_step(round, RoundStep::PrevoteFetch);
        self.schedule_timeout(
            st,
            self.cfg.fetch_interval(),
            height,
            round,
            RoundStep::PrevoteFetch,
        );
    }

    fn enter_precommit_fetch(&self, st: &mut CoreState, height: u64, round: u32) {
        info!(
            "[{}] enter_precommit_fetch({height}/{round}), current {}/{}/{}",
            self.name, st.rs.height, st.rs.round, st.rs.step
        );
        st.rs.update_round_step(round, RoundStep::PrecommitFetch);
        self.schedule_timeout(
            st,
            self.cfg.fetch_interval(),
            height,
            round,
            RoundStep::PrecommitFetch,
        );
    }

    /// Ask one neighbour for the votes our current set lacks, then
    /// re-arm the fetch interval. A no-op once the step moved on or the
    /// set gathered +2/3 of any votes.
    fn fetch_missing_votes(&self, st: &mut CoreState) {
        let (height, round, step) = (st.rs.height, st.rs.round, st.rs.step);
        let mut req = match step {
            RoundStep::PrevoteFetch => {
                let prevotes = st.rs.votes.prevotes_mut(round);
                if prevotes.has_two_thirds_any() {
                    return;
                }
                prevotes.make_fetch_votes_req()
            }
            RoundStep::PrecommitFetch => {
                let precommits = st.rs.votes.precommits_mut(round);
                if precommits.has_two_thirds_any() {
                    return;
                }
                precommits.make_fetch_votes_req()
            }
            _ => return,
        };
        self.validators.sign(&mut req);
        debug!(
            "[{}] fetching missing votes at {height}/{round}",
            self.name
        );
        // one randomly chosen neighbour answers
        self.validators
            .committee()
            .send(ConsensusMessage::FetchVotesReq(req), None);
        self.schedule_timeout(st, self.cfg.fetch_interval(), height, round, step);
    }

    fn enter_prevote_wait(&self, st: &mut CoreState, height: u64, round: u32) {
        if st.rs.height != height
            || round < st.rs.round
            || (st.rs.round == round && RoundStep::PrevoteWait <= st.rs.step)
        {
            debug!(
                "[{}] enter_prevote_wait({height}/{round}): invalid args, current {}/{}/{}",
                self.name, st.rs.height, st.rs.round, st.rs.step
            );
            return;
        }
        if !st.rs.votes.prevotes_mut(round).has_two_thirds_any() {
            panic!("enter_prevote_wait({height}/{round}) without +2/3 of any prevotes");
        }
        info!(
            "[{}] enter_prevote_wait({height}/{round}), current {}/{}/{}",
            self.name, st.rs.height, st.rs.round, st.rs.step
        );

        self.schedule_timeout(st, self.cfg.prevote(round), height, round, RoundStep::PrevoteWait);
        st.rs.update_round_step(round, RoundStep::PrevoteWait);
    }

    /// The safety-critical decision: what to precommit given the round's
    /// prevotes, and how the lock moves.
    fn enter_precommit(&self, st: &mut CoreState, height: u64, round: u32) {
        if st.rs.height != height
            || round < st.rs.round
            || (st.rs.round == round && RoundStep::Precommit <= st.rs.step)
        {
            debug!(
                "[{}] enter_precommit({height}/{round}): invalid args, current {}/{}/{}",
                self.name, st.rs.height, st.rs.round, st.rs.step
            );
            return;
        }
        info!(
            "[{}] enter_precommit({height}/{round}), current {}/{}/{}",
            self.name, st.rs.height, st.rs.round, st.rs.step
        );

        let polka = st.rs.votes.prevotes_mut(round).two_thirds_majority();
        let mut precommit = Vote::new(
            VoteType::Precommit,
            height,
            round,
            NIL_DATA,
            st.rs.last_committed_data,
        );

        match polka {
            None => {
                if st.rs.locked_proposal.is_some() {
                    info!(
                        "[{}] no +2/3 prevotes while locked, precommitting nil",
                        self.name
                    );
                } else {
                    info!("[{}] no +2/3 prevotes, precommitting nil", self.name);
                }
                self.sign_add_vote(st, precommit);
            }
            Some(polka) => {
                // the freshest proof-of-lock must be this round
                let pol_round = st.rs.votes.pol_info().map(|(r, _)| r);
                if pol_round != Some(round) {
                    panic!("proof-of-lock round should be {round} but is {pol_round:?}");
                }

                if polka == NIL_DATA {
                    // +2/3 prevoted nil: release any lock and abstain
                    if st.rs.locked_proposal.is_none() {
                        info!("[{}] +2/3 prevoted nil", self.name);
                    } else {
                        info!("[{}] +2/3 prevoted nil, unlocking", self.name);
                        st.rs.locked_round = None;
                        st.rs.locked_proposal = None;
                    }
                    self.sign_add_vote(st, precommit);
                } else if st.rs.locked_round.is_some()
                    && st.rs.locked_proposal.as_ref().is_some_and(|lp| lp.proposed == polka)
                {
                    info!(
                        "[{}] +2/3 prevoted the locked proposal, relocking at round {round}",
                        self.name
                    );
                    st.rs.locked_round = Some(round);
                    precommit.proposed = polka;
                    self.sign_add_vote(st, precommit);
                } else if st.rs.proposal.as_ref().is_some_and(|p| p.proposed == polka) {
                    info!(
                        "[{}] +2/3 prevoted proposal {polka}, locking at round {round}",
                        self.name
                    );
                    st.rs.locked_round = Some(round);
                    st.rs.locked_proposal = st.rs.proposal.clone();
                    precommit.proposed = polka;
                    self.sign_add_vote(st, precommit);
                } else {
                    // a polka for a proposal we never received; any
                    // standing lock was already released by the fan-in
                    if let Some(locked) = &st.rs.locked_proposal {
                        if locked.proposed != polka {
                            error!(
                                "[{}] locked on {} but received a polka for {polka}",
                                self.name, locked.proposed
                            );
                        }
                    }
                    warn!(
                        "[{}] polka for {polka} but its proposal is missing, precommitting nil",
                        self.name
                    );
                    st.rs.locked_round = None;
                    st.rs.locked_proposal = None;
                    self.sign_add_vote(st, precommit);
                }
            }
        }

        st.rs.update_round_step(round, RoundStep::Precommit);
        let (current_height, current_round) = (st.rs.height, st.rs.round);
        self.enter_precommit_fetch(st, current_height, current_round);
    }

    fn enter_precommit_wait(&self, st: &mut CoreState, height: u64, round: u32) {
        if st.rs.height != height
            || round < st.rs.round
            || (st.rs.round == round && RoundStep::PrecommitWait <= st.rs.step)
        {
            debug!(
                "[{}] enter_precommit_wait({height}/{round}): invalid args, current {}/{}/{}",
                self.name, st.rs.height, st.rs.round, st.rs.step
            );
            return;
        }
        if !st.rs.votes.precommits_mut(round).has_two_thirds_any() {
            panic!("enter_precommit_wait({height}/{round}) without +2/3 of any precommits");
        }
        info!(
            "[{}] enter_precommit_wait({height}/{round}), current {}/{}/{}",
            self.name, st.rs.height, st.rs.round, st.rs.step
        );

        self.schedule_timeout(
            st,
            self.cfg.precommit(round),
            height,
            round,
            RoundStep::PrecommitWait,
        );
        st.rs.update_round_step(round, RoundStep::PrecommitWait);
    }

    fn enter_commit(&self, st: &mut CoreState, height: u64, commit_round: u32) {
        if st.rs.height != height || RoundStep::Commit <= st.rs.step {
            debug!(
                "[{}] enter_commit({height}/{commit_round}): invalid args, current {}/{}/{}",
                self.name, st.rs.height, st.rs.round, st.rs.step
            );
            return;
        }
        info!(
            "[{}] enter_commit({height}/{commit_round}), current {}/{}/{}",
            self.name, st.rs.height, st.rs.round, st.rs.step
        );

        let Some(maj23) = st.rs.votes.precommits_mut(commit_round).two_thirds_majority() else {
            panic!("enter_commit({height}/{commit_round}) expects +2/3 precommits");
        };

        st.rs.commit_round = Some(commit_round);
        st.rs.commit_time = unix_millis();
        let current_round = st.rs.round;
        st.rs.update_round_step(current_round, RoundStep::Commit);
        self.do_commit(st, maj23);
    }

    fn do_commit(&self, st: &mut CoreState, data: ProposedData) {
        let Some(commit_round) = st.rs.commit_round else {
            panic!("do_commit without a commit round");
        };
        let mut records = match st.rs.votes.precommits_mut(commit_round).make_commit() {
            Ok(records) => records,
            Err(err) => panic!("failed to build commit records: {err}"),
        };
        if data != records.proposed_data {
            panic!(
                "inconsistent committed data: {data} vs {}",
                records.proposed_data
            );
        }

        // sign the records either way, hosts may keep them as evidence
        records.commit_time = st.rs.commit_time;
        self.validators.sign(&mut records);

        if !st.has_recv_commit_records {
            self.validators
                .committee()
                .broadcast(ConsensusMessage::Commit(records.clone()));
        }
        if let Err(err) = self.validators.committee().commit(&records) {
            error!("[{}] committee rejected commit records: {err}", self.name);
        }

        let app_state = self.validators.committee().app_state();
        self.update_to_app_state(st, app_state);
        st.has_recv_commit_records = false;

        // start_time was set for the new height; schedule its round 0
        self.schedule_round0(st);
    }

    // -- Vote fan-in --

    /// Admit a vote and filter the error kinds: a height mismatch is
    /// benign, conflicting votes are evidence; anything else is reported
    /// as a generic add failure.
    fn try_add_vote(&self, st: &mut CoreState, vote: &Vote) -> Result<bool> {
        match self.add_vote(st, vote) {
            Ok(added) => Ok(added),
            Err(err @ ConsensusError::VoteHeightMismatch { .. }) => Err(err),
            Err(err @ ConsensusError::ConflictingVotes(_)) => {
                warn!("[{}] conflicting votes retained: {err}", self.name);
                Err(err)
            }
            Err(err) => {
                warn!("[{}] error attempting to add vote: {err}", self.name);
                Err(ConsensusError::AddingVote)
            }
        }
    }

    fn add_vote(&self, st: &mut CoreState, vote: &Vote) -> Result<bool> {
        debug!(
            "[{}] add_vote {} at core height {}",
            self.name, vote, st.rs.height
        );

        // A precommit for the previous height? These come in while we
        // wait out the commit gap.
        if vote.height + 1 == st.rs.height {
            let is_straggler =
                st.rs.step == RoundStep::NewHeight && vote.vote_type == VoteType::Precommit;
            let added = match (is_straggler, st.rs.last_commit.as_mut()) {
                (true, Some(last_commit)) => last_commit.add_vote(vote)?,
                _ => {
                    return Err(ConsensusError::VoteHeightMismatch {
                        got: vote.height,
                        want: st.rs.height,
                    })
                }
            };
            if !added {
                return Ok(false);
            }
            if let Some(last_commit) = &st.rs.last_commit {
                info!(
                    "[{}] added straggler precommit, last commit now {last_commit}",
                    self.name
                );
            }
            // with every closing precommit in hand the commit gap has
            // nothing left to wait for
            if self.cfg.skip_timeout_commit
                && st.rs.last_commit.as_ref().is_some_and(|lc| lc.has_all())
            {
                let height = st.rs.height;
                self.enter_new_round(st, height, 0);
            }
            return Ok(true);
        }

        if vote.height != st.rs.height {
            info!(
                "[{}] vote ignored and not added: vote height {}, core height {}",
                self.name, vote.height, st.rs.height
            );
            return Err(ConsensusError::VoteHeightMismatch {
                got: vote.height,
                want: st.rs.height,
            });
        }

        if vote.vote_type == VoteType::Proposal {
            self.default_set_proposal(st, vote)?;
            return Ok(true);
        }

        let height = st.rs.height;
        let vote_round = vote.round;

        let conflict = match st.rs.votes.add_vote(vote) {
            Ok(true) => None,
            Ok(false) => return Ok(false),
            Err(err @ ConsensusError::ConflictingVotes(_)) => Some(err),
            Err(err) => {
                debug!("[{}] vote not added: {err}", self.name);
                return Err(err);
            }
        };

        match vote.vote_type {
            VoteType::Prevote => {
                let (polka, any) = {
                    let prevotes = st.rs.votes.prevotes_mut(vote_round);
                    (prevotes.two_thirds_majority(), prevotes.has_two_thirds_any())
                };

                if let Some(polka) = polka {
                    info!("[{}] polka at {height}/{vote_round} for {polka}", self.name);

                    // a lock is released by any newer polka for a
                    // different value
                    let unlock = st.rs.locked_round.is_some_and(|locked_round| {
                        locked_round < vote_round
                            && st
                                .rs
                                .locked_proposal
                                .as_ref()
                                .is_some_and(|lp| lp.proposed != polka)
                    });
                    if unlock {
                        info!(
                            "[{}] unlocking: locked round {:?}, polka round {vote_round}",
                            self.name, st.rs.locked_round
                        );
                        st.rs.locked_round = None;
                        st.rs.locked_proposal = None;
                    }

                    // our accepted proposal may not be what the polka
                    // named; drop it so the fetch path can resync
                    if polka != NIL_DATA
                        && vote_round == st.rs.round
                        && st.rs.proposal.as_ref().is_some_and(|p| p.proposed != polka)
                    {
                        warn!(
                            "[{}] polka for {polka} contradicts our proposal, clearing it",
                            self.name
                        );
                        st.rs.proposal = None;
                    }
                }

                if st.rs.round < vote_round && any {
                    // round-skip on +2/3 of anything ahead of us
                    self.enter_new_round(st, height, vote_round);
                } else if st.rs.round == vote_round && RoundStep::Prevote <= st.rs.step {
                    if polka.is_some() {
                        self.enter_precommit(st, height, vote_round);
                    } else if any {
                        self.enter_prevote_wait(st, height, vote_round);
                    }
                } else if st.rs.step < RoundStep::Prevote {
                    // wait for our proposal before prevoting
                    if st.rs.proposal.is_some() {
                        let current_round = st.rs.round;
                        self.enter_prevote(st, height, current_round);
                    } else {
                        debug!(
                            "[{}] prevote for {} but we have no proposal yet",
                            self.name, vote.proposed
                        );
                    }
                }
            }
            VoteType::Precommit => {
                let (maj23, any, all) = {
                    let precommits = st.rs.votes.precommits_mut(vote_round);
                    (
                        precommits.two_thirds_majority(),
                        precommits.has_two_thirds_any(),
                        precommits.has_all(),
                    )
                };

                match maj23 {
                    Some(data) => {
                        // run in order; the majority could be from a
                        // round ahead of us
                        self.enter_new_round(st, height, vote_round);
                        self.enter_precommit(st, height, vote_round);
                        if data != NIL_DATA {
                            self.enter_commit(st, height, vote_round);
                            if self.cfg.skip_timeout_commit && all {
                                let new_height = st.rs.height;
                                self.enter_new_round(st, new_height, 0);
                            }
                        } else {
                            // the round precommitted nil; wait briefly
                            // for stragglers, then move on
                            self.enter_precommit_wait(st, height, vote_round);
                        }
                    }
                    None if st.rs.round <= vote_round && any => {
                        self.enter_new_round(st, height, vote_round);
                        self.enter_precommit_wait(st, height, vote_round);
                    }
                    None => {}
                }
            }
            VoteType::Proposal => {
                panic!("proposal vote reached the tally fan-in");
            }
        }

        match conflict {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }

    /// Accept a proposal vote for the current height and round, if it
    /// comes from the designated proposer with a valid signature and the
    /// committee approves its value.
    fn default_set_proposal(&self, st: &mut CoreState, proposal: &Vote) -> Result<()> {
        // already have one
        if st.rs.proposal.is_some() {
            return Ok(());
        }

        if proposal.height != st.rs.height || proposal.round != st.rs.round {
            warn!(
                "[{}] proposal height or round mismatch: {proposal}",
                self.name
            );
            return Ok(());
        }
        if proposal.prev != st.rs.last_committed_data {
            warn!("[{}] proposal with invalid base: {proposal}", self.name);
            return Ok(());
        }

        let expected = self.validators.committee().current_proposer(st.rs.round);
        if expected != proposal.address {
            error!(
                "[{}] invalid proposer: want {expected}, got {}",
                self.name, proposal.address
            );
            return Err(ConsensusError::InvalidProposer {
                want: expected,
                got: proposal.address,
            });
        }
        if !self.validators.verify(proposal) {
            error!("[{}] invalid proposal signature: {proposal}", self.name);
            return Err(ConsensusError::InvalidProposalSignature);
        }

        if self.validators.committee().validate_proposal(proposal.proposed) {
            debug!("[{}] accepted proposal {proposal}", self.name);
            st.rs.proposal = Some(proposal.clone());
            let (height, round) = (st.rs.height, st.rs.round);
            self.enter_prevote(st, height, round);
        } else {
            warn!(
                "[{}] proposal {} rejected by the committee",
                self.name, proposal.proposed
            );
        }
        Ok(())
    }

    // -- Plumbing --

    /// Sign the vote, feed it back through the queue, and broadcast it.
    /// Returns the signed vote, or `None` when this node is not a
    /// validator.
    fn sign_add_vote(&self, st: &mut CoreState, mut vote: Vote) -> Option<Vote> {
        if !self.is_validator() {
            return None;
        }
        self.validators.sign(&mut vote);
        self.send_internal(
            st,
            MsgInfo {
                msg: ConsensusMessage::Vote(vote.clone()),
                peer: None,
            },
        );
        self.validators
            .committee()
            .broadcast(ConsensusMessage::Vote(vote.clone()));
        Some(vote)
    }

    /// Self-originated messages must not block: the receive thread is
    /// the only consumer of the queue and it is the caller here, so a
    /// full queue drops the message instead of deadlocking.
    fn send_internal(&self, st: &mut CoreState, mi: MsgInfo) {
        match self.msg_tx.try_send(mi) {
            Ok(()) => {}
            Err(TrySendError::Full(mi)) => {
                st.dropped_internal += 1;
                warn!(
                    "[{}] internal msg queue full, dropping {} ({} dropped so far)",
                    self.name,
                    mi.msg.kind(),
                    st.dropped_internal
                );
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn is_validator(&self) -> bool {
        let self_key = self.validators.self_pub_key();
        self.validators.committee().is_validator(&self_key)
    }

    fn update_to_app_state(&self, st: &mut CoreState, app_state: AppState) {
        if st.rs.commit_round.is_some() && st.rs.height > 0 && st.rs.height > app_state.last_height
        {
            panic!(
                "update_to_app_state expected state height {} but found {}",
                st.rs.height, app_state.last_height
            );
        }

        let last_precommits = match st.rs.commit_round {
            Some(commit_round) => {
                let precommits = st.rs.votes.precommits_mut(commit_round);
                if !precommits.has_two_thirds_majority() {
                    panic!("updating to app state but the commit round has no +2/3");
                }
                Some(precommits.clone())
            }
            None => None,
        };

        // next desired height
        st.rs.height = app_state.last_height + 1;
        st.rs.update_round_step(0, RoundStep::NewHeight);
        st.rs.start_time = if st.rs.commit_time == 0 {
            // first boot; the gap lets the host gather initial work
            self.cfg.commit(unix_millis())
        } else {
            self.cfg.commit(st.rs.commit_time)
        };

        st.rs.proposal = None;
        st.rs.locked_round = None;
        st.rs.locked_proposal = None;
        st.rs.commit_round = None;
        st.rs.last_commit = last_precommits;
        st.rs.last_committed_data = app_state.last_proposed_data;
        st.rs.votes = HeightVoteSet::new(
            st.rs.height,
            self.validators.clone(),
            app_state.last_proposed_data,
        );
    }

    /// Arm the NewHeight timeout that opens round 0 at `start_time`.
    fn schedule_round0(&self, st: &mut CoreState) {
        let now = unix_millis();
        info!(
            "[{}] scheduling round 0 of height {}: now {now}, start time {}",
            self.name, st.rs.height, st.rs.start_time
        );
        let sleep = Duration::from_millis(st.rs.start_time.saturating_sub(now).max(0) as u64);
        let height = st.rs.height;
        self.schedule_timeout(st, sleep, height, 0, RoundStep::NewHeight);
    }

    fn schedule_timeout(
        &self,
        st: &CoreState,
        duration: Duration,
        height: u64,
        round: u32,
        step: RoundStep,
    ) {
        debug!(
            "[{}] schedule timeout {duration:?} for {height}/{round}/{step}",
            self.name
        );
        if let Some(ticker) = &st.ticker {
            ticker.schedule_timeout(TimeoutInfo {
                duration,
                height,
                round,
                step,
            });
        }
    }
}

// -- Tests --
