//! Round-indexed vote accounting for one height.
//!
//! Keeps a prevote and a precommit [`VoteSet`] per round, up to a
//! watermark that grows one round ahead of the driver so round-skip
//! votes are admitted. Votes beyond the watermark are refused.

use {
    crate::{
        committee::Validators,
        error::{ConsensusError, Result},
        message::{ProposedData, Vote, VoteType},
        vote_set::VoteSet,
    },
    std::{collections::BTreeMap, sync::Arc},
};

#[derive(Debug, Clone)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

impl RoundVoteSet {
    fn new(height: u64, round: u32, prev: ProposedData, validators: Arc<Validators>) -> Self {
        Self {
            prevotes: VoteSet::new(height, round, VoteType::Prevote, prev, validators.clone()),
            precommits: VoteSet::new(height, round, VoteType::Precommit, prev, validators),
        }
    }
}

/// Per-round prevote and precommit sets for one height.
#[derive(Debug, Clone)]
pub struct HeightVoteSet {
    height: u64,
    validators: Arc<Validators>,
    /// The data that closed the previous height; every vote set of this
    /// height binds to it.
    last_committed: ProposedData,
    round_vote_sets: BTreeMap<u32, RoundVoteSet>,
    /// Highest round currently tracked.
    round: u32,
}

impl HeightVoteSet {
    pub fn new(height: u64, validators: Arc<Validators>, last_committed: ProposedData) -> Self {
        let mut hvs = Self {
            height,
            validators,
            last_committed,
            round_vote_sets: BTreeMap::new(),
            round: 0,
        };
        hvs.ensure_round(0);
        hvs
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// The tracked watermark.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Grow the watermark to `max(current, round)`; never shrinks.
    pub fn set_round(&mut self, round: u32) {
        if round > self.round {
            self.round = round;
        }
        self.ensure_round(self.round);
    }

    fn ensure_round(&mut self, round: u32) {
        if !self.round_vote_sets.contains_key(&round) {
            let rvs = RoundVoteSet::new(
                self.height,
                round,
                self.last_committed,
                self.validators.clone(),
            );
            self.round_vote_sets.insert(round, rvs);
        }
    }

    /// The prevote set of `round`, created on demand.
    pub fn prevotes_mut(&mut self, round: u32) -> &mut VoteSet {
        self.ensure_round(round);
        &mut self
            .round_vote_sets
            .get_mut(&round)
            .expect("round vote set just ensured")
            .prevotes
    }

    /// The precommit set of `round`, created on demand.
    pub fn precommits_mut(&mut self, round: u32) -> &mut VoteSet {
        self.ensure_round(round);
        &mut self
            .round_vote_sets
            .get_mut(&round)
            .expect("round vote set just ensured")
            .precommits
    }

    /// Read-only view of the prevote set of `round`, if it exists.
    pub fn prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|rvs| &rvs.prevotes)
    }

    /// Read-only view of the precommit set of `round`, if it exists.
    pub fn precommits(&self, round: u32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|rvs| &rvs.precommits)
    }

    /// Dispatch a vote to its round's set. Votes beyond the watermark
    /// are refused.
    pub fn add_vote(&mut self, vote: &Vote) -> Result<bool> {
        if vote.round > self.round {
            return Err(ConsensusError::FutureRound {
                round: vote.round,
                watermark: self.round,
            });
        }
        match vote.vote_type {
            VoteType::Prevote => self.prevotes_mut(vote.round).add_vote(vote),
            VoteType::Precommit => self.precommits_mut(vote.round).add_vote(vote),
            VoteType::Proposal => Err(ConsensusError::InvalidMessage(
                "proposal votes are not tallied".into(),
            )),
        }
    }

    /// The freshest proof-of-lock: the highest tracked round whose
    /// prevotes hold a +2/3 majority (nil counts), with that value.
    pub fn pol_info(&self) -> Option<(u32, ProposedData)> {
        for (round, rvs) in self.round_vote_sets.iter().rev() {
            if let Some(data) = rvs.prevotes.two_thirds_majority() {
                return Some((*round, data));
            }
        }
        None
    }
}
