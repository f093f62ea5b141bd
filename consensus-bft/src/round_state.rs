//! The replicated state machine's snapshot.
//!
//! [`RoundState`] is owned exclusively by the driver; observers receive
//! clones. [`RoundStep`] orders the steps of one round, which is also the
//! order timeouts supersede each other in.

use {
    crate::{
        height_vote_set::HeightVoteSet,
        message::{ProposedData, Vote, NIL_DATA},
        vote_set::VoteSet,
    },
    std::fmt,
};

/// Steps within one consensus round, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoundStep {
    /// Waiting for the height's start time.
    NewHeight,
    /// Round bookkeeping reset.
    NewRound,
    /// Waiting for the designated proposer's offer.
    Propose,
    /// Our prevote has been cast.
    Prevote,
    /// Polling peers for prevotes we lack.
    PrevoteFetch,
    /// +2/3 of any prevotes seen; waiting briefly for a polka.
    PrevoteWait,
    /// Our precommit has been cast.
    Precommit,
    /// Polling peers for precommits we lack.
    PrecommitFetch,
    /// +2/3 of any precommits seen; waiting briefly for a majority.
    PrecommitWait,
    /// The height is decided.
    Commit,
}

impl fmt::Display for RoundStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundStep::NewHeight => "NewHeight",
            RoundStep::NewRound => "NewRound",
            RoundStep::Propose => "Propose",
            RoundStep::Prevote => "Prevote",
            RoundStep::PrevoteFetch => "PrevoteFetch",
            RoundStep::PrevoteWait => "PrevoteWait",
            RoundStep::Precommit => "Precommit",
            RoundStep::PrecommitFetch => "PrecommitFetch",
            RoundStep::PrecommitWait => "PrecommitWait",
            RoundStep::Commit => "Commit",
        };
        write!(f, "{name}")
    }
}

/// Snapshot of the consensus state machine for one height.
#[derive(Debug, Clone)]
pub struct RoundState {
    /// Height being decided.
    pub height: u64,
    /// Current round within the height.
    pub round: u32,
    /// Current step within the round.
    pub step: RoundStep,
    /// Earliest Unix-millisecond time round 0 of `height` may begin.
    pub start_time: i64,
    /// When the local commit decision was made; 0 until then.
    pub commit_time: i64,
    /// Accepted proposal for the current height and round.
    pub proposal: Option<Vote>,
    /// The proposal this node is locked on, if any.
    pub locked_proposal: Option<Vote>,
    /// Round the lock was last confirmed in; `None` when unlocked.
    pub locked_round: Option<u32>,
    /// Vote accounting for `height`.
    pub votes: HeightVoteSet,
    /// Round at which this height committed; `None` until commit.
    pub commit_round: Option<u32>,
    /// Precommit set of the previous height's commit round.
    pub last_commit: Option<VoteSet>,
    /// The data that closed the previous height.
    pub last_committed_data: ProposedData,
}

impl RoundState {
    pub(crate) fn new(votes: HeightVoteSet) -> Self {
        Self {
            height: 0,
            round: 0,
            step: RoundStep::NewHeight,
            start_time: 0,
            commit_time: 0,
            proposal: None,
            locked_proposal: None,
            locked_round: None,
            votes,
            commit_round: None,
            last_commit: None,
            last_committed_data: NIL_DATA,
        }
    }

    /// Advance to `(round, step)`.
    pub(crate) fn update_round_step(&mut self, round: u32, step: RoundStep) {
        self.round = round;
        self.step = step;
    }
}
