//! Error types for the consensus core.
//!
//! Remote-origin failures are recovered locally: the driver logs them and
//! drops the offending message. Local invariant violations do not appear
//! here; they abort the consensus task via panic.

use {crate::message::ProposedData, solana_pubkey::Pubkey, thiserror::Error};

/// Errors produced by the consensus core.
#[derive(Error, Debug)]
pub enum ConsensusError {
    /// Vote for a height other than the one being decided (and not a
    /// straggling precommit for the previous height).
    #[error("vote height {got} does not apply at height {want}")]
    VoteHeightMismatch { got: u64, want: u64 },

    /// Same signer, same (height, round, type), different value. The
    /// conflicting vote is retained as evidence by the vote set.
    #[error("conflicting votes from validator {0}")]
    ConflictingVotes(Pubkey),

    /// Catch-all for vote admission failures that are neither a height
    /// mismatch nor conflict evidence.
    #[error("failed to add vote")]
    AddingVote,

    /// Proposal signer is not the designated proposer for the round.
    #[error("invalid proposer: want {want}, got {got}")]
    InvalidProposer { want: Pubkey, got: Pubkey },

    /// Proposal signature failed verification.
    #[error("invalid proposal signature")]
    InvalidProposalSignature,

    /// Vote signer is not a committee member at this height.
    #[error("signer {0} is not a validator")]
    NotValidator(Pubkey),

    /// Vote signature failed verification.
    #[error("invalid signature from {0}")]
    InvalidSignature(Pubkey),

    /// Vote was offered to a set with a different (height, round, type).
    #[error("vote does not match this vote set")]
    VoteSetMismatch,

    /// Vote binds to a different chain prefix than this height builds on.
    #[error("vote base {got} does not extend {want}")]
    InvalidVoteBase { got: ProposedData, want: ProposedData },

    /// Vote for a round beyond the tracked watermark.
    #[error("vote round {round} is beyond the tracked round {watermark}")]
    FutureRound { round: u32, watermark: u32 },

    /// A commit was requested from a set without a +2/3 majority.
    #[error("vote set has no +2/3 majority to commit")]
    CommitWithoutMajority,

    /// A commit was requested for the nil value.
    #[error("refusing to build a commit for nil")]
    CommitOnNil,

    /// A message failed its basic validity checks.
    #[error("malformed message: {0}")]
    InvalidMessage(String),

    /// Message encoding or decoding failed.
    #[error("message serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    /// The core is not running.
    #[error("consensus core is not running")]
    NotRunning,

    /// The core is already running.
    #[error("consensus core already started")]
    AlreadyRunning,

    /// A start or stop is already in progress on another thread.
    #[error("consensus core is in the middle of a start or stop")]
    StartStopInProgress,

    /// The component was stopped and cannot be restarted.
    #[error("already stopped")]
    AlreadyStopped,

    /// Committee-side failure surfaced back to the driver.
    #[error("committee error: {0}")]
    Committee(String),
}

/// Convenience result type for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;
