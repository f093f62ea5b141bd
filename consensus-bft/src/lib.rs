//! Tessera Tendermint-style BFT consensus core.
//!
//! This crate drives a committee of replicated validators through rounds
//! of proposal, prevote, precommit, and commit in order to agree on an
//! ordered sequence of opaque application-defined values, tolerating up
//! to `f` faulty participants out of `3f + 1` by voting power:
//!
//! 1. **Propose**: the round's designated proposer offers a value.
//! 2. **Prevote**: validators evaluate the proposal and broadcast
//!    prevotes; +2/3 for one value is a polka.
//! 3. **Precommit**: upon a polka, validators lock on the value and
//!    broadcast precommits.
//! 4. **Commit**: upon +2/3 precommits for a non-nil value, the height
//!    is decided and the commit record is handed to the application.
//!
//! # Key properties
//!
//! - **Safety**: no two conflicting values commit at one height while
//!   less than 1/3 of the voting power is Byzantine; the lock/unlock
//!   discipline (release only on a newer polka) enforces it.
//! - **Liveness**: timeout-driven round escalation with linearly growing
//!   timeouts, round-skipping on +2/3 of any votes from a future round,
//!   and a vote-fetch loop that recovers missing votes from peers.
//! - **Accountability**: conflicting votes are retained as double-sign
//!   evidence.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                      Core                        │
//! │  ┌─────────┐  ┌───────────────┐  ┌────────────┐  │
//! │  │ Config  │  │ HeightVoteSet │  │ Timeout    │  │
//! │  │         │  │  (VoteSets)   │  │ Ticker     │  │
//! │  └─────────┘  └───────────────┘  └────────────┘  │
//! │  ┌──────────────────────────────────────────┐    │
//! │  │               RoundState                 │    │
//! │  │   height, round, step, lock, proposal    │    │
//! │  └──────────────────────────────────────────┘    │
//! └───────────────┬──────────────────┬───────────────┘
//!                 │                  │
//!           Committee          PrivateValidator
//!      (host application,        (key custody)
//!       peers, persistence)
//! ```
//!
//! The host supplies the [`Committee`] and [`PrivateValidator`]
//! capabilities; everything else, including the receive loop and all
//! state transitions, lives in [`Core`].

pub mod committee;
pub mod config;
pub mod core;
pub mod error;
pub mod height_vote_set;
pub mod message;
pub mod round_state;
pub mod timeout;
pub mod vote_set;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports for convenience
pub use crate::{
    committee::{Committee, PeerId, PrivateValidator, Validators},
    config::{Config, ConfigError},
    core::Core,
    error::{ConsensusError, Result},
    height_vote_set::HeightVoteSet,
    message::{
        AppState, Commit, ConsensusMessage, FetchVotesReq, FetchVotesRsp, ProposedData, Signable,
        Vote, VoteType, NIL_DATA,
    },
    round_state::{RoundState, RoundStep},
    timeout::{TimeoutInfo, TimeoutTicker},
    vote_set::{ConflictEvidence, VoteSet},
};
