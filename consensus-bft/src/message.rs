//! Consensus message types.
//!
//! Defines the opaque proposal identifier, the [`Vote`] record shared by
//! all three vote kinds (proposal, prevote, precommit), the [`Commit`]
//! bundle proving a +2/3 precommit majority, and the vote-fetch
//! request/response pair used to recover missing votes. The top-level
//! [`ConsensusMessage`] enum is the unit the driver consumes; hosts that
//! put it on a wire serialize it with bincode.

use {
    crate::error::{ConsensusError, Result},
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::{
        fmt,
        time::{SystemTime, UNIX_EPOCH},
    },
};

/// Opaque, fixed-size identifier of a proposal. The core never inspects
/// its contents; it only compares, hashes, and forwards it.
pub type ProposedData = Hash;

/// Reserved value meaning "vote for nothing". Voting for it is legal and
/// expresses abstention.
pub const NIL_DATA: ProposedData = Hash::new_from_array([0u8; 32]);

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// A message that is signed in place before transmission.
///
/// The digest covers every field except the signature itself, so the
/// signer identity must be assigned before the digest is computed.
pub trait Signable {
    /// Deterministic digest of the message content.
    fn signing_digest(&self) -> Hash;
    /// The identity the message claims to be signed by.
    fn signer(&self) -> &Pubkey;
    /// The attached signature.
    fn signature(&self) -> &Signature;
    /// Assign the signer identity.
    fn set_signer(&mut self, signer: Pubkey);
    /// Attach the signature.
    fn set_signature(&mut self, signature: Signature);
}

// ---------------------------------------------------------------------------
// Votes
// ---------------------------------------------------------------------------

/// Discriminates the three vote kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteType {
    /// The designated proposer's offer for the round.
    Proposal,
    /// First-phase vote cast after evaluating the proposal.
    Prevote,
    /// Second-phase vote cast after observing a prevote polka.
    Precommit,
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Proposal => write!(f, "Proposal"),
            VoteType::Prevote => write!(f, "Prevote"),
            VoteType::Precommit => write!(f, "Precommit"),
        }
    }
}

/// A signed vote record.
///
/// `prev` names the data that closed the previous height, binding the
/// vote to a chain prefix; votes built on a different prefix are refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: u64,
    pub round: u32,
    /// The value this vote endorses; `NIL_DATA` expresses abstention.
    pub proposed: ProposedData,
    /// The data that closed the previous height.
    pub prev: ProposedData,
    /// The signer's identity.
    pub address: Pubkey,
    pub signature: Signature,
    /// Unix milliseconds at vote creation.
    pub timestamp: i64,
}

impl Vote {
    /// Build an unsigned vote stamped with the current time.
    pub fn new(
        vote_type: VoteType,
        height: u64,
        round: u32,
        proposed: ProposedData,
        prev: ProposedData,
    ) -> Self {
        Self {
            vote_type,
            height,
            round,
            proposed,
            prev,
            address: Pubkey::default(),
            signature: Signature::default(),
            timestamp: unix_millis(),
        }
    }

    /// Structural validity: populated signer and signature, plausible
    /// height, and a non-nil value on proposals.
    pub fn validate_basic(&self) -> Result<()> {
        if self.height == 0 {
            return Err(ConsensusError::InvalidMessage(
                "vote height must be positive".into(),
            ));
        }
        if self.address == Pubkey::default() {
            return Err(ConsensusError::InvalidMessage("vote has no signer".into()));
        }
        if self.signature == Signature::default() {
            return Err(ConsensusError::InvalidMessage("vote is unsigned".into()));
        }
        if self.vote_type == VoteType::Proposal && self.proposed == NIL_DATA {
            return Err(ConsensusError::InvalidMessage(
                "proposal vote for nil".into(),
            ));
        }
        Ok(())
    }
}

impl Signable for Vote {
    fn signing_digest(&self) -> Hash {
        solana_sha256_hasher::hashv(&[
            &[self.vote_type as u8],
            &self.height.to_le_bytes(),
            &self.round.to_le_bytes(),
            self.proposed.as_ref(),
            self.prev.as_ref(),
            self.address.as_ref(),
            &self.timestamp.to_le_bytes(),
        ])
    }

    fn signer(&self) -> &Pubkey {
        &self.address
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn set_signer(&mut self, signer: Pubkey) {
        self.address = signer;
    }

    fn set_signature(&mut self, signature: Signature) {
        self.signature = signature;
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} for {} by {}",
            self.vote_type, self.height, self.round, self.proposed, self.address
        )
    }
}

// ---------------------------------------------------------------------------
// Commits
// ---------------------------------------------------------------------------

/// Proof that `proposed_data` gathered +2/3 precommits at
/// `(height, round)`. Signed by whichever validator assembled it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub height: u64,
    pub round: u32,
    pub proposed_data: ProposedData,
    /// The precommits backing this commit, in canonical signer order.
    pub precommits: Vec<Vote>,
    /// Unix milliseconds at which the assembler decided the commit.
    pub commit_time: i64,
    /// The assembler's identity.
    pub address: Pubkey,
    pub signature: Signature,
}

impl Commit {
    /// Structural validity of the bundle and of every contained vote.
    pub fn validate_basic(&self) -> Result<()> {
        if self.height == 0 {
            return Err(ConsensusError::InvalidMessage(
                "commit height must be positive".into(),
            ));
        }
        if self.proposed_data == NIL_DATA {
            return Err(ConsensusError::InvalidMessage("commit for nil".into()));
        }
        if self.precommits.is_empty() {
            return Err(ConsensusError::InvalidMessage(
                "commit carries no precommits".into(),
            ));
        }
        for vote in &self.precommits {
            if vote.vote_type != VoteType::Precommit {
                return Err(ConsensusError::InvalidMessage(
                    "commit carries a non-precommit vote".into(),
                ));
            }
            if vote.height != self.height || vote.round != self.round {
                return Err(ConsensusError::InvalidMessage(
                    "commit precommit from a different height or round".into(),
                ));
            }
            vote.validate_basic()?;
        }
        Ok(())
    }
}

impl Signable for Commit {
    fn signing_digest(&self) -> Hash {
        solana_sha256_hasher::hashv(&[
            &self.height.to_le_bytes(),
            &self.round.to_le_bytes(),
            self.proposed_data.as_ref(),
            &self.commit_time.to_le_bytes(),
            &(self.precommits.len() as u64).to_le_bytes(),
            self.address.as_ref(),
        ])
    }

    fn signer(&self) -> &Pubkey {
        &self.address
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn set_signer(&mut self, signer: Pubkey) {
        self.address = signer;
    }

    fn set_signature(&mut self, signature: Signature) {
        self.signature = signature;
    }
}

// ---------------------------------------------------------------------------
// Vote fetch
// ---------------------------------------------------------------------------

/// Request for votes the sender is missing at one `(height, round, type)`.
///
/// `bitmap` has one bit per roster index in the committee's canonical
/// order, set when the requester already holds that validator's vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchVotesReq {
    pub vote_type: VoteType,
    pub height: u64,
    pub round: u32,
    pub bitmap: Vec<u8>,
    pub address: Pubkey,
    pub signature: Signature,
}

impl FetchVotesReq {
    pub fn validate_basic(&self) -> Result<()> {
        if self.vote_type == VoteType::Proposal {
            return Err(ConsensusError::InvalidMessage(
                "proposals are not fetched by bitmap".into(),
            ));
        }
        if self.height == 0 {
            return Err(ConsensusError::InvalidMessage(
                "fetch height must be positive".into(),
            ));
        }
        if self.bitmap.is_empty() {
            return Err(ConsensusError::InvalidMessage("empty fetch bitmap".into()));
        }
        if self.address == Pubkey::default() || self.signature == Signature::default() {
            return Err(ConsensusError::InvalidMessage(
                "fetch request is unsigned".into(),
            ));
        }
        Ok(())
    }
}

impl Signable for FetchVotesReq {
    fn signing_digest(&self) -> Hash {
        solana_sha256_hasher::hashv(&[
            &[self.vote_type as u8],
            &self.height.to_le_bytes(),
            &self.round.to_le_bytes(),
            &self.bitmap,
            self.address.as_ref(),
        ])
    }

    fn signer(&self) -> &Pubkey {
        &self.address
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn set_signer(&mut self, signer: Pubkey) {
        self.address = signer;
    }

    fn set_signature(&mut self, signature: Signature) {
        self.signature = signature;
    }
}

/// Votes the responder holds that the requester's bitmap lacked.
///
/// When answering from commit history the contained votes may come from
/// an earlier round than the request named, so vote rounds are not
/// checked against `round` here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchVotesRsp {
    pub vote_type: VoteType,
    pub height: u64,
    pub round: u32,
    pub missing_votes: Vec<Vote>,
    pub address: Pubkey,
    pub signature: Signature,
}

impl FetchVotesRsp {
    pub fn validate_basic(&self) -> Result<()> {
        if self.vote_type == VoteType::Proposal {
            return Err(ConsensusError::InvalidMessage(
                "proposals are not fetched by bitmap".into(),
            ));
        }
        if self.address == Pubkey::default() || self.signature == Signature::default() {
            return Err(ConsensusError::InvalidMessage(
                "fetch response is unsigned".into(),
            ));
        }
        for vote in &self.missing_votes {
            if vote.vote_type != self.vote_type || vote.height != self.height {
                return Err(ConsensusError::InvalidMessage(
                    "fetch response vote does not match its header".into(),
                ));
            }
            vote.validate_basic()?;
        }
        Ok(())
    }
}

impl Signable for FetchVotesRsp {
    fn signing_digest(&self) -> Hash {
        solana_sha256_hasher::hashv(&[
            &[self.vote_type as u8],
            &self.height.to_le_bytes(),
            &self.round.to_le_bytes(),
            &(self.missing_votes.len() as u64).to_le_bytes(),
            self.address.as_ref(),
        ])
    }

    fn signer(&self) -> &Pubkey {
        &self.address
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn set_signer(&mut self, signer: Pubkey) {
        self.address = signer;
    }

    fn set_signature(&mut self, signature: Signature) {
        self.signature = signature;
    }
}

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

/// The committed application state the next height builds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
    /// The most recently committed height.
    pub last_height: u64,
    /// The data that closed `last_height`.
    pub last_proposed_data: ProposedData,
}

// ---------------------------------------------------------------------------
// Top-level message
// ---------------------------------------------------------------------------

/// Every inbound or outbound consensus message is one of these variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Vote(Vote),
    Commit(Commit),
    FetchVotesReq(FetchVotesReq),
    FetchVotesRsp(FetchVotesRsp),
}

impl ConsensusMessage {
    /// Dispatch to the variant's structural validity check.
    pub fn validate_basic(&self) -> Result<()> {
        match self {
            ConsensusMessage::Vote(v) => v.validate_basic(),
            ConsensusMessage::Commit(c) => c.validate_basic(),
            ConsensusMessage::FetchVotesReq(r) => r.validate_basic(),
            ConsensusMessage::FetchVotesRsp(r) => r.validate_basic(),
        }
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusMessage::Vote(v) => match v.vote_type {
                VoteType::Proposal => "proposal",
                VoteType::Prevote => "prevote",
                VoteType::Precommit => "precommit",
            },
            ConsensusMessage::Commit(_) => "commit",
            ConsensusMessage::FetchVotesReq(_) => "fetch_votes_req",
            ConsensusMessage::FetchVotesRsp(_) => "fetch_votes_rsp",
        }
    }

    /// Serialize to bytes with bincode.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_vote(vote_type: VoteType) -> Vote {
        let mut vote = Vote::new(vote_type, 1, 0, Hash::new_unique(), NIL_DATA);
        vote.address = Pubkey::new_unique();
        vote.signature = Signature::from([7u8; 64]);
        vote
    }

    #[test]
    fn test_vote_digest_deterministic() {
        let vote = filled_vote(VoteType::Prevote);
        assert_eq!(vote.signing_digest(), vote.signing_digest());
    }

    #[test]
    fn test_vote_digest_changes_with_fields() {
        let vote = filled_vote(VoteType::Prevote);
        let mut other = vote.clone();
        other.round = 1;
        assert_ne!(vote.signing_digest(), other.signing_digest());

        let mut other = vote.clone();
        other.proposed = Hash::new_unique();
        assert_ne!(vote.signing_digest(), other.signing_digest());

        let mut other = vote.clone();
        other.vote_type = VoteType::Precommit;
        assert_ne!(vote.signing_digest(), other.signing_digest());
    }

    #[test]
    fn test_vote_validate_basic() {
        assert!(filled_vote(VoteType::Prevote).validate_basic().is_ok());

        let mut vote = filled_vote(VoteType::Prevote);
        vote.height = 0;
        assert!(vote.validate_basic().is_err());

        let mut vote = filled_vote(VoteType::Prevote);
        vote.signature = Signature::default();
        assert!(vote.validate_basic().is_err());

        let mut vote = filled_vote(VoteType::Proposal);
        vote.proposed = NIL_DATA;
        assert!(vote.validate_basic().is_err());
    }

    #[test]
    fn test_nil_prevote_is_valid() {
        let mut vote = filled_vote(VoteType::Prevote);
        vote.proposed = NIL_DATA;
        assert!(vote.validate_basic().is_ok());
    }

    #[test]
    fn test_commit_validate_basic() {
        let vote = {
            let mut v = filled_vote(VoteType::Precommit);
            v.height = 3;
            v.round = 1;
            v
        };
        let commit = Commit {
            height: 3,
            round: 1,
            proposed_data: vote.proposed,
            precommits: vec![vote.clone()],
            commit_time: 1_000,
            address: Pubkey::new_unique(),
            signature: Signature::from([9u8; 64]),
        };
        assert!(commit.validate_basic().is_ok());

        let mut bad = commit.clone();
        bad.precommits.clear();
        assert!(bad.validate_basic().is_err());

        let mut bad = commit.clone();
        bad.precommits[0].round = 0;
        assert!(bad.validate_basic().is_err());

        let mut bad = commit;
        bad.proposed_data = NIL_DATA;
        assert!(bad.validate_basic().is_err());
    }

    #[test]
    fn test_fetch_req_validate_basic() {
        let req = FetchVotesReq {
            vote_type: VoteType::Prevote,
            height: 1,
            round: 0,
            bitmap: vec![0b0000_0101],
            address: Pubkey::new_unique(),
            signature: Signature::from([1u8; 64]),
        };
        assert!(req.validate_basic().is_ok());

        let mut bad = req.clone();
        bad.vote_type = VoteType::Proposal;
        assert!(bad.validate_basic().is_err());

        let mut bad = req;
        bad.bitmap.clear();
        assert!(bad.validate_basic().is_err());
    }

    #[test]
    fn test_fetch_rsp_vote_must_match_header() {
        let vote = filled_vote(VoteType::Prevote);
        let rsp = FetchVotesRsp {
            vote_type: VoteType::Precommit,
            height: vote.height,
            round: vote.round,
            missing_votes: vec![vote],
            address: Pubkey::new_unique(),
            signature: Signature::from([2u8; 64]),
        };
        assert!(rsp.validate_basic().is_err());
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = ConsensusMessage::Vote(filled_vote(VoteType::Precommit));
        let bytes = msg.serialize().unwrap();
        let decoded = ConsensusMessage::deserialize(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(
            ConsensusMessage::Vote(filled_vote(VoteType::Prevote)).kind(),
            "prevote"
        );
        assert_eq!(
            ConsensusMessage::Vote(filled_vote(VoteType::Proposal)).kind(),
            "proposal"
        );
    }

    #[test]
    fn test_nil_data_is_all_zeros() {
        assert_eq!(NIL_DATA, Hash::new_from_array([0u8; 32]));
        assert_eq!(NIL_DATA, Hash::default());
    }
}
