//! Vote accumulation for a single `(height, round, type)`.
//!
//! A [`VoteSet`] records at most one vote per committee member, tallies
//! voting power per proposed value, and answers the +2/3 queries the
//! driver's transitions are gated on. A second vote from the same signer
//! for a different value is refused but retained as double-sign evidence.

use {
    crate::{
        committee::Validators,
        error::{ConsensusError, Result},
        message::{
            Commit, FetchVotesReq, FetchVotesRsp, ProposedData, Vote, VoteType, NIL_DATA,
        },
    },
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::{collections::HashMap, fmt, sync::Arc},
};

/// Two votes from the same signer for different values at one
/// `(height, round, type)`. Kept for accountability; hosts may submit it
/// for slashing.
#[derive(Debug, Clone)]
pub struct ConflictEvidence {
    /// The vote that was counted.
    pub first: Vote,
    /// The conflicting vote that was refused.
    pub second: Vote,
}

/// Accumulates votes of one `(height, round, type)`.
#[derive(Debug, Clone)]
pub struct VoteSet {
    height: u64,
    round: u32,
    vote_type: VoteType,
    /// The chain prefix every admitted vote must bind to.
    prev: ProposedData,
    validators: Arc<Validators>,
    /// One counted vote per signer.
    votes: HashMap<Pubkey, Vote>,
    /// Tallied voting power per proposed value.
    tallies: HashMap<ProposedData, u64>,
    /// Total power of all counted votes.
    voted_power: u64,
    /// The first value to cross +2/3, if any.
    maj23: Option<ProposedData>,
    /// Retained double-sign evidence.
    evidence: Vec<ConflictEvidence>,
}

impl VoteSet {
    pub fn new(
        height: u64,
        round: u32,
        vote_type: VoteType,
        prev: ProposedData,
        validators: Arc<Validators>,
    ) -> Self {
        Self {
            height,
            round,
            vote_type,
            prev,
            validators,
            votes: HashMap::new(),
            tallies: HashMap::new(),
            voted_power: 0,
            maj23: None,
            evidence: Vec::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// Admit a vote.
    ///
    /// Returns `Ok(true)` when the vote was counted, `Ok(false)` for an
    /// exact duplicate, and an error otherwise. A conflicting vote from a
    /// known signer returns [`ConsensusError::ConflictingVotes`] after the
    /// evidence has been retained.
    pub fn add_vote(&mut self, vote: &Vote) -> Result<bool> {
        if vote.vote_type != self.vote_type
            || vote.height != self.height
            || vote.round != self.round
        {
            return Err(ConsensusError::VoteSetMismatch);
        }
        if vote.prev != self.prev {
            return Err(ConsensusError::InvalidVoteBase {
                got: vote.prev,
                want: self.prev,
            });
        }

        let committee = self.validators.committee();
        let power = committee.voting_power(&vote.address);
        if !committee.is_validator(&vote.address) || power == 0 {
            return Err(ConsensusError::NotValidator(vote.address));
        }
        if !self.validators.verify(vote) {
            return Err(ConsensusError::InvalidSignature(vote.address));
        }

        if let Some(existing) = self.votes.get(&vote.address) {
            if existing.proposed == vote.proposed {
                return Ok(false);
            }
            self.evidence.push(ConflictEvidence {
                first: existing.clone(),
                second: vote.clone(),
            });
            return Err(ConsensusError::ConflictingVotes(vote.address));
        }

        let total = self.total_power();
        let tally = self.tallies.entry(vote.proposed).or_default();
        *tally += power;
        let tally = *tally;
        self.voted_power += power;
        if self.maj23.is_none() && tally * 3 > total * 2 {
            self.maj23 = Some(vote.proposed);
        }
        self.votes.insert(vote.address, vote.clone());
        Ok(true)
    }

    // -- Tally queries --

    /// Total committee power, counted and uncounted.
    pub fn total_power(&self) -> u64 {
        self.validators.committee().total_voting_power()
    }

    /// Power of all counted votes.
    pub fn voted_power(&self) -> u64 {
        self.voted_power
    }

    /// Tallied power behind one value.
    pub fn power_of(&self, data: &ProposedData) -> u64 {
        self.tallies.get(data).copied().unwrap_or(0)
    }

    /// Number of counted votes.
    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    /// The counted vote of one signer.
    pub fn vote_of(&self, key: &Pubkey) -> Option<&Vote> {
        self.votes.get(key)
    }

    /// Whether some value (possibly nil) holds more than 2/3 of the
    /// total power.
    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// The unique value holding a +2/3 majority, possibly `NIL_DATA`.
    pub fn two_thirds_majority(&self) -> Option<ProposedData> {
        self.maj23
    }

    /// Whether counted votes, regardless of value, exceed 2/3 of the
    /// total power.
    pub fn has_two_thirds_any(&self) -> bool {
        self.voted_power * 3 > self.total_power() * 2
    }

    /// Whether every member has voted.
    pub fn has_all(&self) -> bool {
        self.voted_power == self.total_power()
    }

    /// Retained double-sign evidence.
    pub fn evidence(&self) -> &[ConflictEvidence] {
        &self.evidence
    }

    /// Whether any evidence names `key`.
    pub fn has_evidence_against(&self, key: &Pubkey) -> bool {
        self.evidence.iter().any(|e| e.second.address == *key)
    }

    // -- Derived messages --

    /// Build the commit record proved by this set. Legal only for a
    /// precommit set with a +2/3 majority for a non-nil value.
    pub fn make_commit(&self) -> Result<Commit> {
        debug_assert_eq!(self.vote_type, VoteType::Precommit);
        let Some(data) = self.maj23 else {
            return Err(ConsensusError::CommitWithoutMajority);
        };
        if data == NIL_DATA {
            return Err(ConsensusError::CommitOnNil);
        }
        let mut precommits: Vec<Vote> = self
            .votes
            .values()
            .filter(|v| v.proposed == data)
            .cloned()
            .collect();
        precommits.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(Commit {
            height: self.height,
            round: self.round,
            proposed_data: data,
            precommits,
            commit_time: 0,
            address: Pubkey::default(),
            signature: Signature::default(),
        })
    }

    /// Build an unsigned request advertising which members' votes we
    /// already hold.
    pub fn make_fetch_votes_req(&self) -> FetchVotesReq {
        let roster = self.validators.committee().validators();
        let mut bitmap = vec![0u8; roster.len().div_ceil(8)];
        for (i, key) in roster.iter().enumerate() {
            if self.votes.contains_key(key) {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        FetchVotesReq {
            vote_type: self.vote_type,
            height: self.height,
            round: self.round,
            bitmap,
            address: Pubkey::default(),
            signature: Signature::default(),
        }
    }

    /// Build an unsigned response carrying the votes we hold that the
    /// requester's bitmap lacked, or `None` if we have nothing to offer.
    pub fn make_fetch_votes_rsp(&self, req: &FetchVotesReq) -> Option<FetchVotesRsp> {
        let roster = self.validators.committee().validators();
        let mut missing: Vec<Vote> = Vec::new();
        for (i, key) in roster.iter().enumerate() {
            let requester_has = req
                .bitmap
                .get(i / 8)
                .is_some_and(|byte| byte & (1 << (i % 8)) != 0);
            if requester_has {
                continue;
            }
            if let Some(vote) = self.votes.get(key) {
                missing.push(vote.clone());
            }
        }
        if missing.is_empty() {
            return None;
        }
        missing.sort_by(|a, b| a.address.cmp(&b.address));
        Some(FetchVotesRsp {
            vote_type: self.vote_type,
            height: self.height,
            round: self.round,
            missing_votes: missing,
            address: Pubkey::default(),
            signature: Signature::default(),
        })
    }
}

impl fmt::Display for VoteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VoteSet{{{} {}/{}: {} votes, power {}/{}, maj23 {:?}}}",
            self.vote_type,
            self.height,
            self.round,
            self.votes.len(),
            self.voted_power,
            self.total_power(),
            self.maj23,
        )
    }
}

// -- Tests --

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::{signed_vote, TestNet},
        solana_hash::Hash,
        solana_signer::Signer,
    };

    fn prevote_set(net: &TestNet) -> VoteSet {
        VoteSet::new(1, 0, VoteType::Prevote, NIL_DATA, net.validators.clone())
    }

    fn precommit_set(net: &TestNet) -> VoteSet {
        VoteSet::new(1, 0, VoteType::Precommit, NIL_DATA, net.validators.clone())
    }

    #[test]
    fn test_add_vote_counts_power() {
        let net = TestNet::new(4);
        let mut set = prevote_set(&net);
        let data = Hash::new_unique();

        let vote = signed_vote(&net.keypairs[1], VoteType::Prevote, 1, 0, data, NIL_DATA);
        assert!(set.add_vote(&vote).unwrap());
        assert_eq!(set.vote_count(), 1);
        assert_eq!(set.voted_power(), 1);
        assert_eq!(set.power_of(&data), 1);
        assert!(!set.has_two_thirds_any());
    }

    #[test]
    fn test_duplicate_vote_not_counted_twice() {
        let net = TestNet::new(4);
        let mut set = prevote_set(&net);
        let data = Hash::new_unique();

        let vote = signed_vote(&net.keypairs[1], VoteType::Prevote, 1, 0, data, NIL_DATA);
        assert!(set.add_vote(&vote).unwrap());
        assert!(!set.add_vote(&vote).unwrap());
        assert_eq!(set.voted_power(), 1);
        assert_eq!(set.power_of(&data), 1);
    }

    #[test]
    fn test_conflicting_vote_kept_as_evidence() {
        let net = TestNet::new(4);
        let mut set = precommit_set(&net);
        let offender = &net.keypairs[2];

        let first = signed_vote(offender, VoteType::Precommit, 1, 0, Hash::new_unique(), NIL_DATA);
        let second =
            signed_vote(offender, VoteType::Precommit, 1, 0, Hash::new_unique(), NIL_DATA);
        assert!(set.add_vote(&first).unwrap());
        assert!(matches!(
            set.add_vote(&second),
            Err(ConsensusError::ConflictingVotes(k)) if k == offender.pubkey()
        ));

        // the first vote stays counted, the second is evidence only
        assert_eq!(set.voted_power(), 1);
        assert_eq!(set.evidence().len(), 1);
        assert!(set.has_evidence_against(&offender.pubkey()));
        assert_eq!(set.evidence()[0].first.proposed, first.proposed);
        assert_eq!(set.evidence()[0].second.proposed, second.proposed);
    }

    #[test]
    fn test_majority_at_three_of_four() {
        let net = TestNet::new(4);
        let mut set = prevote_set(&net);
        let data = Hash::new_unique();

        for keypair in net.keypairs.iter().take(2) {
            let vote = signed_vote(keypair, VoteType::Prevote, 1, 0, data, NIL_DATA);
            set.add_vote(&vote).unwrap();
        }
        assert!(!set.has_two_thirds_majority());
        assert!(!set.has_two_thirds_any());

        let vote = signed_vote(&net.keypairs[2], VoteType::Prevote, 1, 0, data, NIL_DATA);
        set.add_vote(&vote).unwrap();
        assert!(set.has_two_thirds_majority());
        assert!(set.has_two_thirds_any());
        assert_eq!(set.two_thirds_majority(), Some(data));
        assert!(!set.has_all());
    }

    #[test]
    fn test_split_votes_reach_any_but_no_majority() {
        let net = TestNet::new(4);
        let mut set = prevote_set(&net);

        for (i, keypair) in net.keypairs.iter().take(3).enumerate() {
            let data = Hash::new_from_array([i as u8 + 1; 32]);
            let vote = signed_vote(keypair, VoteType::Prevote, 1, 0, data, NIL_DATA);
            set.add_vote(&vote).unwrap();
        }
        assert!(set.has_two_thirds_any());
        assert!(!set.has_two_thirds_majority());
        assert_eq!(set.two_thirds_majority(), None);
    }

    #[test]
    fn test_nil_majority_is_reported() {
        let net = TestNet::new(4);
        let mut set = prevote_set(&net);
        for keypair in net.keypairs.iter().take(3) {
            let vote = signed_vote(keypair, VoteType::Prevote, 1, 0, NIL_DATA, NIL_DATA);
            set.add_vote(&vote).unwrap();
        }
        assert_eq!(set.two_thirds_majority(), Some(NIL_DATA));
    }

    #[test]
    fn test_has_all() {
        let net = TestNet::new(4);
        let mut set = precommit_set(&net);
        let data = Hash::new_unique();
        for keypair in &net.keypairs {
            let vote = signed_vote(keypair, VoteType::Precommit, 1, 0, data, NIL_DATA);
            set.add_vote(&vote).unwrap();
        }
        assert!(set.has_all());
    }

    #[test]
    fn test_rejects_unknown_signer() {
        let net = TestNet::new(4);
        let mut set = prevote_set(&net);
        let outsider = solana_keypair::Keypair::new();
        let vote = signed_vote(&outsider, VoteType::Prevote, 1, 0, Hash::new_unique(), NIL_DATA);
        assert!(matches!(
            set.add_vote(&vote),
            Err(ConsensusError::NotValidator(_))
        ));
    }

    #[test]
    fn test_rejects_bad_signature() {
        let net = TestNet::new(4);
        let mut set = prevote_set(&net);
        let mut vote =
            signed_vote(&net.keypairs[1], VoteType::Prevote, 1, 0, Hash::new_unique(), NIL_DATA);
        vote.proposed = Hash::new_unique(); // invalidates the signature
        assert!(matches!(
            set.add_vote(&vote),
            Err(ConsensusError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_rejects_mismatched_votes() {
        let net = TestNet::new(4);
        let mut set = prevote_set(&net);

        let wrong_round =
            signed_vote(&net.keypairs[1], VoteType::Prevote, 1, 2, Hash::new_unique(), NIL_DATA);
        assert!(matches!(
            set.add_vote(&wrong_round),
            Err(ConsensusError::VoteSetMismatch)
        ));

        let wrong_type =
            signed_vote(&net.keypairs[1], VoteType::Precommit, 1, 0, Hash::new_unique(), NIL_DATA);
        assert!(matches!(
            set.add_vote(&wrong_type),
            Err(ConsensusError::VoteSetMismatch)
        ));
    }

    #[test]
    fn test_rejects_wrong_base() {
        let net = TestNet::new(4);
        let mut set = prevote_set(&net);
        let vote = signed_vote(
            &net.keypairs[1],
            VoteType::Prevote,
            1,
            0,
            Hash::new_unique(),
            Hash::new_unique(),
        );
        assert!(matches!(
            set.add_vote(&vote),
            Err(ConsensusError::InvalidVoteBase { .. })
        ));
    }

    #[test]
    fn test_make_commit_requires_non_nil_majority() {
        let net = TestNet::new(4);
        let mut set = precommit_set(&net);
        assert!(matches!(
            set.make_commit(),
            Err(ConsensusError::CommitWithoutMajority)
        ));

        for keypair in net.keypairs.iter().take(3) {
            let vote = signed_vote(keypair, VoteType::Precommit, 1, 0, NIL_DATA, NIL_DATA);
            set.add_vote(&vote).unwrap();
        }
        assert!(matches!(set.make_commit(), Err(ConsensusError::CommitOnNil)));
    }

    #[test]
    fn test_make_commit_roundtrips_through_fresh_set() {
        let net = TestNet::new(4);
        let mut set = precommit_set(&net);
        let data = Hash::new_unique();
        for keypair in net.keypairs.iter().take(3) {
            let vote = signed_vote(keypair, VoteType::Precommit, 1, 0, data, NIL_DATA);
            set.add_vote(&vote).unwrap();
        }

        let commit = set.make_commit().unwrap();
        assert_eq!(commit.proposed_data, data);
        assert_eq!(commit.precommits.len(), 3);

        // replaying the commit's precommits reproduces the majority
        let mut rebuilt = precommit_set(&net);
        for vote in &commit.precommits {
            rebuilt.add_vote(vote).unwrap();
        }
        assert_eq!(rebuilt.two_thirds_majority(), Some(data));
    }

    #[test]
    fn test_fetch_roundtrip_preserves_votes() {
        let net = TestNet::new(4);
        let data = Hash::new_unique();

        // requester holds votes 0..2, responder holds all four
        let mut requester = prevote_set(&net);
        let mut responder = prevote_set(&net);
        for (i, keypair) in net.keypairs.iter().enumerate() {
            let vote = signed_vote(keypair, VoteType::Prevote, 1, 0, data, NIL_DATA);
            if i < 2 {
                requester.add_vote(&vote).unwrap();
            }
            responder.add_vote(&vote).unwrap();
        }

        let req = requester.make_fetch_votes_req();
        let rsp = responder.make_fetch_votes_rsp(&req).unwrap();
        assert_eq!(rsp.missing_votes.len(), 2);
        for vote in &rsp.missing_votes {
            assert!(requester.add_vote(vote).unwrap());
        }
        assert!(requester.has_all());
    }

    #[test]
    fn test_fetch_rsp_empty_when_nothing_to_offer() {
        let net = TestNet::new(4);
        let data = Hash::new_unique();
        let mut requester = prevote_set(&net);
        let responder = prevote_set(&net);
        let vote = signed_vote(&net.keypairs[0], VoteType::Prevote, 1, 0, data, NIL_DATA);
        requester.add_vote(&vote).unwrap();

        let req = requester.make_fetch_votes_req();
        assert!(responder.make_fetch_votes_rsp(&req).is_none());
    }

    #[test]
    fn test_tallies_match_distinct_signers() {
        let net = TestNet::new(4);
        let mut set = prevote_set(&net);
        let x = Hash::new_unique();
        let y = Hash::new_unique();

        let votes = [
            signed_vote(&net.keypairs[0], VoteType::Prevote, 1, 0, x, NIL_DATA),
            signed_vote(&net.keypairs[1], VoteType::Prevote, 1, 0, x, NIL_DATA),
            signed_vote(&net.keypairs[2], VoteType::Prevote, 1, 0, y, NIL_DATA),
        ];
        for vote in &votes {
            set.add_vote(vote).unwrap();
        }
        // duplicate and conflicting submissions must not skew tallies
        let _ = set.add_vote(&votes[0]);
        let conflicting = signed_vote(&net.keypairs[1], VoteType::Prevote, 1, 0, y, NIL_DATA);
        let _ = set.add_vote(&conflicting);

        assert_eq!(set.power_of(&x), 2);
        assert_eq!(set.power_of(&y), 1);
        assert_eq!(set.voted_power(), set.power_of(&x) + set.power_of(&y));
    }
}
