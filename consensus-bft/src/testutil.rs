//! Shared helpers for in-crate tests: a scriptable committee, a
//! keypair-backed signer, and message factories.

use {
    crate::{
        committee::{Committee, PeerId, PrivateValidator, Validators},
        message::{
            AppState, Commit, ConsensusMessage, ProposedData, Signable, Vote, VoteType, NIL_DATA,
        },
    },
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    solana_signer::Signer,
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        thread,
        time::{Duration, Instant},
    },
};

/// Keypair-backed [`PrivateValidator`].
pub(crate) struct TestSigner {
    keypair: Keypair,
}

impl TestSigner {
    pub(crate) fn from_keypair(keypair: Keypair) -> Self {
        Self { keypair }
    }
}

impl PrivateValidator for TestSigner {
    fn pub_key(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    fn sign(&self, digest: &Hash) -> Signature {
        self.keypair.sign_message(digest.as_ref())
    }

    fn verify(&self, signer: &Pubkey, digest: &Hash, signature: &Signature) -> bool {
        signature.verify(signer.as_ref(), digest.as_ref())
    }
}

/// Scriptable [`Committee`] with a fixed equal-power roster that records
/// all outbound traffic and committed records.
pub(crate) struct TestCommittee {
    members: Vec<Pubkey>,
    app: Mutex<AppState>,
    /// When set, this member index proposes every round; otherwise the
    /// proposer rotates round-robin.
    proposer_index: Mutex<Option<usize>>,
    /// What `decides_proposal` offers when this node proposes.
    candidate: Mutex<ProposedData>,
    /// Values `validate_proposal` refuses.
    invalid: Mutex<Vec<ProposedData>>,
    pub(crate) broadcasts: Mutex<Vec<ConsensusMessage>>,
    pub(crate) sent: Mutex<Vec<(ConsensusMessage, Option<PeerId>)>>,
    pub(crate) commits: Mutex<Vec<Commit>>,
    history: Mutex<HashMap<u64, Commit>>,
}

impl TestCommittee {
    pub(crate) fn new(members: Vec<Pubkey>) -> Self {
        Self {
            members,
            app: Mutex::new(AppState {
                last_height: 0,
                last_proposed_data: NIL_DATA,
            }),
            proposer_index: Mutex::new(None),
            candidate: Mutex::new(Hash::new_unique()),
            invalid: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Pin the proposer to one member for every round.
    pub(crate) fn set_proposer(&self, index: usize) {
        *self.proposer_index.lock().unwrap() = Some(index);
    }

    pub(crate) fn set_candidate(&self, data: ProposedData) {
        *self.candidate.lock().unwrap() = data;
    }

    pub(crate) fn mark_invalid(&self, data: ProposedData) {
        self.invalid.lock().unwrap().push(data);
    }

    /// All broadcast votes so far.
    pub(crate) fn broadcast_votes(&self) -> Vec<Vote> {
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .filter_map(|msg| match msg {
                ConsensusMessage::Vote(vote) => Some(vote.clone()),
                _ => None,
            })
            .collect()
    }

    /// Whether some broadcast vote matches the predicate.
    pub(crate) fn broadcasted(&self, predicate: impl Fn(&Vote) -> bool) -> bool {
        self.broadcast_votes().iter().any(|v| predicate(v))
    }
}

impl Committee for TestCommittee {
    fn app_state(&self) -> AppState {
        *self.app.lock().unwrap()
    }

    fn is_validator(&self, key: &Pubkey) -> bool {
        self.members.contains(key)
    }

    fn voting_power(&self, key: &Pubkey) -> u64 {
        u64::from(self.members.contains(key))
    }

    fn total_voting_power(&self) -> u64 {
        self.members.len() as u64
    }

    fn validators(&self) -> Vec<Pubkey> {
        self.members.clone()
    }

    fn current_proposer(&self, round: u32) -> Pubkey {
        let index = self
            .proposer_index
            .lock()
            .unwrap()
            .unwrap_or(round as usize % self.members.len());
        self.members[index]
    }

    fn decides_proposal(&self) -> ProposedData {
        *self.candidate.lock().unwrap()
    }

    fn validate_proposal(&self, data: ProposedData) -> bool {
        !self.invalid.lock().unwrap().contains(&data)
    }

    fn commit_history(&self, height: u64) -> Option<Commit> {
        self.history.lock().unwrap().get(&height).cloned()
    }

    fn send(&self, msg: ConsensusMessage, peer: Option<PeerId>) {
        self.sent.lock().unwrap().push((msg, peer));
    }

    fn broadcast(&self, msg: ConsensusMessage) {
        self.broadcasts.lock().unwrap().push(msg);
    }

    fn commit(&self, records: &Commit) -> Result<(), String> {
        self.commits.lock().unwrap().push(records.clone());
        self.history
            .lock()
            .unwrap()
            .insert(records.height, records.clone());
        *self.app.lock().unwrap() = AppState {
            last_height: records.height,
            last_proposed_data: records.proposed_data,
        };
        Ok(())
    }
}

/// A roster of keypairs with the matching committee and validators
/// handle. Index 0 is the local node's identity.
pub(crate) struct TestNet {
    pub(crate) keypairs: Vec<Keypair>,
    pub(crate) committee: Arc<TestCommittee>,
    pub(crate) validators: Arc<Validators>,
}

impl TestNet {
    pub(crate) fn new(members: usize) -> Self {
        let keypairs: Vec<Keypair> = (0..members).map(|_| Keypair::new()).collect();
        let roster: Vec<Pubkey> = keypairs.iter().map(|k| k.pubkey()).collect();
        let committee = Arc::new(TestCommittee::new(roster));
        let signer = Arc::new(TestSigner::from_keypair(keypairs[0].insecure_clone()));
        let validators = Arc::new(Validators::new(committee.clone(), signer));
        Self {
            keypairs,
            committee,
            validators,
        }
    }
}

/// Build a vote and sign it with `keypair`.
pub(crate) fn signed_vote(
    keypair: &Keypair,
    vote_type: VoteType,
    height: u64,
    round: u32,
    proposed: ProposedData,
    prev: ProposedData,
) -> Vote {
    let mut vote = Vote::new(vote_type, height, round, proposed, prev);
    vote.set_signer(keypair.pubkey());
    let digest = vote.signing_digest();
    vote.set_signature(keypair.sign_message(digest.as_ref()));
    vote
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub(crate) fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}
