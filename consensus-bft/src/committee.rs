//! Host capability interfaces.
//!
//! The core does not elect proposers, produce proposals, persist commits,
//! or talk to peers; the host supplies all of that through [`Committee`].
//! Key custody lives behind [`PrivateValidator`]. The [`Validators`]
//! wrapper bundles the two and is threaded through the vote accounting so
//! every vote set can check membership, weigh power, and verify
//! signatures.

use {
    crate::message::{AppState, Commit, ConsensusMessage, ProposedData, Signable},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::{fmt, sync::Arc},
};

/// Opaque peer handle. The host assigns its meaning; the core only hands
/// it back when replying to a fetch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// The application and peer-layer glue supplied by the host.
///
/// Calls may be slow but are treated as synchronous and effectively
/// atomic from the state machine's point of view.
pub trait Committee: Send + Sync {
    /// Latest committed application state.
    fn app_state(&self) -> AppState;

    /// Whether `key` belongs to the committee at the current height.
    fn is_validator(&self, key: &Pubkey) -> bool;

    /// Voting power of `key`; 0 for non-members.
    fn voting_power(&self, key: &Pubkey) -> u64;

    /// Sum of all members' voting power.
    fn total_voting_power(&self) -> u64;

    /// The roster in canonical order. Fetch bitmaps index into it.
    fn validators(&self) -> Vec<Pubkey>;

    /// Deterministic proposer for `round` at the current height.
    fn current_proposer(&self, round: u32) -> Pubkey;

    /// Candidate value to propose when this node is the proposer.
    fn decides_proposal(&self) -> ProposedData;

    /// Application-level validity of a proposed value.
    fn validate_proposal(&self, data: ProposedData) -> bool;

    /// The commit record that closed `height`, for serving fetch
    /// requests from lagging peers.
    fn commit_history(&self, height: u64) -> Option<Commit>;

    /// Unicast. `None` lets the host pick a neighbour.
    fn send(&self, msg: ConsensusMessage, peer: Option<PeerId>);

    /// Fan-out to all peers.
    fn broadcast(&self, msg: ConsensusMessage);

    /// Deliver a proven commit to the application.
    fn commit(&self, records: &Commit) -> Result<(), String>;
}

/// Key custody for this node's validator identity.
pub trait PrivateValidator: Send + Sync {
    /// This node's identity.
    fn pub_key(&self) -> Pubkey;

    /// Sign a message digest.
    fn sign(&self, digest: &Hash) -> Signature;

    /// Verify any validator's signature over a digest.
    fn verify(&self, signer: &Pubkey, digest: &Hash, signature: &Signature) -> bool;
}

/// Committee plus signing identity, as one handle.
#[derive(Clone)]
pub struct Validators {
    committee: Arc<dyn Committee>,
    signer: Arc<dyn PrivateValidator>,
}

impl Validators {
    pub fn new(committee: Arc<dyn Committee>, signer: Arc<dyn PrivateValidator>) -> Self {
        Self { committee, signer }
    }

    /// The host-supplied committee.
    pub fn committee(&self) -> &dyn Committee {
        self.committee.as_ref()
    }

    /// This node's identity.
    pub fn self_pub_key(&self) -> Pubkey {
        self.signer.pub_key()
    }

    /// Sign a message in place: assign our identity, then sign the
    /// resulting digest.
    pub fn sign<M: Signable>(&self, msg: &mut M) {
        msg.set_signer(self.signer.pub_key());
        let digest = msg.signing_digest();
        msg.set_signature(self.signer.sign(&digest));
    }

    /// Verify a message's signature against its claimed signer.
    pub fn verify<M: Signable>(&self, msg: &M) -> bool {
        self.signer
            .verify(msg.signer(), &msg.signing_digest(), msg.signature())
    }
}

impl fmt::Debug for Validators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validators")
            .field("self_pub_key", &self.self_pub_key())
            .finish()
    }
}
