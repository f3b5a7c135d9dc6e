use tessera_primitives::Address;

/// Outcome taxonomy of message processing.
///
/// Everything except [`ConsensusError::Backend`] is recoverable and handled
/// inside the event loop: future messages are buffered, old ones dropped,
/// invalid ones dropped with the sender noted. A backend fault halts the
/// current height.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("old height message")]
    OldHeight,
    #[error("old round message")]
    OldRound,
    #[error("future height message")]
    FutureHeight,
    #[error("future round message")]
    FutureRound,
    #[error("future step message")]
    FutureStep,
    #[error(transparent)]
    Invalid(#[from] InvalidMessage),
    #[error("backend fault: {0}")]
    Backend(String),
}

/// Rejection reasons that mark the sender for misbehavior tracking.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidMessage {
    #[error("malformed message payload")]
    Malformed,
    #[error("sender {0} is not a committee member")]
    UnknownSender(Address),
    #[error("signature does not recover to sender")]
    BadSignature,
    #[error("proposal from {0} who is not the round proposer")]
    NotFromProposer(Address),
    #[error("committed seal does not recover to sender")]
    BadCommittedSeal,
    #[error("block verification failed: {0}")]
    InvalidBlock(String),
}
