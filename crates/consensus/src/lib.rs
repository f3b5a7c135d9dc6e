pub mod backend;
mod backlog;
mod config;
mod core;
mod engine;
mod error;
mod message;
mod messages;
mod timeout;

pub use config::Config;
pub use engine::ConsensusEngine;
pub use error::{ConsensusError, InvalidMessage};
pub use message::{commit_seal_input, Message, MsgCode, Proposal, Step, Vote};
pub use messages::{AddVote, MessagesMap, RoundMessages, VoteSet};
pub use timeout::TimeoutEvent;

/// Future-height messages further ahead than this are treated as misbehavior
/// and dropped instead of buffered.
pub(crate) const MAX_FUTURE_HEIGHT: u64 = 10;

/// Upper bound of buffered future-height messages across all heights.
pub(crate) const MAX_UNCHECKED_BACKLOG: usize = 1024;

/// Capacity of the stop channel. Repeated `stop` calls beyond the first are
/// absorbed without blocking.
pub(crate) const STOP_CHANNEL_CAPACITY: usize = 3;
