mod block;
mod committee;
mod header;

pub use block::{Block, Transaction, EMPTY_ROOT_HASH, EMPTY_UNCLE_HASH};
pub use committee::{Committee, CommitteeError, CommitteeMember};
pub use header::{Header, HeaderError, BFT_DIGEST};
