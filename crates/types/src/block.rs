use std::sync::OnceLock;

use alloy_rlp::{Decodable, Encodable, RlpDecodableWrapper, RlpEncodableWrapper};
use tessera_primitives::{b256, Bytes, B256};

use crate::{Header, HeaderError};

/// Root hash of an empty trie.
pub const EMPTY_ROOT_HASH: B256 =
    b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

/// Hash of an empty uncle list.
pub const EMPTY_UNCLE_HASH: B256 =
    b256!("1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347");

/// An opaque transaction payload. Execution happens outside the engine.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct Transaction(pub Bytes);

/// A block: header plus body. The hash and RLP size are computed lazily and
/// memoized; once stored they never change, so blocks are immutable.
#[derive(Debug, Default)]
pub struct Block {
    header: Header,
    transactions: Vec<Transaction>,
    uncles: Vec<Header>,

    hash: OnceLock<B256>,
    size: OnceLock<usize>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Transaction>, uncles: Vec<Header>) -> Self {
        Self {
            header,
            transactions,
            uncles,
            hash: OnceLock::new(),
            size: OnceLock::new(),
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn uncles(&self) -> &[Header] {
        &self.uncles
    }

    pub fn number(&self) -> u64 {
        self.header.number_u64()
    }

    /// The header hash, computed on the first call and cached thereafter.
    pub fn hash(&self) -> B256 {
        *self.hash.get_or_init(|| self.header.hash())
    }

    /// The RLP-encoded size, computed on the first call and cached thereafter.
    pub fn rlp_size(&self) -> usize {
        *self.size.get_or_init(|| self.length())
    }

    pub fn sanity_check(&self) -> Result<(), HeaderError> {
        self.header.sanity_check()
    }

    /// True when there is no body content to complete the header with.
    pub fn empty_body(&self) -> bool {
        self.header.tx_root == EMPTY_ROOT_HASH && self.header.uncle_hash == EMPTY_UNCLE_HASH
    }

    /// A new block carrying this block's body under the sealed header.
    pub fn with_seal(&self, header: Header) -> Block {
        Block::new(header, self.transactions.clone(), self.uncles.clone())
    }

    /// A new block with this block's header over the given body.
    pub fn with_body(&self, transactions: Vec<Transaction>, uncles: Vec<Header>) -> Block {
        Block::new(self.header.clone(), transactions, uncles)
    }
}

impl Clone for Block {
    fn clone(&self) -> Self {
        Block::new(
            self.header.clone(),
            self.transactions.clone(),
            self.uncles.clone(),
        )
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
            && self.transactions == other.transactions
            && self.uncles == other.uncles
    }
}

impl Eq for Block {}

impl Encodable for Block {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let payload_length =
            self.header.length() + self.transactions.length() + self.uncles.length();
        alloy_rlp::Header {
            list: true,
            payload_length,
        }
        .encode(out);
        self.header.encode(out);
        self.transactions.encode(out);
        self.uncles.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length =
            self.header.length() + self.transactions.length() + self.uncles.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Block {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let rlp_header = alloy_rlp::Header::decode(buf)?;
        if !rlp_header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let started_len = buf.len();

        let header = Header::decode(buf)?;
        let transactions = Vec::<Transaction>::decode(buf)?;
        let uncles = Vec::<Header>::decode(buf)?;

        let consumed = started_len - buf.len();
        if consumed != rlp_header.payload_length {
            return Err(alloy_rlp::Error::ListLengthMismatch {
                expected: rlp_header.payload_length,
                got: consumed,
            });
        }

        Ok(Block::new(header, transactions, uncles))
    }
}
