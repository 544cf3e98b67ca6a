//! Ogmios backed [`ChainQuery`](tx_settler::chain_query::ChainQuery) and
//! [`Submitter`](tx_settler::submitter::Submitter)

pub mod api;
pub mod client;
pub mod error;
