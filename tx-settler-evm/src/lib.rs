//! alloy backed [`LedgerConnector`](tx_settler::ledger::LedgerConnector),
//! [`LedgerRpc`](tx_settler::ledger::LedgerRpc) and
//! [`LedgerWallet`](tx_settler::ledger::LedgerWallet)

pub mod error;
pub mod rpc;
pub mod wallet;
