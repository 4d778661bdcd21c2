//! Chain data types shared with the backend

pub mod block;
pub mod transaction;

pub use block::{BlockHeader, HeaderInfo};
pub use transaction::{OutPoint, Transaction, TransactionExt, TxIn, TxOut};
