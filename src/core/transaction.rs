//! Transactions are rust-bitcoin's; the topology keys them by [`Hash256`].

use crate::crypto::hash::Hash256;

pub use bitcoin::{OutPoint, Transaction, TxIn, TxOut};

pub trait TransactionExt {
    /// Txid as a topology table key.
    fn txid_key(&self) -> Hash256;

    /// Consensus encoding, in segwit form when any input carries a witness.
    fn to_raw(&self) -> Vec<u8>;
}

impl TransactionExt for Transaction {
    fn txid_key(&self) -> Hash256 {
        Hash256::from(self.txid())
    }

    fn to_raw(&self) -> Vec<u8> {
        bitcoin::consensus::encode::serialize(self)
    }
}

/// One-input, one-output transaction spending `outpoint`.
#[cfg(test)]
pub(crate) fn sample_spend(outpoint: OutPoint, value: u64) -> Transaction {
    use bitcoin::{absolute, transaction, Amount, ScriptBuf, Sequence, Witness};

    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::from_bytes(vec![0x51]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from_bytes(vec![0x00, 0x14]),
        }],
    }
}

#[cfg(test)]
pub(crate) fn sample_outpoint(tag: u8, vout: u32) -> OutPoint {
    use bitcoin::hashes::Hash;

    OutPoint::new(bitcoin::Txid::from_byte_array([tag; 32]), vout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::consensus::encode::deserialize;

    #[test]
    fn test_txid_key_matches_txid() {
        let tx = sample_spend(sample_outpoint(1, 0), 50_000);
        assert_eq!(tx.txid_key(), Hash256::from(tx.txid()));
        assert_eq!(tx.txid_key().to_string(), tx.txid().to_string());
    }

    #[test]
    fn test_witness_changes_raw_but_not_txid() {
        let plain = sample_spend(sample_outpoint(2, 1), 10_000);
        let mut witnessed = plain.clone();
        witnessed.input[0].witness.push([0xAA; 72]);
        witnessed.input[0].witness.push([0x02; 33]);

        assert_eq!(plain.txid_key(), witnessed.txid_key());
        assert_ne!(plain.to_raw(), witnessed.to_raw());
        // segwit marker and flag follow the version
        assert_eq!(&witnessed.to_raw()[4..6], &[0x00, 0x01]);

        let decoded: Transaction = deserialize(&witnessed.to_raw()).unwrap();
        assert_eq!(decoded, witnessed);
    }
}
