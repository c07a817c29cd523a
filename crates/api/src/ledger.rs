//! Read access to the UTXO set.

use stoa_types::app::{Hash, UtxoValue};

/// A capability to look up unspent outputs by key. The consensus core only
/// ever reads the UTXO set; ownership of the storage stays with the ledger.
pub trait UtxoFinder {
    /// Returns the unspent output stored under `key`, if any.
    fn find_utxo(&self, key: &Hash) -> Option<UtxoValue>;
}

impl<F> UtxoFinder for F
where
    F: Fn(&Hash) -> Option<UtxoValue>,
{
    fn find_utxo(&self, key: &Hash) -> Option<UtxoValue> {
        self(key)
    }
}
