//! Blocks, headers, and Merkle-root computation.

use super::{hash_canonical, BitField, Enrollment, Hash, HashDomain, Signature, Transaction};
use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// The header of a block.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the previous block's header; [`Hash::ZERO`] for genesis.
    pub prev_block: Hash,
    /// Height of this block; genesis is height 0.
    pub height: u64,
    /// Merkle root over the block's transaction hashes.
    pub merkle_root: Hash,
    /// Enrollments activating at this height, ascending by `utxo_key`.
    pub enrollments: Vec<Enrollment>,
    /// One bit per validator of the height's active set (sorted by public
    /// key); set iff that validator contributed to `signature`.
    pub validators: BitField,
    /// Aggregated Schnorr signature over [`BlockHeader::signing_digest`].
    pub signature: Signature,
}

impl BlockHeader {
    /// Hash of the full header, as referenced by the next block.
    pub fn hash(&self) -> Hash {
        hash_canonical(HashDomain::Header, self)
    }

    /// The digest the collective signature covers: the consensus content of
    /// the header, independent of who ends up signing it.
    pub fn signing_digest(&self) -> Hash {
        hash_canonical(
            HashDomain::HeaderSigning,
            &(
                &self.prev_block,
                self.height,
                &self.merkle_root,
                &self.enrollments,
            ),
        )
    }
}

/// A block: header plus the full transaction set.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Transactions in Merkle order.
    pub txs: Vec<Transaction>,
}

impl Block {
    /// Assembles an unsigned block on top of `prev`.
    pub fn on_top_of(
        prev: &BlockHeader,
        mut txs: Vec<Transaction>,
        mut enrollments: Vec<Enrollment>,
    ) -> Block {
        txs.sort_by_key(Transaction::hash);
        enrollments.sort_by(|a, b| a.utxo_key.cmp(&b.utxo_key));
        let hashes: Vec<Hash> = txs.iter().map(Transaction::hash).collect();
        Block {
            header: BlockHeader {
                prev_block: prev.hash(),
                height: prev.height + 1,
                merkle_root: merkle_root(&hashes),
                enrollments,
                validators: BitField::default(),
                signature: Signature::default(),
            },
            txs,
        }
    }

    /// The deterministic genesis block shared by every node on the network.
    pub fn genesis(mut enrollments: Vec<Enrollment>, mut txs: Vec<Transaction>) -> Block {
        txs.sort_by_key(Transaction::hash);
        enrollments.sort_by(|a, b| a.utxo_key.cmp(&b.utxo_key));
        let hashes: Vec<Hash> = txs.iter().map(Transaction::hash).collect();
        Block {
            header: BlockHeader {
                prev_block: Hash::ZERO,
                height: 0,
                merkle_root: merkle_root(&hashes),
                enrollments,
                validators: BitField::default(),
                signature: Signature::default(),
            },
            txs,
        }
    }
}

/// One validator's contribution to a block's collective signature, exchanged
/// between validators while a block is being sealed.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct BlockPartialSig {
    /// Height of the block being signed.
    pub height: u64,
    /// The contributing validator.
    pub signer: super::PublicKey,
    /// Its response scalar.
    pub partial: [u8; 32],
}

/// Computes the binary Merkle root over transaction hashes.
///
/// Odd layers duplicate their last element. The root of an empty set is
/// [`Hash::ZERO`].
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return Hash::ZERO;
    }
    let mut layer: Vec<Hash> = hashes.to_vec();
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            if let Some(last) = layer.last().copied() {
                layer.push(last);
            }
        }
        layer = layer
            .chunks(2)
            .map(|pair| hash_canonical(HashDomain::Merkle, &(&pair[0], &pair[1])))
            .collect();
    }
    layer[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{Amount, PublicKey, TxOutput, TxType};

    fn tx(n: u8) -> Transaction {
        Transaction {
            tx_type: TxType::Payment,
            inputs: vec![],
            outputs: vec![TxOutput {
                amount: Amount(n as u64),
                address: PublicKey([n; 32]),
            }],
        }
    }

    #[test]
    fn merkle_root_of_empty_set_is_zero() {
        assert_eq!(merkle_root(&[]), Hash::ZERO);
    }

    #[test]
    fn merkle_root_duplicates_odd_tail() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        let c = Hash::digest(b"c");
        let manual = hash_canonical(
            HashDomain::Merkle,
            &(
                &hash_canonical(HashDomain::Merkle, &(&a, &b)),
                &hash_canonical(HashDomain::Merkle, &(&c, &c)),
            ),
        );
        assert_eq!(merkle_root(&[a, b, c]), manual);
    }

    #[test]
    fn block_assembly_sorts_and_links() {
        let genesis = Block::genesis(vec![], vec![tx(9), tx(1)]);
        assert_eq!(genesis.header.height, 0);
        assert_eq!(genesis.header.prev_block, Hash::ZERO);
        assert!(genesis.txs[0].hash() <= genesis.txs[1].hash());

        let next = Block::on_top_of(&genesis.header, vec![tx(3)], vec![]);
        assert_eq!(next.header.height, 1);
        assert_eq!(next.header.prev_block, genesis.header.hash());
        let hashes: Vec<Hash> = next.txs.iter().map(Transaction::hash).collect();
        assert_eq!(next.header.merkle_root, merkle_root(&hashes));
    }

    #[test]
    fn human_readable_dump_roundtrips() {
        let block = Block::genesis(vec![], vec![tx(1), tx(2)]);
        let dumped = serde_json::to_string(&block).unwrap();
        let back: Block = serde_json::from_str(&dumped).unwrap();
        assert_eq!(block, back);
    }

    #[test]
    fn signing_digest_ignores_signature_and_bitfield() {
        let block = Block::genesis(vec![], vec![tx(1)]);
        let mut signed = block.header.clone();
        signed.validators = BitField::new(4);
        signed.validators.set(2);
        signed.signature = Signature {
            r: [5u8; 32],
            s: [6u8; 32],
        };
        assert_eq!(block.header.signing_digest(), signed.signing_digest());
        assert_ne!(block.header.hash(), signed.hash());
    }
}
