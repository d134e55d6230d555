use sha2::{Digest, Sha256};
use update_ledger::RepositoryMetadata;

/// A deterministic 32-byte update hash from a label.
pub fn update_hash(label: &str) -> Vec<u8> {
    Sha256::digest(label.as_bytes()).to_vec()
}

/// Build a manifest from `(update_index, blob labels)` rows.
pub fn manifest(rows: &[(i64, &[&str])]) -> RepositoryMetadata {
    let mut metadata = RepositoryMetadata::new();
    for &(update_index, labels) in rows {
        metadata.push(
            update_index,
            labels.iter().map(|label| update_hash(label)).collect(),
        );
    }
    metadata
}
