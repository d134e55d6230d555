//! Global hash and tag intern caches.
//!
//! Byte-strings and tag strings arriving from remote repositories are
//! interned once into the master database; every other table speaks in
//! the resulting integer ids. Interning is on the inner loop of content
//! ingestion, so lookups go through the unique indices on `hash`/`tag`.

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, OptionalExtension};

use crate::error::{LedgerError, Result};
use crate::model::{HashId, TagId};
use crate::storage::with_temp_integer_table;

/// Longest tag the cache will intern, in UTF-8 bytes.
pub const MAX_TAG_BYTES: usize = 1024;

/// Intern a hash, returning its local id.
///
/// # Errors
///
/// Returns an error if the lookup or insert fails.
pub fn intern_hash(conn: &Connection, hash: &[u8]) -> Result<HashId> {
    let existing: Option<HashId> = conn
        .query_row(
            "SELECT hash_id FROM external_master.hashes WHERE hash = ?1",
            [hash],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(hash_id) = existing {
        return Ok(hash_id);
    }

    conn.execute(
        "INSERT INTO external_master.hashes ( hash ) VALUES ( ?1 )",
        [hash],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Intern many hashes, preserving input order.
///
/// # Errors
///
/// Returns an error if any lookup or insert fails.
pub fn intern_hashes<'a>(
    conn: &Connection,
    hashes: impl IntoIterator<Item = &'a [u8]>,
) -> Result<Vec<HashId>> {
    hashes
        .into_iter()
        .map(|hash| intern_hash(conn, hash))
        .collect()
}

/// The bytes of one interned hash.
///
/// # Errors
///
/// Returns an error if the id is not in the cache.
pub fn hash_of(conn: &Connection, hash_id: HashId) -> Result<Vec<u8>> {
    Ok(conn.query_row(
        "SELECT hash FROM external_master.hashes WHERE hash_id = ?1",
        [hash_id],
        |row| row.get(0),
    )?)
}

/// Bulk reverse lookup. Every requested id must be in the cache.
///
/// # Errors
///
/// Returns an error if the query fails or any id is missing.
pub fn hashes_of(
    conn: &Connection,
    hash_ids: &HashSet<HashId>,
) -> Result<HashMap<HashId, Vec<u8>>> {
    if hash_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let found = with_temp_integer_table(conn, "hash_id", hash_ids.iter().copied(), |conn, temp| {
        let mut stmt = conn.prepare(&format!(
            "SELECT hash_id, hash FROM {temp} CROSS JOIN external_master.hashes USING ( hash_id )"
        ))?;
        let found = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<HashMap<HashId, Vec<u8>>, _>>()?;

        Ok(found)
    })?;

    if found.len() != hash_ids.len() {
        return Err(LedgerError::Database(rusqlite::Error::QueryReturnedNoRows));
    }

    Ok(found)
}

/// Intern a tag string, returning its local id.
///
/// # Errors
///
/// Returns [`LedgerError::TagTooLarge`] for tags past [`MAX_TAG_BYTES`],
/// or an error if the lookup or insert fails.
pub fn intern_tag(conn: &Connection, tag: &str) -> Result<TagId> {
    if tag.len() > MAX_TAG_BYTES {
        return Err(LedgerError::TagTooLarge {
            len: tag.len(),
            max: MAX_TAG_BYTES,
        });
    }

    let existing: Option<TagId> = conn
        .query_row(
            "SELECT tag_id FROM external_master.tags WHERE tag = ?1",
            [tag],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(tag_id) = existing {
        return Ok(tag_id);
    }

    conn.execute("INSERT INTO external_master.tags ( tag ) VALUES ( ?1 )", [tag])?;

    Ok(conn.last_insert_rowid())
}

/// The string of one interned tag.
///
/// # Errors
///
/// Returns an error if the id is not in the cache.
pub fn tag_of(conn: &Connection, tag_id: TagId) -> Result<String> {
    Ok(conn.query_row(
        "SELECT tag FROM external_master.tags WHERE tag_id = ?1",
        [tag_id],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::{apply_schema, attach_master};

    fn memory_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        attach_master(&conn, ":memory:").unwrap();
        apply_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn interning_is_stable() {
        let conn = memory_conn();

        let first = intern_hash(&conn, &[0xab; 32]).unwrap();
        let second = intern_hash(&conn, &[0xab; 32]).unwrap();
        let other = intern_hash(&conn, &[0xcd; 32]).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(hash_of(&conn, first).unwrap(), vec![0xab; 32]);
    }

    #[test]
    fn bulk_reverse_lookup_requires_every_id() {
        let conn = memory_conn();

        let a = intern_hash(&conn, b"a").unwrap();
        let b = intern_hash(&conn, b"b").unwrap();

        let map = hashes_of(&conn, &[a, b].into_iter().collect()).unwrap();
        assert_eq!(map[&a], b"a".to_vec());
        assert_eq!(map[&b], b"b".to_vec());

        let missing = [a, b, 9999].into_iter().collect();
        assert!(hashes_of(&conn, &missing).is_err());
    }

    #[test]
    fn oversized_tags_are_rejected() {
        let conn = memory_conn();

        let tag_id = intern_tag(&conn, "character:samus aran").unwrap();
        assert_eq!(tag_of(&conn, tag_id).unwrap(), "character:samus aran");

        let oversized = "a".repeat(MAX_TAG_BYTES + 1);
        let err = intern_tag(&conn, &oversized).unwrap_err();
        assert!(matches!(err, LedgerError::TagTooLarge { .. }));
    }
}
