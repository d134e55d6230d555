//! Main `SQLite` ledger implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, error, info};

use crate::config::{StorePaths, Tuning};
use crate::error::{LedgerError, Result};
use crate::model::{
    ContentType, DefinitionIterators, DefinitionKind, HashId, JobHandle, MaintenanceJobType,
    Mime, OutstandingUpdate, ProcessableUpdates, RepositoryMetadata, RepositoryProgress,
    ServiceId, ServiceType,
};
use crate::storage::schema::{apply_schema, attach_master};
use crate::storage::tables::{
    create_repository_tables, drop_repository_tables, repository_table_names,
};
use crate::storage::{files, interning, services, with_temp_integer_table};

/// Tag rows that fail interning are mapped to this sentinel, so every
/// remote tag id still resolves to something.
const INVALID_TAG_PLACEHOLDER: &str = "invalid repository tag";

/// SQLite-backed repository update ledger.
///
/// All mutations run through one connection and are serialized behind
/// `&mut self`; each logical operation commits a single `IMMEDIATE`
/// transaction (chunked definition ingestion commits one per chunk).
pub struct SqliteLedger {
    conn: Connection,
    tuning: Tuning,
    outstanding_work: HashMap<ServiceId, HashMap<ContentType, bool>>,
}

/// Context for a mutation operation, tracking cache side effects.
///
/// Invalidations are queued during the closure and applied to the
/// in-memory cache only after the transaction commits.
#[derive(Default)]
struct MutationContext {
    cache_clears: Vec<(ServiceId, Option<ContentType>)>,
}

impl MutationContext {
    fn clear_work_cache(&mut self, service_id: ServiceId, content_type: Option<ContentType>) {
        self.cache_clears.push((service_id, content_type));
    }
}

impl SqliteLedger {
    /// Open (or create) the ledger databases at the resolved store paths.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory cannot be created, the
    /// connection cannot be established, or schema application fails.
    pub fn open(paths: &StorePaths) -> Result<Self> {
        std::fs::create_dir_all(&paths.store_dir)?;
        let conn = Connection::open(&paths.client_db)?;
        attach_master(&conn, &paths.master_db.to_string_lossy())?;

        Self::finish_open(conn, paths.tuning)
    }

    /// Open an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        attach_master(&conn, ":memory:")?;

        Self::finish_open(conn, Tuning::default())
    }

    fn finish_open(conn: Connection, tuning: Tuning) -> Result<Self> {
        apply_schema(&conn)?;
        services::ensure_local_update_service(&conn)?;

        Ok(Self {
            conn,
            tuning,
            outstanding_work: HashMap::new(),
        })
    }

    /// Execute a mutation inside one `IMMEDIATE` transaction.
    ///
    /// Queued outstanding-work invalidations are applied after commit, so
    /// a rolled-back mutation never dirties the in-memory cache.
    fn mutate<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let mut ctx = MutationContext::default();

        let result = f(&tx, &mut ctx)?;

        tx.commit()?;

        for (service_id, content_type) in ctx.cache_clears {
            self.clear_outstanding_work_cache(service_id, content_type);
        }

        Ok(result)
    }

    fn clear_outstanding_work_cache(
        &mut self,
        service_id: ServiceId,
        content_type: Option<ContentType>,
    ) {
        match content_type {
            None => {
                self.outstanding_work.remove(&service_id);
            }
            Some(content_type) => {
                if let Some(by_type) = self.outstanding_work.get_mut(&service_id) {
                    by_type.remove(&content_type);
                }
            }
        }
    }

    /// Subscribe a service. Repository services get their five ledger
    /// tables; every service gets a current-files table.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is already subscribed or DDL fails.
    pub fn add_repository_service(
        &mut self,
        service_key: &[u8],
        service_type: ServiceType,
        name: &str,
    ) -> Result<ServiceId> {
        self.mutate(|tx, _ctx| {
            let service_id = services::add_service(tx, service_key, service_type, name)?;
            files::create_current_files_table(tx, service_id)?;
            if service_type.is_repository() {
                create_repository_tables(tx, service_id)?;
            }

            info!(service_id = service_id.0, name, "subscribed service");

            Ok(service_id)
        })
    }

    /// Unsubscribe a service, dropping its tables and cache entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or DDL fails.
    pub fn remove_repository_service(&mut self, service_key: &[u8]) -> Result<()> {
        self.mutate(|tx, ctx| {
            let service_id = services::service_id(tx, service_key)?;
            let service_type = services::service_type(tx, service_id)?;

            if service_type.is_repository() {
                drop_repository_tables(tx, service_id)?;
            }
            files::drop_current_files_table(tx, service_id)?;
            services::remove_service(tx, service_id)?;

            ctx.clear_work_cache(service_id, None);

            info!(service_id = service_id.0, "unsubscribed service");

            Ok(())
        })
    }

    /// Look up a subscribed service id by key.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ServiceUnknown`] if the key is unknown.
    pub fn repository_service_id(&self, service_key: &[u8]) -> Result<ServiceId> {
        services::service_id(&self.conn, service_key)
    }

    /// Record an update file as locally stored, with its mime known.
    ///
    /// This does not register the update anywhere; callers follow up with
    /// [`Self::notify_updates_imported`] once a batch has landed.
    ///
    /// # Errors
    ///
    /// Returns an error if any write fails.
    pub fn import_update_file(
        &mut self,
        hash: &[u8],
        mime: Mime,
        size: Option<i64>,
    ) -> Result<HashId> {
        self.mutate(|tx, _ctx| {
            let hash_id = interning::intern_hash(tx, hash)?;
            files::set_file_info(tx, hash_id, mime, size)?;
            let local = services::local_update_service_id(tx)?;
            files::add_current(tx, local, hash_id)?;

            Ok(hash_id)
        })
    }

    /// Remove an update file from the local domain (it stays interned and
    /// its info row stays; only locality changes).
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn remove_update_file(&mut self, hash_id: HashId) -> Result<()> {
        self.mutate(|tx, _ctx| {
            let local = services::local_update_service_id(tx)?;
            files::remove_current(tx, local, hash_id)
        })
    }

    /// Authoritative re-sync: make the service's update set equal the
    /// manifest's, renumbering kept rows whose index moved.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is unknown or any write fails.
    pub fn set_repository_update_hashes(
        &mut self,
        service_key: &[u8],
        metadata: &RepositoryMetadata,
    ) -> Result<()> {
        self.mutate(|tx, ctx| {
            let service_id = services::service_id(tx, service_key)?;
            let names = repository_table_names(service_id);

            let current: HashSet<HashId> = {
                let mut stmt = tx.prepare(&format!("SELECT hash_id FROM {}", names.updates))?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<HashSet<_>, _>>()?
            };

            let future: HashSet<HashId> = interning::intern_hashes(tx, metadata.update_hashes())?
                .into_iter()
                .collect();

            let deletees: Vec<HashId> = current.difference(&future).copied().collect();
            for table in [&names.updates, &names.unregistered, &names.processed] {
                let mut stmt = tx.prepare(&format!("DELETE FROM {table} WHERE hash_id = ?1"))?;
                for &hash_id in &deletees {
                    stmt.execute([hash_id])?;
                }
            }

            let mut inserts: Vec<(i64, HashId)> = Vec::new();
            for row in metadata.rows() {
                for hash in &row.update_hashes {
                    let hash_id = interning::intern_hash(tx, hash)?;

                    if current.contains(&hash_id) {
                        // the remote may renumber history on merges
                        tx.execute(
                            &format!(
                                "UPDATE {} SET update_index = ?1 WHERE hash_id = ?2",
                                names.updates
                            ),
                            params![row.update_index, hash_id],
                        )?;
                    } else {
                        inserts.push((row.update_index, hash_id));
                    }
                }
            }

            insert_update_rows(tx, &names.updates, &names.unregistered, &inserts)?;

            register_updates(tx, ctx, service_id, None)?;

            ctx.clear_work_cache(service_id, None);

            debug!(
                service_id = service_id.0,
                kept = future.len(),
                dropped = deletees.len(),
                "applied authoritative update manifest"
            );

            Ok(())
        })
    }

    /// Incremental slice: add any new update rows, then run registration
    /// for the whole service (a previously-unregistered update may have
    /// become registerable because its file arrived separately).
    ///
    /// # Errors
    ///
    /// Returns an error if the service is unknown or any write fails.
    pub fn associate_repository_update_hashes(
        &mut self,
        service_key: &[u8],
        metadata_slice: &RepositoryMetadata,
    ) -> Result<()> {
        self.mutate(|tx, ctx| {
            let service_id = services::service_id(tx, service_key)?;
            let names = repository_table_names(service_id);

            let mut inserts: Vec<(i64, HashId)> = Vec::new();
            for row in metadata_slice.rows() {
                for hash in &row.update_hashes {
                    inserts.push((row.update_index, interning::intern_hash(tx, hash)?));
                }
            }

            insert_update_rows(tx, &names.updates, &names.unregistered, &inserts)?;

            register_updates(tx, ctx, service_id, None)
        })
    }

    /// File-store trigger: newly-imported files may complete pending
    /// registrations on any subscribed repository.
    ///
    /// # Errors
    ///
    /// Returns an error if any write fails.
    pub fn notify_updates_imported(&mut self, hash_ids: &[HashId]) -> Result<()> {
        self.mutate(|tx, ctx| {
            for service_id in services::repository_service_ids(tx)? {
                register_updates(tx, ctx, service_id, Some(hash_ids))?;
            }

            Ok(())
        })
    }

    /// Startup sweep: run registration for every subscribed repository.
    ///
    /// # Errors
    ///
    /// Returns an error if any write fails.
    pub fn do_outstanding_update_registration(&mut self) -> Result<()> {
        self.mutate(|tx, ctx| {
            for service_id in services::repository_service_ids(tx)? {
                register_updates(tx, ctx, service_id, None)?;
            }

            Ok(())
        })
    }

    /// Sync progress for one repository, by content type.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is unknown or a query fails.
    pub fn get_repository_progress(&self, service_key: &[u8]) -> Result<RepositoryProgress> {
        let conn = &self.conn;
        let service_id = services::service_id(conn, service_key)?;
        let names = repository_table_names(service_id);

        let num_total_updates: u64 = conn.query_row(
            &format!("SELECT COUNT( * ) FROM {}", names.updates),
            [],
            |row| row.get(0),
        )?;

        let local = services::local_update_service_id(conn)?;
        let join = files::current_files_join_clause(local, &names.updates);
        let num_local_updates: u64 =
            conn.query_row(&format!("SELECT COUNT( * ) FROM {join}"), [], |row| {
                row.get(0)
            })?;

        let total_by_type = group_count(
            conn,
            &format!(
                "SELECT content_type, COUNT( * ) FROM {} GROUP BY content_type",
                names.processed
            ),
        )?;
        let mut processed_by_type = group_count(
            conn,
            &format!(
                "SELECT content_type, COUNT( * ) FROM {} WHERE processed = 1 GROUP BY content_type",
                names.processed
            ),
        )?;

        // zero-fill so callers see every content type the total does
        for content_type in total_by_type.keys() {
            processed_by_type.entry(*content_type).or_insert(0);
        }

        Ok(RepositoryProgress {
            num_local_updates,
            num_total_updates,
            processed_by_type,
            total_by_type,
        })
    }

    /// The readiness oracle: which updates can be processed right now,
    /// split into definition work and content work.
    ///
    /// It is important that candidates are gated by update index: add and
    /// delete actions in the content stream are order-sensitive, so a
    /// later update must never be exposed while an earlier one is
    /// unregistered or missing its file.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is unknown or a query fails.
    pub fn get_processable_update_hashes(
        &self,
        service_key: &[u8],
        content_types_to_process: &[ContentType],
    ) -> Result<ProcessableUpdates> {
        let conn = &self.conn;
        let service_id = services::service_id(conn, service_key)?;
        let names = repository_table_names(service_id);

        let first_definitions_work = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE content_type = ?1 AND processed = 1 LIMIT 1",
                    names.processed
                ),
                [ContentType::Definitions.as_i64()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_none();

        let first_content_work = conn
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE content_type != ?1 AND processed = 1 LIMIT 1",
                    names.processed
                ),
                [ContentType::Definitions.as_i64()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_none();

        if content_types_to_process.is_empty() {
            return Ok(ProcessableUpdates {
                first_definitions_work,
                first_content_work,
                ..ProcessableUpdates::default()
            });
        }

        let min_unregistered_update_index: Option<i64> = conn.query_row(
            &format!(
                "SELECT MIN( update_index ) FROM {} CROSS JOIN {} USING ( hash_id )",
                names.unregistered, names.updates
            ),
            [],
            |row| row.get(0),
        )?;

        let mut predicate = format!(
            "processed = 0 AND content_type IN ( {} )",
            splay_content_types(content_types_to_process)
        );
        if let Some(min_index) = min_unregistered_update_index {
            // an unregistered update is both unprocessed and unavailable,
            // and indices must not be skipped, so nothing at or past the
            // first one is a candidate
            let _ = write!(predicate, " AND update_index < {min_index}");
        }

        let mut indices_to_hash_ids: BTreeMap<i64, HashSet<HashId>> = BTreeMap::new();
        let mut hash_ids_to_content_types: HashMap<HashId, BTreeSet<ContentType>> = HashMap::new();
        {
            let mut stmt = conn.prepare(&format!(
                "SELECT update_index, hash_id, content_type FROM {} CROSS JOIN {} USING ( hash_id ) WHERE {predicate}",
                names.processed, names.updates
            ))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let update_index: i64 = row.get(0)?;
                let hash_id: HashId = row.get(1)?;
                let code: i64 = row.get(2)?;
                let content_type =
                    ContentType::from_i64(code).ok_or(LedgerError::UnknownContentType(code))?;

                indices_to_hash_ids
                    .entry(update_index)
                    .or_default()
                    .insert(hash_id);
                hash_ids_to_content_types
                    .entry(hash_id)
                    .or_default()
                    .insert(content_type);
            }
        }

        let all_hash_ids: HashSet<HashId> =
            indices_to_hash_ids.values().flatten().copied().collect();
        let local = services::local_update_service_id(conn)?;
        let local_hash_ids = files::filter_current(conn, local, &all_hash_ids)?;

        // scanning ascending, the first index with a non-local unprocessed
        // file cuts off everything at or past it
        let cutoff = indices_to_hash_ids
            .iter()
            .find(|(_, hash_ids)| !hash_ids.is_subset(&local_hash_ids))
            .map(|(&update_index, _)| update_index);
        if let Some(cutoff) = cutoff {
            indices_to_hash_ids.split_off(&cutoff);
        }

        let remaining: HashSet<HashId> = indices_to_hash_ids.values().flatten().copied().collect();
        let hash_ids_to_hashes = interning::hashes_of(conn, &remaining)?;

        let definitions_only: BTreeSet<ContentType> =
            std::iter::once(ContentType::Definitions).collect();

        let mut definition_updates = Vec::new();
        let mut content_updates = Vec::new();

        for hash_ids in indices_to_hash_ids.values() {
            let mut sorted: Vec<HashId> = hash_ids.iter().copied().collect();
            sorted.sort_unstable();

            for hash_id in sorted {
                let content_types = hash_ids_to_content_types
                    .get(&hash_id)
                    .cloned()
                    .unwrap_or_default();
                let hash = hash_ids_to_hashes
                    .get(&hash_id)
                    .cloned()
                    .ok_or(LedgerError::Database(rusqlite::Error::QueryReturnedNoRows))?;

                let update = OutstandingUpdate {
                    hash,
                    content_types,
                };
                if update.content_types == definitions_only {
                    definition_updates.push(update);
                } else {
                    content_updates.push(update);
                }
            }
        }

        Ok(ProcessableUpdates {
            first_definitions_work,
            definition_updates,
            first_content_work,
            content_updates,
        })
    }

    /// Every update hash the service knows about but the local file store
    /// does not hold, in history order. Callers fetch in this order.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is unknown or a query fails.
    pub fn get_missing_update_hashes(&self, service_key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let conn = &self.conn;
        let service_id = services::service_id(conn, service_key)?;
        let names = repository_table_names(service_id);

        let all_hash_ids: Vec<HashId> = {
            let mut stmt = conn.prepare(&format!(
                "SELECT hash_id FROM {} ORDER BY update_index ASC",
                names.updates
            ))?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        let local = services::local_update_service_id(conn)?;
        let join = files::current_files_join_clause(local, &names.updates);
        let existing: HashSet<HashId> = {
            let mut stmt = conn.prepare(&format!("SELECT hash_id FROM {join}"))?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<std::result::Result<HashSet<_>, _>>()?
        };

        all_hash_ids
            .into_iter()
            .filter(|hash_id| !existing.contains(hash_id))
            .map(|hash_id| interning::hash_of(conn, hash_id))
            .collect()
    }

    /// Whether any of `content_types` has at least the threshold count of
    /// unprocessed rows. Memoized per (service, content type); a pacing
    /// heuristic, not an invariant.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails.
    pub fn has_lots_of_outstanding_local_processing(
        &mut self,
        service_id: ServiceId,
        content_types: &[ContentType],
    ) -> Result<bool> {
        let names = repository_table_names(service_id);
        let threshold = i64::try_from(self.tuning.outstanding_work_threshold).unwrap_or(i64::MAX);

        for &content_type in content_types {
            let cached = self
                .outstanding_work
                .get(&service_id)
                .and_then(|by_type| by_type.get(&content_type))
                .copied();

            let lots = match cached {
                Some(lots) => lots,
                None => {
                    let matched: i64 = self.conn.query_row(
                        &format!(
                            "SELECT COUNT( * ) FROM (
                                SELECT 1 FROM {} WHERE content_type = ?1 AND processed = 0 LIMIT ?2
                            )",
                            names.processed
                        ),
                        params![content_type.as_i64(), threshold],
                        |row| row.get(0),
                    )?;
                    let lots = matched >= threshold;

                    self.outstanding_work
                        .entry(service_id)
                        .or_default()
                        .insert(content_type, lots);

                    lots
                }
            };

            if lots {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Record that an update blob's listed content types have been applied.
    ///
    /// # Errors
    ///
    /// Returns an error if any write fails.
    pub fn set_update_processed(
        &mut self,
        service_id: ServiceId,
        update_hash: &[u8],
        content_types: &[ContentType],
    ) -> Result<()> {
        self.mutate(|tx, ctx| {
            let names = repository_table_names(service_id);
            let update_hash_id = interning::intern_hash(tx, update_hash)?;

            let mut stmt = tx.prepare(&format!(
                "UPDATE {} SET processed = 1 WHERE hash_id = ?1 AND content_type = ?2",
                names.processed
            ))?;
            for &content_type in content_types {
                stmt.execute(params![update_hash_id, content_type.as_i64()])?;
                ctx.clear_work_cache(service_id, Some(content_type));
            }

            Ok(())
        })
    }

    /// Flip every processed row of the listed content types back to
    /// unprocessed. Idempotent and cheap; definition maps are left in
    /// place for the re-processed blobs to `REPLACE`.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is unknown or any write fails.
    pub fn reprocess_repository(
        &mut self,
        service_key: &[u8],
        content_types: &[ContentType],
    ) -> Result<()> {
        self.mutate(|tx, ctx| {
            let service_id = services::service_id(tx, service_key)?;
            reprocess(tx, ctx, service_id, content_types)
        })
    }

    /// Ingest a definition blob's id-to-payload streams in chunks,
    /// interning payloads and `REPLACE`-ing map rows.
    ///
    /// Resumable: between chunks the wall-clock deadline and the job's
    /// cancellation flag are polled; on either firing, the rows written so
    /// far stay committed and the partially-drained iterators are handed
    /// back for a later call to continue. Only once both streams are
    /// exhausted is the blob marked processed.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is unknown or any write fails.
    pub fn process_repository_definitions(
        &mut self,
        service_key: &[u8],
        definition_hash: &[u8],
        iterators: &mut DefinitionIterators,
        // definition blobs only ever carry definitions; accepted for
        // forward compatibility
        _content_types: &[ContentType],
        job: &JobHandle,
        work_time: Option<Duration>,
    ) -> Result<usize> {
        let service_id = services::service_id(&self.conn, service_key)?;
        let names = repository_table_names(service_id);
        let deadline = work_time.and_then(|budget| Instant::now().checked_add(budget));
        let chunk_size = self.tuning.definition_chunk_size.max(1);

        let mut num_rows_processed = 0;

        if let Some(mut rows) = iterators.hash_rows.take() {
            loop {
                let chunk: Vec<(i64, Vec<u8>)> = rows.by_ref().take(chunk_size).collect();
                if chunk.is_empty() {
                    break;
                }

                self.mutate(|tx, _ctx| {
                    let mut stmt = tx.prepare(&format!(
                        "REPLACE INTO {} ( service_hash_id, hash_id ) VALUES ( ?1, ?2 )",
                        names.hash_id_map
                    ))?;
                    for (service_hash_id, hash) in &chunk {
                        let hash_id = interning::intern_hash(tx, hash)?;
                        stmt.execute(params![service_hash_id, hash_id])?;
                    }

                    Ok(())
                })?;

                num_rows_processed += chunk.len();

                if out_of_time(deadline) || job.is_cancelled() {
                    iterators.hash_rows = Some(rows);
                    return Ok(num_rows_processed);
                }
            }
        }

        if let Some(mut rows) = iterators.tag_rows.take() {
            loop {
                let chunk: Vec<(i64, String)> = rows.by_ref().take(chunk_size).collect();
                if chunk.is_empty() {
                    break;
                }

                self.mutate(|tx, _ctx| {
                    let mut stmt = tx.prepare(&format!(
                        "REPLACE INTO {} ( service_tag_id, tag_id ) VALUES ( ?1, ?2 )",
                        names.tag_id_map
                    ))?;
                    for (service_tag_id, tag) in &chunk {
                        let tag_id = match interning::intern_tag(tx, tag) {
                            Ok(tag_id) => tag_id,
                            Err(LedgerError::TagTooLarge { .. }) => {
                                interning::intern_tag(tx, INVALID_TAG_PLACEHOLDER)?
                            }
                            Err(err) => return Err(err),
                        };
                        stmt.execute(params![service_tag_id, tag_id])?;
                    }

                    Ok(())
                })?;

                num_rows_processed += chunk.len();

                if out_of_time(deadline) || job.is_cancelled() {
                    iterators.tag_rows = Some(rows);
                    return Ok(num_rows_processed);
                }
            }
        }

        self.set_update_processed(service_id, definition_hash, &[ContentType::Definitions])?;

        debug!(
            service_id = service_id.0,
            rows = num_rows_processed,
            "definition blob fully applied"
        );

        Ok(num_rows_processed)
    }

    /// Resolve a remote hash id to its local intern id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CriticalDefinition`] if the id has no map
    /// row; the remedial state is committed before the error is returned.
    pub fn normalise_service_hash_id(
        &mut self,
        service_id: ServiceId,
        service_hash_id: i64,
    ) -> Result<HashId> {
        let names = repository_table_names(service_id);

        let result: Option<HashId> = self
            .conn
            .query_row(
                &format!(
                    "SELECT hash_id FROM {} WHERE service_hash_id = ?1",
                    names.hash_id_map
                ),
                [service_hash_id],
                |row| row.get(0),
            )
            .optional()?;

        match result {
            Some(hash_id) => Ok(hash_id),
            None => {
                self.handle_critical_definition_error(service_id)?;
                Err(LedgerError::CriticalDefinition {
                    kind: "hash_id",
                    bad_ids: vec![service_hash_id],
                })
            }
        }
    }

    /// Bulk hash-id resolution via a temporary-table join.
    ///
    /// The map is a function but not an injection, so matched local ids
    /// are deduplicated and only genuinely unmapped inputs count as bad.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CriticalDefinition`] listing every unmapped
    /// input; the remedial state is committed before the error is returned.
    pub fn normalise_service_hash_ids(
        &mut self,
        service_id: ServiceId,
        service_hash_ids: &HashSet<i64>,
    ) -> Result<HashSet<HashId>> {
        let names = repository_table_names(service_id);

        let matched: Vec<(i64, HashId)> = with_temp_integer_table(
            &self.conn,
            "service_hash_id",
            service_hash_ids.iter().copied(),
            |conn, temp| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT service_hash_id, hash_id FROM {temp} CROSS JOIN {} USING ( service_hash_id )",
                    names.hash_id_map
                ))?;
                let matched = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                Ok(matched)
            },
        )?;

        let matched_inputs: HashSet<i64> = matched
            .iter()
            .map(|&(service_hash_id, _)| service_hash_id)
            .collect();

        if matched_inputs.len() != service_hash_ids.len() {
            let mut bad_ids: Vec<i64> = service_hash_ids
                .difference(&matched_inputs)
                .copied()
                .collect();
            bad_ids.sort_unstable();

            self.handle_critical_definition_error(service_id)?;
            return Err(LedgerError::CriticalDefinition {
                kind: "hash_ids",
                bad_ids,
            });
        }

        Ok(matched.into_iter().map(|(_, hash_id)| hash_id).collect())
    }

    /// Resolve a remote tag id to its local intern id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CriticalDefinition`] if the id has no map
    /// row; the remedial state is committed before the error is returned.
    pub fn normalise_service_tag_id(
        &mut self,
        service_id: ServiceId,
        service_tag_id: i64,
    ) -> Result<i64> {
        let names = repository_table_names(service_id);

        let result: Option<i64> = self
            .conn
            .query_row(
                &format!(
                    "SELECT tag_id FROM {} WHERE service_tag_id = ?1",
                    names.tag_id_map
                ),
                [service_tag_id],
                |row| row.get(0),
            )
            .optional()?;

        match result {
            Some(tag_id) => Ok(tag_id),
            None => {
                self.handle_critical_definition_error(service_id)?;
                Err(LedgerError::CriticalDefinition {
                    kind: "tag_id",
                    bad_ids: vec![service_tag_id],
                })
            }
        }
    }

    /// Queue maintenance work for every locally-present update file of a
    /// repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is unknown or any write fails.
    pub fn schedule_update_file_maintenance(
        &mut self,
        service_key: &[u8],
        job_type: MaintenanceJobType,
    ) -> Result<()> {
        self.mutate(|tx, _ctx| {
            let service_id = services::service_id(tx, service_key)?;
            schedule_update_file_maintenance(tx, service_id, job_type)
        })
    }

    /// Pending maintenance work of one type, for the outer client's queue
    /// runner.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn pending_maintenance_jobs(&self, job_type: MaintenanceJobType) -> Result<Vec<HashId>> {
        files::jobs_of_type(&self.conn, job_type)
    }

    /// Which tables reference which intern-id family, across every
    /// subscribed repository. Consumed by whole-database reference
    /// integrity sweeps.
    ///
    /// # Errors
    ///
    /// Returns an error if the service listing fails.
    pub fn tables_and_columns_for_definitions(
        &self,
        kind: DefinitionKind,
    ) -> Result<Vec<(String, String)>> {
        let mut tables_and_columns = Vec::new();

        for service_id in services::repository_service_ids(&self.conn)? {
            let names = repository_table_names(service_id);

            match kind {
                DefinitionKind::Hash => {
                    tables_and_columns.push((names.updates, "hash_id".to_string()));
                    tables_and_columns.push((names.hash_id_map, "hash_id".to_string()));
                }
                DefinitionKind::Tag => {
                    tables_and_columns.push((names.tag_id_map, "tag_id".to_string()));
                }
            }
        }

        Ok(tables_and_columns)
    }

    /// Remedial path for a broken definition reference: force every
    /// definition blob to reprocess and queue integrity + metadata checks
    /// on all local update files. Committed in its own transaction so the
    /// remedial state survives the error the caller is about to see.
    fn handle_critical_definition_error(&mut self, service_id: ServiceId) -> Result<()> {
        error!(
            service_id = service_id.0,
            "definition reference in an invalid state; queueing definition reprocess and update-file checks"
        );

        self.mutate(|tx, ctx| {
            reprocess(tx, ctx, service_id, &[ContentType::Definitions])?;
            schedule_update_file_maintenance(tx, service_id, MaintenanceJobType::IntegrityData)?;
            schedule_update_file_maintenance(tx, service_id, MaintenanceJobType::Metadata)?;

            Ok(())
        })
    }
}

/// Insert-or-ignore `(update_index, hash_id)` rows into the updates table
/// and their hash ids into the unregistered table.
fn insert_update_rows(
    tx: &Transaction,
    updates_table: &str,
    unregistered_table: &str,
    rows: &[(i64, HashId)],
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let mut insert_update = tx.prepare(&format!(
        "INSERT OR IGNORE INTO {updates_table} ( update_index, hash_id ) VALUES ( ?1, ?2 )"
    ))?;
    let mut insert_unregistered = tx.prepare(&format!(
        "INSERT OR IGNORE INTO {unregistered_table} ( hash_id ) VALUES ( ?1 )"
    ))?;

    for &(update_index, hash_id) in rows {
        insert_update.execute(params![update_index, hash_id])?;
        insert_unregistered.execute([hash_id])?;
    }

    Ok(())
}

/// Promote unregistered updates whose files and mimes are locally known:
/// materialize their processed rows and drop them from the unregistered
/// set. Candidates with no known mime are silently skipped.
fn register_updates(
    tx: &Transaction,
    ctx: &mut MutationContext,
    service_id: ServiceId,
    hash_ids: Option<&[HashId]>,
) -> Result<()> {
    let names = repository_table_names(service_id);

    let candidates: HashSet<HashId> = match hash_ids {
        None => {
            let mut stmt = tx.prepare(&format!("SELECT hash_id FROM {}", names.unregistered))?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<std::result::Result<HashSet<_>, _>>()?
        }
        Some(hash_ids) => {
            with_temp_integer_table(tx, "hash_id", hash_ids.iter().copied(), |conn, temp| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT hash_id FROM {temp} CROSS JOIN {} USING ( hash_id )",
                    names.unregistered
                ))?;
                let candidates = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<HashSet<_>, _>>()?;

                Ok(candidates)
            })?
        }
    };

    if candidates.is_empty() {
        return Ok(());
    }

    ctx.clear_work_cache(service_id, None);

    let service_type = services::service_type(tx, service_id)?;

    let hash_ids_to_mimes: HashMap<HashId, Mime> =
        with_temp_integer_table(tx, "hash_id", candidates.iter().copied(), |conn, temp| {
            let mut stmt = conn.prepare(&format!(
                "SELECT hash_id, mime FROM {temp} CROSS JOIN files_info USING ( hash_id )"
            ))?;
            let mut rows = stmt.query([])?;

            let mut hash_ids_to_mimes = HashMap::new();
            while let Some(row) = rows.next()? {
                let hash_id: HashId = row.get(0)?;
                let code: i64 = row.get(1)?;
                let mime = Mime::from_i64(code).ok_or(LedgerError::UnknownMime(code))?;
                hash_ids_to_mimes.insert(hash_id, mime);
            }

            Ok(hash_ids_to_mimes)
        })?;

    if hash_ids_to_mimes.is_empty() {
        return Ok(());
    }

    let mut insert_processed = tx.prepare(&format!(
        "INSERT OR IGNORE INTO {} ( hash_id, content_type, processed ) VALUES ( ?1, ?2, 0 )",
        names.processed
    ))?;
    for (&hash_id, &mime) in &hash_ids_to_mimes {
        let content_types: &[ContentType] = if mime == Mime::UpdateDefinitions {
            &[ContentType::Definitions]
        } else {
            service_type.content_types()
        };

        for &content_type in content_types {
            insert_processed.execute(params![hash_id, content_type.as_i64()])?;
        }
    }

    let mut delete_unregistered = tx.prepare(&format!(
        "DELETE FROM {} WHERE hash_id = ?1",
        names.unregistered
    ))?;
    for &hash_id in hash_ids_to_mimes.keys() {
        delete_unregistered.execute([hash_id])?;
    }

    debug!(
        service_id = service_id.0,
        registered = hash_ids_to_mimes.len(),
        "registered updates"
    );

    Ok(())
}

fn reprocess(
    tx: &Transaction,
    ctx: &mut MutationContext,
    service_id: ServiceId,
    content_types: &[ContentType],
) -> Result<()> {
    let names = repository_table_names(service_id);

    let mut stmt = tx.prepare(&format!(
        "UPDATE {} SET processed = 0 WHERE content_type = ?1",
        names.processed
    ))?;
    for &content_type in content_types {
        stmt.execute([content_type.as_i64()])?;
    }

    ctx.clear_work_cache(service_id, None);

    Ok(())
}

fn schedule_update_file_maintenance(
    tx: &Transaction,
    service_id: ServiceId,
    job_type: MaintenanceJobType,
) -> Result<()> {
    let names = repository_table_names(service_id);
    let local = services::local_update_service_id(tx)?;
    let join = files::current_files_join_clause(local, &names.updates);

    let update_hash_ids: Vec<HashId> = {
        let mut stmt = tx.prepare(&format!("SELECT hash_id FROM {join}"))?;
        stmt.query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
    };

    files::enqueue_jobs(tx, &update_hash_ids, job_type)
}

fn group_count(conn: &Connection, sql: &str) -> Result<BTreeMap<ContentType, u64>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;

    let mut counts = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let code: i64 = row.get(0)?;
        let count: u64 = row.get(1)?;
        let content_type =
            ContentType::from_i64(code).ok_or(LedgerError::UnknownContentType(code))?;
        counts.insert(content_type, count);
    }

    Ok(counts)
}

fn splay_content_types(content_types: &[ContentType]) -> String {
    let codes: Vec<String> = content_types
        .iter()
        .map(|content_type| content_type.as_i64().to_string())
        .collect();

    codes.join(", ")
}

fn out_of_time(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}
