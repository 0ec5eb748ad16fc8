use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};
use rusqlite::Connection;
use serde_json::Value;

use crate::compress::{self, CompressionWarning};
use crate::error::{Container, SyncError, UniqueConflictEntry};
use crate::message::{self, PayloadMap, PullMessage};
use crate::oplog::{self, OpKind};
use crate::registry::{ContentType, Ref, Registry};
use crate::store::{self, Row};

/// Tie-break hooks for the two symmetric conflict rules. The default rules
/// keep local data; applications can override per ref.
pub trait MergePolicy {
    /// Update/update on the same ref: `true` keeps the local row and drops
    /// the remote update until the next push overwrites it server-side.
    fn local_update_wins(&self, target: &Ref) -> bool {
        let _ = target;
        true
    }

    /// Insert/insert pk collision: `true` keeps the local row and moves the
    /// incoming one to a fresh pk; `false` lets the incoming row overwrite.
    fn reallocate_remote_insert(&self, target: &Ref) -> bool {
        let _ = target;
        true
    }
}

/// The fixed rules: local edits win, colliding inserts are moved aside.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalWins;

impl MergePolicy for LocalWins {}

/// What a merge did, for logging and assertions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeStats {
    pub applied: usize,
    pub skipped: usize,
    pub reallocated: usize,
    pub reinserted: usize,
    pub swap_rows: usize,
    pub warnings: Vec<CompressionWarning>,
}

fn missing(target: &Ref, container: Container) -> SyncError {
    SyncError::MergeFetch {
        type_id: target.type_id.clone(),
        pk: target.pk,
        container,
    }
}

/// Consume a pull message: compress both journals, detect identity
/// conflicts, apply the remote operations with the resolution policy, and
/// settle unique-constraint swaps.
///
/// The caller supplies `conn` already inside the transaction that also
/// advances `last_known_version`; any error here rolls everything back.
/// Rows are written through `store` directly so nothing applied from the
/// server re-enters the journal.
pub fn merge(
    conn: &Connection,
    registry: &Registry,
    policy: &dyn MergePolicy,
    msg: &PullMessage,
) -> Result<MergeStats, SyncError> {
    let local_raw = oplog::unversioned(conn)?;
    let (local, warnings) = compress::compress_local(&local_raw);
    for w in &warnings {
        warn!(
            "journal run for {} does not match the capture grammar ({:?}); shipping as-is",
            w.target, w.kinds
        );
    }
    let remote = compress::compress_remote(&msg.operations);

    // one net kind per ref after compression; unmatched runs keep their
    // final kind for conflict purposes
    let mut local_kind: BTreeMap<Ref, OpKind> = BTreeMap::new();
    for op in &local {
        local_kind.insert(op.row_ref(), op.kind);
    }

    // rows behind live local inserts/updates, fetched up front; a live
    // journal entry without a row is journal/store drift and fatal
    let mut local_rows: BTreeMap<Ref, Row> = BTreeMap::new();
    for (target, kind) in &local_kind {
        if matches!(kind, OpKind::Insert | OpKind::Update) {
            let ct = registry.get(&target.type_id)?;
            let row = store::fetch_row(conn, ct, target.pk)?
                .ok_or_else(|| missing(target, Container::Db))?;
            local_rows.insert(target.clone(), row);
        }
    }
    let mut local_deletes: BTreeSet<Ref> = local_kind
        .iter()
        .filter(|(_, k)| **k == OpKind::Delete)
        .map(|(r, _)| r.clone())
        .collect();

    let mut stats = MergeStats {
        warnings,
        ..MergeStats::default()
    };
    let mut swap_edges: Vec<(Ref, Ref)> = Vec::new();
    let mut deferred: BTreeMap<Ref, Row> = BTreeMap::new();

    for op in &remote {
        let ct = registry.get(&op.type_id)?;
        let target = op.row_ref();

        match op.kind {
            OpKind::Delete => match local_kind.get(&target) {
                Some(OpKind::Delete) => {
                    // deleted on both sides; the server already holds the
                    // net state, so the whole local run is moot
                    oplog::remove_unversioned_for(conn, &target)?;
                    local_deletes.remove(&target);
                    local_kind.remove(&target);
                    stats.skipped += 1;
                }
                Some(_) => {
                    debug!("keeping locally edited {target} over remote delete");
                    stats.skipped += 1;
                }
                None => {
                    if let Some(child) = dependent_local_row(registry, &local_rows, &target)? {
                        debug!("remote delete of {target} undone; local {child} references it");
                        stats.skipped += 1;
                    } else {
                        store::delete_row(conn, ct, target.pk)?;
                        stats.applied += 1;
                    }
                }
            },
            OpKind::Insert | OpKind::Update => {
                if op.kind == OpKind::Update
                    && local_kind.get(&target) == Some(&OpKind::Update)
                    && policy.local_update_wins(&target)
                {
                    debug!("discarding remote update of {target}; local update wins");
                    stats.skipped += 1;
                    continue;
                }

                let payload = message::payload_get(&msg.payloads, &target)
                    .ok_or_else(|| missing(&target, Container::Msg))?;
                let mut row = payload.clone();
                let mut final_target = target.clone();

                if op.kind == OpKind::Insert
                    && local_kind.get(&target) == Some(&OpKind::Insert)
                    && policy.reallocate_remote_insert(&target)
                {
                    let pk = store::max_pk(conn, ct)? + 1;
                    row.insert(ct.pk_column.clone(), Value::from(pk));
                    final_target = Ref::new(target.type_id.clone(), pk);
                    info!("pk collision on {target}; incoming row moved to pk {pk}");
                    stats.reallocated += 1;
                }

                // a local delete of this row loses to the remote edit
                if local_kind.get(&target) == Some(&OpKind::Delete) {
                    oplog::remove_unversioned_deletes(conn, &target)?;
                    local_deletes.remove(&target);
                    local_kind.remove(&target);
                    stats.reinserted += 1;
                }

                // locally deleted parents referenced by the incoming row
                // come back from the message
                for fk in &ct.foreign_keys {
                    let Some(parent_pk) = row.get(&fk.column).and_then(Value::as_i64) else {
                        continue;
                    };
                    let parent = Ref::new(fk.target.clone(), parent_pk);
                    if !local_deletes.contains(&parent) {
                        continue;
                    }
                    let parent_row = message::payload_get(&msg.payloads, &parent)
                        .ok_or_else(|| missing(&parent, Container::Msg))?;
                    let parent_ct = registry.get(&parent.type_id)?;
                    store::upsert_row(conn, parent_ct, parent_row)?;
                    oplog::remove_unversioned_deletes(conn, &parent)?;
                    local_deletes.remove(&parent);
                    local_kind.remove(&parent);
                    debug!("restored {parent}; incoming {final_target} references it");
                    stats.reinserted += 1;
                }

                // unique constraints: a value exchange is deferred to the
                // swap phase; a collision the message cannot explain aborts
                if let Some(partner) =
                    unique_collision(conn, ct, &final_target, &row, &msg.payloads)?
                {
                    swap_edges.push((final_target.clone(), partner));
                    deferred.insert(final_target, row);
                    continue;
                }

                store::upsert_row(conn, ct, &row)
                    .map_err(|e| e.into_integrity(&final_target.type_id, final_target.pk))?;
                stats.applied += 1;
            }
        }
    }

    if !swap_edges.is_empty() {
        resolve_swaps(
            conn,
            registry,
            &swap_edges,
            &deferred,
            &msg.payloads,
            &mut stats,
        )?;
    }

    info!(
        "merge done: {} applied, {} skipped, {} reallocated, {} reinserted, {} swap row(s)",
        stats.applied, stats.skipped, stats.reallocated, stats.reinserted, stats.swap_rows
    );
    Ok(stats)
}

/// Does any live local row hold a foreign key onto `target`?
fn dependent_local_row(
    registry: &Registry,
    local_rows: &BTreeMap<Ref, Row>,
    target: &Ref,
) -> Result<Option<Ref>, SyncError> {
    for (lref, row) in local_rows {
        let ct = registry.get(&lref.type_id)?;
        for fk in &ct.foreign_keys {
            if fk.target == target.type_id
                && row.get(&fk.column).and_then(Value::as_i64) == Some(target.pk)
            {
                return Ok(Some(lref.clone()));
            }
        }
    }
    Ok(None)
}

/// Check `row` against every unique constraint of its type, in declaration
/// order. Returns the colliding local ref when the message also carries
/// that row (a swap step); errors when it does not (unsolvable).
fn unique_collision(
    conn: &Connection,
    ct: &ContentType,
    target: &Ref,
    row: &Row,
    payloads: &PayloadMap,
) -> Result<Option<Ref>, SyncError> {
    for uc in &ct.uniques {
        let wanted: Vec<Value> = uc
            .columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        if wanted.iter().all(Value::is_null) {
            continue;
        }
        let Some(existing_pk) = store::find_by_values(conn, ct, &uc.columns, &wanted)? else {
            continue;
        };
        if existing_pk == target.pk {
            continue;
        }
        let partner = Ref::new(target.type_id.clone(), existing_pk);
        if message::payload_get(payloads, &partner).is_some() {
            debug!("unique swap step between incoming {target} and local {partner}");
            return Ok(Some(partner));
        }
        return Err(SyncError::UniqueConflict {
            entries: vec![UniqueConflictEntry {
                content_type: ct.id.clone(),
                pk: existing_pk,
                columns: uc.columns.clone(),
            }],
        });
    }
    Ok(None)
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Settle multi-row value exchanges: group the pending swap steps into
/// connected components over shared refs, then per component drop every
/// involved row and reinsert final states from the message. Foreign-key
/// enforcement is deferred for the rest of the transaction so parent/child
/// rows can move in any order.
fn resolve_swaps(
    conn: &Connection,
    registry: &Registry,
    edges: &[(Ref, Ref)],
    deferred: &BTreeMap<Ref, Row>,
    payloads: &PayloadMap,
    stats: &mut MergeStats,
) -> Result<(), SyncError> {
    let mut index: BTreeMap<&Ref, usize> = BTreeMap::new();
    for (a, b) in edges {
        let next = index.len();
        index.entry(a).or_insert(next);
        let next = index.len();
        index.entry(b).or_insert(next);
    }
    let mut uf = UnionFind::new(index.len());
    for (a, b) in edges {
        uf.union(index[a], index[b]);
    }
    let mut components: BTreeMap<usize, Vec<&Ref>> = BTreeMap::new();
    for (r, i) in &index {
        components.entry(uf.find(*i)).or_default().push(*r);
    }

    conn.execute_batch("PRAGMA defer_foreign_keys = ON;")?;
    for members in components.values() {
        for &target in members {
            let ct = registry.get(&target.type_id)?;
            store::delete_row(conn, ct, target.pk)?;
        }
        for &target in members {
            let ct = registry.get(&target.type_id)?;
            let row = deferred
                .get(target)
                .or_else(|| message::payload_get(payloads, target))
                .ok_or_else(|| missing(target, Container::Msg))?;
            store::insert_row(conn, ct, row)
                .map_err(|e| e.into_integrity(&target.type_id, target.pk))?;
            stats.swap_rows += 1;
        }
    }
    debug!(
        "resolved {} unique swap component(s)",
        components.len()
    );
    Ok(())
}
