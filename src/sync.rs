use log::{debug, info, warn};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::SyncError;
use crate::merge::{self, LocalWins, MergePolicy, MergeStats};
use crate::message::{
    self, PullMessage, PullRequest, PushMessage, PushReply, RegisterReply, RepairMessage,
};
use crate::oplog::{self, Session};
use crate::registry::{self, Registry};
use crate::store;

/// Network surface the client drives. `http::HttpTransport` is the real
/// implementation; tests wire a `ServerEngine` in directly.
pub trait Transport {
    fn register(&self) -> Result<RegisterReply, SyncError>;
    fn push(&self, msg: &PushMessage) -> Result<PushReply, SyncError>;
    fn pull(&self, req: &PullRequest) -> Result<PullMessage, SyncError>;
    fn repair(&self) -> Result<RepairMessage, SyncError>;
}

/// The offline-capable side: captures application writes through
/// [`Session`], reconciles with the server via push/pull, and keeps its
/// scalar state (credentials, last known version) in `sync_kv`.
///
/// Push, pull and repair must not overlap application sessions on the same
/// connection; the caller serializes.
pub struct ClientEngine {
    conn: Connection,
    registry: Registry,
    policy: Box<dyn MergePolicy>,
}

fn kv_get(conn: &Connection, key: &str) -> Result<Option<String>, SyncError> {
    let v = conn
        .query_row("SELECT v FROM sync_kv WHERE k = ?1", params![key], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(v)
}

fn kv_set(conn: &Connection, key: &str, value: &str) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO sync_kv(k, v) VALUES(?1, ?2)
ON CONFLICT(k) DO UPDATE SET v=excluded.v",
        params![key, value],
    )?;
    Ok(())
}

impl ClientEngine {
    pub fn new(conn: Connection, registry: Registry) -> Result<Self, SyncError> {
        registry::create_all(&conn, &registry)?;
        Ok(Self {
            conn,
            registry,
            policy: Box::new(LocalWins),
        })
    }

    pub fn with_policy(mut self, policy: impl MergePolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Open a capturing transaction for application writes.
    pub fn session(&self) -> Result<Session<'_>, SyncError> {
        Session::begin(&self.conn, &self.registry)
    }

    pub fn last_known_version(&self) -> Result<i64, SyncError> {
        Ok(kv_get(&self.conn, "last_known_version")?
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0))
    }

    /// Whether this client currently holds credentials locally.
    pub fn isregistered(&self) -> Result<bool, SyncError> {
        Ok(kv_get(&self.conn, "node_id")?.is_some() && kv_get(&self.conn, "secret")?.is_some())
    }

    fn credentials(&self) -> Result<(i64, String), SyncError> {
        let node_id = kv_get(&self.conn, "node_id")?
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| SyncError::Auth("client holds no credentials; register first".into()))?;
        let secret = kv_get(&self.conn, "secret")?
            .ok_or_else(|| SyncError::Auth("client holds no credentials; register first".into()))?;
        Ok((node_id, secret))
    }

    /// Obtain fresh credentials from the server and store them. The last
    /// known version is preserved across re-registration.
    pub fn register<T: Transport>(&self, transport: &T) -> Result<i64, SyncError> {
        let reply = transport.register()?;
        let tx = self.conn.unchecked_transaction()?;
        kv_set(&tx, "node_id", &reply.node_id.to_string())?;
        kv_set(&tx, "secret", &reply.secret)?;
        if kv_get(&tx, "last_known_version")?.is_none() {
            kv_set(&tx, "last_known_version", "0")?;
        }
        tx.commit()?;
        info!("registered as node {}", reply.node_id);
        Ok(reply.node_id)
    }

    /// Send local changes to the server. Returns the assigned version, or
    /// `None` when the journal nets out to nothing.
    pub fn push<T: Transport>(&self, transport: &T) -> Result<Option<i64>, SyncError> {
        let (node_id, secret) = self.credentials()?;
        let (msg, warnings) = message::build_push(
            &self.conn,
            &self.registry,
            node_id,
            self.last_known_version()?,
            &secret,
        )?;
        for w in &warnings {
            warn!(
                "suspect journal run for {} ({:?}); possible pk reuse or untracked write",
                w.target, w.kinds
            );
        }
        if msg.operations.is_empty() {
            // net-nothing runs (insert then delete) still occupy the journal
            let tx = self.conn.unchecked_transaction()?;
            oplog::clear_unversioned(&tx)?;
            tx.commit()?;
            debug!("nothing to push");
            return Ok(None);
        }

        let reply = transport.push(&msg)?;
        let tx = self.conn.unchecked_transaction()?;
        oplog::clear_unversioned(&tx)?;
        kv_set(&tx, "last_known_version", &reply.latest_version.to_string())?;
        tx.commit()?;
        info!("push accepted as version {}", reply.latest_version);
        Ok(Some(reply.latest_version))
    }

    /// Fetch and merge everything newer than the last known version. The
    /// merge and the version advance share one transaction; a failed merge
    /// leaves the store, the journal and the version untouched.
    pub fn pull<T: Transport>(&self, transport: &T) -> Result<MergeStats, SyncError> {
        let (node_id, _) = self.credentials()?;
        let req = PullRequest {
            node_id,
            last_known_version: self.last_known_version()?,
            extra_data: None,
        };
        let msg = transport.pull(&req)?;

        let tx = self.conn.unchecked_transaction()?;
        // compressed batches do not preserve every original interleaving,
        // so foreign keys are checked at commit, not per operation
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")?;
        let stats = merge::merge(&tx, &self.registry, self.policy.as_ref(), &msg)?;
        kv_set(&tx, "last_known_version", &msg.latest_version.to_string())?;
        tx.commit()?;
        info!("pulled to version {}", msg.latest_version);
        Ok(stats)
    }

    /// Replace the local store wholesale with a server snapshot. The
    /// journal is wiped; unpushed local changes are lost by design.
    pub fn repair<T: Transport>(&self, transport: &T) -> Result<(), SyncError> {
        let snap = transport.repair()?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")?;
        for ct in self.registry.iter() {
            store::clear_table(&tx, ct)?;
        }
        for (type_id, rows) in &snap.tables {
            let ct = self.registry.get(type_id)?;
            for row in rows.values() {
                store::insert_row(&tx, ct, row)?;
            }
        }
        oplog::clear_all(&tx)?;
        kv_set(&tx, "last_known_version", &snap.latest_version.to_string())?;
        tx.commit()?;
        info!("repaired local store to version {}", snap.latest_version);
        Ok(())
    }

    /// The canonical loop: push; on divergence pull (merging) and retry.
    /// Unique-constraint conflicts propagate to the caller, who must
    /// resolve them by hand.
    pub fn sync<T: Transport>(&self, transport: &T, max_attempts: u32) -> Result<(), SyncError> {
        for _ in 0..max_attempts {
            match self.push(transport) {
                Ok(None) => {
                    self.pull(transport)?;
                    return Ok(());
                }
                Ok(Some(_)) => return Ok(()),
                Err(SyncError::PushRejected { client, server }) => {
                    debug!("push rejected ({client} < {server}); pulling before retry");
                    self.pull(transport)?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(SyncError::RetriesExhausted(max_attempts))
    }
}
