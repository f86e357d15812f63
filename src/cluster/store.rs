//! Raft-backed config store (§4.10).
//!
//! The storage layer is lifted almost unchanged from the teacher's
//! `raft::MemStorage` — same `openraft::storage::Adaptor` bridge from the v1
//! combined `RaftStorage` trait to the v2 split log/state-machine traits,
//! same watch-channel notification pattern. What changes is the payload:
//! `LoadTestRequest::SetConfig` becomes `ConfigCommand::Put`/`Delete` over an
//! in-memory key-value map instead of a single YAML blob.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{Adaptor, RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, BasicNode, Entry, LogId, LogState, RaftLogId, Snapshot, SnapshotMeta, StorageError,
    StoredMembership, TokioRuntime, Vote,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cluster::errors::{ClusterError, ClusterResult};
use crate::cluster::leader_forwarder::{LeaderForwarder, LeaderResolver};
use crate::cluster::peer_pool::{PeerDirectory, PeerPool};
use crate::cluster::raft_network::GrpcNetworkFactory;
use crate::cluster::tls::TlsHolder;

/// A single mutation to the replicated config map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigCommand {
    Put { key: String, value: String },
    Delete { key: String },
}

/// State machine response after applying a `ConfigCommand`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub ok: bool,
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = ConfigCommand,
        R            = ConfigResponse,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

/// Derive a stable u64 node ID from a human-readable string identifier.
pub fn node_id_from_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

/// Combined in-memory Raft storage: log entries + config map in one struct.
/// Wrapped by `Adaptor::new(store)` to produce the v2 split traits.
pub struct MemStorage {
    vote: Option<Vote<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    map: HashMap<String, String>,
    snapshot: Option<Snapshot<TypeConfig>>,
    /// Mirror of `map` that `ConfigStore::get` reads directly, so local
    /// reads never have to round-trip through Raft.
    shared_map: Arc<std::sync::RwLock<HashMap<String, String>>>,
}

impl MemStorage {
    pub fn new() -> (Self, Arc<std::sync::RwLock<HashMap<String, String>>>) {
        let shared_map = Arc::new(std::sync::RwLock::new(HashMap::new()));
        let storage = Self {
            vote: None,
            log: BTreeMap::new(),
            committed: None,
            last_purged: None,
            last_applied: None,
            last_membership: StoredMembership::default(),
            map: HashMap::new(),
            snapshot: None,
            shared_map: shared_map.clone(),
        };
        (storage, shared_map)
    }

    fn sync_shared_map(&self) {
        *self.shared_map.write().unwrap() = self.map.clone();
    }
}

impl RaftLogReader<TypeConfig> for MemStorage {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

pub struct MemLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for MemLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

pub struct MemSnapshotBuilder {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    map: HashMap<String, String>,
}

impl RaftSnapshotBuilder<TypeConfig> for MemSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let data = serde_json::to_vec(&self.map).unwrap_or_default();

        let snap_id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .to_string();

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id: snap_id,
            },
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for MemStorage {
    type LogReader = MemLogReader;
    type SnapshotBuilder = MemSnapshotBuilder;

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote)
    }

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = self.log.values().next_back().map(|e| *e.get_log_id());
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        MemLogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<ConfigResponse>, StorageError<NodeId>> {
        let mut responses = Vec::new();

        for entry in entries {
            self.last_applied = Some(*entry.get_log_id());

            match &entry.payload {
                openraft::EntryPayload::Blank => responses.push(ConfigResponse { ok: true }),
                openraft::EntryPayload::Normal(cmd) => {
                    match cmd {
                        ConfigCommand::Put { key, value } => {
                            self.map.insert(key.clone(), value.clone());
                        }
                        ConfigCommand::Delete { key } => {
                            self.map.remove(key);
                        }
                    }
                    responses.push(ConfigResponse { ok: true });
                }
                openraft::EntryPayload::Membership(m) => {
                    self.last_membership =
                        StoredMembership::new(Some(*entry.get_log_id()), m.clone());
                    responses.push(ConfigResponse { ok: true });
                }
            }
        }
        self.sync_shared_map();

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        MemSnapshotBuilder {
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            map: self.map.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let map: HashMap<String, String> =
            serde_json::from_slice(snapshot.get_ref()).unwrap_or_default();

        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        self.map = map;
        self.sync_shared_map();
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.snapshot.clone())
    }
}

/// Bootstrap shim breaking the cycle between "the peer pool needs Raft
/// membership" and "Raft needs the peer pool to dial peers": constructed
/// empty, handed to `PeerPool`/`LeaderForwarder` as their directory/resolver,
/// then populated with the real `Raft` instance once it exists. Mirrors the
/// `ArcSwap` hot-reload idiom used by `TlsHolder` and `jizhuozhi-hermes`.
#[derive(Clone)]
pub struct RaftHandle {
    inner: Arc<arc_swap::ArcSwapOption<RaftInstance>>,
    node_id: NodeId,
}

impl RaftHandle {
    pub fn empty(node_id: NodeId) -> Self {
        Self {
            inner: Arc::new(arc_swap::ArcSwapOption::empty()),
            node_id,
        }
    }

    fn set(&self, raft: Arc<RaftInstance>) {
        self.inner.store(Some(raft));
    }

    fn membership_nodes(&self) -> Vec<(NodeId, String)> {
        let Some(raft) = self.inner.load_full() else {
            return Vec::new();
        };
        raft.metrics()
            .borrow()
            .membership_config
            .membership()
            .nodes()
            .map(|(id, node)| (*id, node.addr.clone()))
            .collect()
    }
}

impl PeerDirectory for RaftHandle {
    fn peers(&self) -> Vec<(NodeId, String)> {
        self.membership_nodes()
    }

    fn self_id(&self) -> NodeId {
        self.node_id
    }
}

impl LeaderResolver for RaftHandle {
    fn leader_addr(&self) -> Option<String> {
        let raft = self.inner.load_full()?;
        let leader_id = raft.metrics().borrow().current_leader?;
        self.membership_nodes()
            .into_iter()
            .find(|(id, _)| *id == leader_id)
            .map(|(_, addr)| addr)
    }
}

/// Public façade over the Raft instance implementing §4.10's contract:
/// linearizable writes (forwarded to the leader when called on a follower),
/// reads served straight from the local FSM snapshot.
#[derive(Clone)]
pub struct ConfigStore {
    raft: Arc<RaftInstance>,
    node_id: NodeId,
    map: Arc<std::sync::RwLock<HashMap<String, String>>>,
    forwarder: Arc<LeaderForwarder>,
}

impl ConfigStore {
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    pub fn current_leader_id(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// The underlying Raft instance, for the cluster server's transport RPCs.
    pub fn raft(&self) -> &Arc<RaftInstance> {
        &self.raft
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Durable write: applies locally if leader, else forwards to the
    /// leader via `LeaderForwarder`. Returns once a quorum has committed.
    pub async fn put(&self, key: String, value: String) -> ClusterResult<()> {
        self.apply(ConfigCommand::Put { key, value }).await
    }

    pub async fn delete(&self, key: String) -> ClusterResult<()> {
        self.apply(ConfigCommand::Delete { key }).await
    }

    async fn apply(&self, cmd: ConfigCommand) -> ClusterResult<()> {
        if self.is_leader() {
            self.raft
                .client_write(cmd)
                .await
                .map(|_| ())
                .map_err(|e| ClusterError::Store(e.to_string()))
        } else if self.current_leader_id().is_some() {
            let payload =
                serde_json::to_vec(&cmd).map_err(|e| ClusterError::Store(e.to_string()))?;
            self.forwarder.forward(payload).await
        } else {
            Err(ClusterError::NoLeader)
        }
    }

    /// Read directly from the local FSM snapshot (no Raft round-trip).
    pub fn get(&self, key: &str) -> Option<String> {
        self.map.read().unwrap().get(key).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.map.read().unwrap().clone()
    }
}

/// Initialises and starts a Raft node plus the peer pool Raft traffic
/// shares with the forwarders and broadcaster. `peers` is `(node_id, addr)`
/// for every node including this one, used only to seed initial membership
/// on first boot — afterwards the Raft log is authoritative.
pub async fn start_raft_node(
    node_id: NodeId,
    cluster_name: String,
    peers: Vec<(NodeId, String)>,
    tls: Arc<TlsHolder>,
) -> (Arc<ConfigStore>, Arc<PeerPool>) {
    let config = Arc::new(
        openraft::Config {
            cluster_name,
            heartbeat_interval: 250,
            election_timeout_min: 2_000,
            election_timeout_max: 4_000,
            ..Default::default()
        }
        .validate()
        .expect("valid openraft config"),
    );

    let handle = RaftHandle::empty(node_id);
    let pool = PeerPool::new(tls.clone(), Arc::new(handle.clone()));
    let network_factory = GrpcNetworkFactory::new(pool.clone());
    let forwarder = LeaderForwarder::new(tls, Arc::new(handle.clone()));

    let (storage, map) = MemStorage::new();
    let (log_store, state_machine) = Adaptor::new(storage);

    let raft = Arc::new(
        openraft::Raft::new(node_id, config, network_factory, log_store, state_machine)
            .await
            .expect("failed to create Raft instance"),
    );
    handle.set(raft.clone());

    if !peers.is_empty() {
        let members: BTreeMap<NodeId, BasicNode> = peers
            .iter()
            .map(|(id, addr)| (*id, BasicNode { addr: addr.clone() }))
            .collect();

        let min_id = peers.iter().map(|(id, _)| *id).min().unwrap_or(node_id);
        if node_id == min_id {
            if let Err(e) = raft.initialize(members).await {
                info!(error = %e, "Raft already initialised (ignoring on restart)");
            }
        }
    }

    let store = Arc::new(ConfigStore {
        raft,
        node_id,
        map,
        forwarder,
    });
    (store, pool)
}
