//! Shared fixtures: in-memory filesystem and cloud fakes plus a tick
//! harness.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use driftsync_core::domain::{
    FileFingerprint, Fsid, LocalPath, NodeHandle, NodeKind, SyncConfig, SyncTag,
    VolumeFingerprint,
};
use driftsync_core::ports::{
    CloudClient, CloudNode, CloudOpStatus, FileHandle, Filesystem, FsError, MemoryTable,
    NewCloudFolder, StateTable, TransferSpec,
};
use driftsync_engine::cache::CachedNodeRow;
use driftsync_engine::{EngineContext, ScanService, Sync};
use sha2::{Digest, Sha256};

pub const ROOT: &str = "/sync";
pub const DEBRIS: &str = ".debris";
pub const CLOUD_ROOT: u64 = 1;

static TRACING: Once = Once::new();

/// Install a quiet subscriber once; raise the level when debugging a
/// failing scenario.
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .try_init();
    });
}

/// SHA-256 of `content`, matching what the scan service computes.
pub fn checksum(content: &[u8]) -> [u8; 32] {
    Sha256::digest(content).into()
}

/// Fingerprint of a file with `content` modified at `mtime`.
pub fn fingerprint(content: &[u8], mtime: i64) -> FileFingerprint {
    FileFingerprint::new(content.len() as u64, mtime, checksum(content))
}

// ============================================================================
// MockFilesystem
// ============================================================================

#[derive(Debug, Clone)]
struct FsEntry {
    kind: NodeKind,
    content: Vec<u8>,
    mtime: i64,
    fsid: u64,
    symlink: bool,
    blocked: bool,
}

#[derive(Debug, Default)]
struct FsInner {
    entries: BTreeMap<String, FsEntry>,
    case_sensitive: bool,
    list_calls: HashMap<String, usize>,
}

/// In-memory [`Filesystem`] with scriptable entries.
#[derive(Debug)]
pub struct MockFilesystem {
    inner: Mutex<FsInner>,
}

impl MockFilesystem {
    pub fn new(case_sensitive: bool) -> Arc<Self> {
        let fs = Arc::new(Self {
            inner: Mutex::new(FsInner {
                case_sensitive,
                ..FsInner::default()
            }),
        });
        fs.add_dir(ROOT, 1000);
        fs
    }

    pub fn add_dir(&self, path: &str, fsid: u64) {
        self.inner.lock().unwrap().entries.insert(
            path.to_string(),
            FsEntry {
                kind: NodeKind::Dir,
                content: Vec::new(),
                mtime: 0,
                fsid,
                symlink: false,
                blocked: false,
            },
        );
    }

    pub fn add_file(&self, path: &str, fsid: u64, mtime: i64, content: &[u8]) {
        self.inner.lock().unwrap().entries.insert(
            path.to_string(),
            FsEntry {
                kind: NodeKind::File,
                content: content.to_vec(),
                mtime,
                fsid,
                symlink: false,
                blocked: false,
            },
        );
    }

    pub fn add_blocked(&self, path: &str) {
        self.inner.lock().unwrap().entries.insert(
            path.to_string(),
            FsEntry {
                kind: NodeKind::Unknown,
                content: Vec::new(),
                mtime: 0,
                fsid: u64::MAX,
                symlink: false,
                blocked: true,
            },
        );
    }

    pub fn add_symlink(&self, path: &str, fsid: u64) {
        self.inner.lock().unwrap().entries.insert(
            path.to_string(),
            FsEntry {
                kind: NodeKind::File,
                content: Vec::new(),
                mtime: 0,
                fsid,
                symlink: true,
                blocked: false,
            },
        );
    }

    pub fn remove(&self, path: &str) {
        let mut inner = self.inner.lock().unwrap();
        let prefix = format!("{path}/");
        inner
            .entries
            .retain(|k, _| k != path && !k.starts_with(&prefix));
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.lock().unwrap().entries.contains_key(path)
    }

    /// Paths currently under `dir` (any depth).
    pub fn paths_under(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{dir}/");
        self.inner
            .lock()
            .unwrap()
            .entries
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn list_calls(&self, path: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .list_calls
            .get(path)
            .copied()
            .unwrap_or(0)
    }
}

struct MockHandle {
    kind: NodeKind,
    size: u64,
    mtime: i64,
    fsid: u64,
    symlink: bool,
    content: std::io::Cursor<Vec<u8>>,
}

impl Read for MockHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.content.read(buf)
    }
}

impl FileHandle for MockHandle {
    fn kind(&self) -> NodeKind {
        self.kind
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn mtime(&self) -> i64 {
        self.mtime
    }
    fn fsid(&self) -> Fsid {
        Fsid::new(self.fsid)
    }
    fn is_symlink(&self) -> bool {
        self.symlink
    }
}

impl Filesystem for MockFilesystem {
    fn open(&self, path: &LocalPath) -> Result<Box<dyn FileHandle>, FsError> {
        let inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get(&path.to_string())
            .ok_or_else(|| FsError::not_found(format!("no entry: {path}")))?;
        if entry.blocked {
            return Err(FsError::transient(format!("blocked: {path}")));
        }
        Ok(Box::new(MockHandle {
            kind: entry.kind,
            size: entry.content.len() as u64,
            mtime: entry.mtime,
            fsid: entry.fsid,
            symlink: entry.symlink,
            content: std::io::Cursor::new(entry.content.clone()),
        }))
    }

    fn list_dir(&self, path: &LocalPath, _follow: bool) -> Result<Vec<String>, FsError> {
        let mut inner = self.inner.lock().unwrap();
        let key = path.to_string();
        match inner.entries.get(&key) {
            Some(e) if e.kind.is_dir() => {}
            Some(_) => return Err(FsError::permanent(format!("not a directory: {path}"))),
            None => return Err(FsError::not_found(format!("no entry: {path}"))),
        }
        *inner.list_calls.entry(key.clone()).or_insert(0) += 1;

        let prefix = format!("{key}/");
        let names = inner
            .entries
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect();
        Ok(names)
    }

    fn shortname(&self, _path: &LocalPath) -> Option<String> {
        None
    }

    fn rename(&self, from: &LocalPath, to: &LocalPath) -> Result<(), FsError> {
        let mut inner = self.inner.lock().unwrap();
        let from_key = from.to_string();
        let to_key = to.to_string();
        if inner.entries.contains_key(&to_key) {
            return Err(FsError::already_exists(format!("target exists: {to}")));
        }
        if !inner.entries.contains_key(&from_key) {
            return Err(FsError::not_found(format!("no entry: {from}")));
        }
        let from_prefix = format!("{from_key}/");
        let moved: Vec<(String, FsEntry)> = inner
            .entries
            .iter()
            .filter(|(k, _)| *k == &from_key || k.starts_with(&from_prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, _) in &moved {
            inner.entries.remove(k);
        }
        for (k, v) in moved {
            let new_key = format!("{to_key}{}", &k[from_key.len()..]);
            inner.entries.insert(new_key, v);
        }
        Ok(())
    }

    fn mkdir(&self, path: &LocalPath) -> Result<(), FsError> {
        let mut inner = self.inner.lock().unwrap();
        let key = path.to_string();
        if inner.entries.contains_key(&key) {
            return Err(FsError::already_exists(format!("exists: {path}")));
        }
        let fsid = 90_000 + inner.entries.len() as u64;
        inner.entries.insert(
            key,
            FsEntry {
                kind: NodeKind::Dir,
                content: Vec::new(),
                mtime: 0,
                fsid,
                symlink: false,
                blocked: false,
            },
        );
        Ok(())
    }

    fn exists(&self, path: &LocalPath) -> bool {
        self.inner
            .lock()
            .unwrap()
            .entries
            .contains_key(&path.to_string())
    }

    fn volume_fingerprint(&self, _path: &LocalPath) -> Option<VolumeFingerprint> {
        Some(VolumeFingerprint::new(0xD1))
    }

    fn fsids_are_stable(&self, _path: &LocalPath) -> bool {
        true
    }

    fn is_case_sensitive(&self, _path: &LocalPath) -> bool {
        self.inner.lock().unwrap().case_sensitive
    }
}

// ============================================================================
// MockCloud
// ============================================================================

/// A command the engine issued against the cloud.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetAttr {
        node: u64,
        name: String,
    },
    Rename {
        node: u64,
        new_parent: u64,
        new_name: Option<String>,
    },
    PutNodes {
        parent: u64,
        names: Vec<String>,
    },
    Transfer(TransferSpec),
    SyncDebris {
        node: u64,
    },
}

#[derive(Debug, Clone)]
struct CloudRecord {
    parent: u64,
    name: String,
    kind: NodeKind,
    fingerprint: FileFingerprint,
    pending: bool,
}

#[derive(Debug)]
enum QueuedMutation {
    SetName { node: u64, name: String },
    Reparent { node: u64, parent: u64, name: Option<String> },
    CreateFolder { parent: u64, name: String },
    Remove { node: u64 },
}

#[derive(Debug, Default)]
struct CloudInner {
    nodes: HashMap<u64, CloudRecord>,
    commands: Vec<Command>,
    queued: Vec<QueuedMutation>,
    next_handle: u64,
}

/// In-memory [`CloudClient`]. Commands queue mutations and mark the
/// touched node pending; [`MockCloud::apply_pending`] plays the
/// mutations back, standing in for server action packets.
#[derive(Debug)]
pub struct MockCloud {
    inner: Mutex<CloudInner>,
}

impl MockCloud {
    pub fn new() -> Arc<Self> {
        let cloud = Arc::new(Self {
            inner: Mutex::new(CloudInner {
                next_handle: 10_000,
                ..CloudInner::default()
            }),
        });
        cloud.add_dir(CLOUD_ROOT, 0, "root");
        cloud
    }

    pub fn add_dir(&self, handle: u64, parent: u64, name: &str) {
        self.inner.lock().unwrap().nodes.insert(
            handle,
            CloudRecord {
                parent,
                name: name.to_string(),
                kind: NodeKind::Dir,
                fingerprint: FileFingerprint::invalid(),
                pending: false,
            },
        );
    }

    pub fn add_file(&self, handle: u64, parent: u64, name: &str, fingerprint: FileFingerprint) {
        self.inner.lock().unwrap().nodes.insert(
            handle,
            CloudRecord {
                parent,
                name: name.to_string(),
                kind: NodeKind::File,
                fingerprint,
                pending: false,
            },
        );
    }

    pub fn remove_node(&self, handle: u64) {
        self.inner.lock().unwrap().nodes.remove(&handle);
    }

    /// Play back queued mutations (the "action packets") and clear
    /// pending flags.
    pub fn apply_pending(&self) {
        let mut inner = self.inner.lock().unwrap();
        let queued = std::mem::take(&mut inner.queued);
        for mutation in queued {
            match mutation {
                QueuedMutation::SetName { node, name } => {
                    if let Some(record) = inner.nodes.get_mut(&node) {
                        record.name = name;
                    }
                }
                QueuedMutation::Reparent { node, parent, name } => {
                    if let Some(record) = inner.nodes.get_mut(&node) {
                        record.parent = parent;
                        if let Some(name) = name {
                            record.name = name;
                        }
                    }
                }
                QueuedMutation::CreateFolder { parent, name } => {
                    inner.next_handle += 1;
                    let handle = inner.next_handle;
                    inner.nodes.insert(
                        handle,
                        CloudRecord {
                            parent,
                            name,
                            kind: NodeKind::Dir,
                            fingerprint: FileFingerprint::invalid(),
                            pending: false,
                        },
                    );
                }
                QueuedMutation::Remove { node } => {
                    let mut doomed = vec![node];
                    while let Some(handle) = doomed.pop() {
                        inner.nodes.remove(&handle);
                        let children: Vec<u64> = inner
                            .nodes
                            .iter()
                            .filter(|(_, r)| r.parent == handle)
                            .map(|(&h, _)| h)
                            .collect();
                        doomed.extend(children);
                    }
                }
            }
        }
        for record in inner.nodes.values_mut() {
            record.pending = false;
        }
    }

    pub fn commands(&self) -> Vec<Command> {
        self.inner.lock().unwrap().commands.clone()
    }

    pub fn count_commands(&self, pred: impl Fn(&Command) -> bool) -> usize {
        self.commands().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, handle: u64) -> Option<CloudRecord> {
        self.inner.lock().unwrap().nodes.get(&handle).cloned()
    }

    fn snapshot(&self, handle: u64, record: &CloudRecord) -> CloudNode {
        CloudNode {
            handle: NodeHandle::new(handle),
            parent: NodeHandle::new(record.parent),
            name: record.name.clone(),
            kind: record.kind,
            fingerprint: record.fingerprint,
            has_pending_commands: record.pending,
        }
    }
}

impl CloudClient for MockCloud {
    fn node_by_handle(&self, handle: NodeHandle) -> Option<CloudNode> {
        if handle.is_undef() {
            return None;
        }
        let record = self.record(handle.as_u64())?;
        Some(self.snapshot(handle.as_u64(), &record))
    }

    fn children_of(&self, parent: NodeHandle) -> Vec<CloudNode> {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .iter()
            .filter(|(_, r)| r.parent == parent.as_u64())
            .map(|(&h, r)| self.snapshot_locked(h, r))
            .collect()
    }

    fn rename(
        &self,
        node: NodeHandle,
        new_parent: NodeHandle,
        new_name: Option<&str>,
    ) -> CloudOpStatus {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.push(Command::Rename {
            node: node.as_u64(),
            new_parent: new_parent.as_u64(),
            new_name: new_name.map(str::to_string),
        });
        inner.queued.push(QueuedMutation::Reparent {
            node: node.as_u64(),
            parent: new_parent.as_u64(),
            name: new_name.map(str::to_string),
        });
        if let Some(record) = inner.nodes.get_mut(&node.as_u64()) {
            record.pending = true;
        }
        CloudOpStatus::Ok
    }

    fn set_attributes(&self, node: NodeHandle, new_name: &str) -> CloudOpStatus {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.push(Command::SetAttr {
            node: node.as_u64(),
            name: new_name.to_string(),
        });
        inner.queued.push(QueuedMutation::SetName {
            node: node.as_u64(),
            name: new_name.to_string(),
        });
        if let Some(record) = inner.nodes.get_mut(&node.as_u64()) {
            record.pending = true;
        }
        CloudOpStatus::Ok
    }

    fn put_nodes(&self, parent: NodeHandle, folders: Vec<NewCloudFolder>) {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.push(Command::PutNodes {
            parent: parent.as_u64(),
            names: folders.iter().map(|f| f.name.clone()).collect(),
        });
        for folder in folders {
            inner.queued.push(QueuedMutation::CreateFolder {
                parent: parent.as_u64(),
                name: folder.name,
            });
        }
        if let Some(record) = inner.nodes.get_mut(&parent.as_u64()) {
            record.pending = true;
        }
    }

    fn start_transfer(&self, spec: TransferSpec) {
        self.inner
            .lock()
            .unwrap()
            .commands
            .push(Command::Transfer(spec));
    }

    fn move_to_sync_debris(&self, node: NodeHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.push(Command::SyncDebris {
            node: node.as_u64(),
        });
        inner.queued.push(QueuedMutation::Remove {
            node: node.as_u64(),
        });
        if let Some(record) = inner.nodes.get_mut(&node.as_u64()) {
            record.pending = true;
        }
    }
}

impl MockCloud {
    fn snapshot_locked(&self, handle: u64, record: &CloudRecord) -> CloudNode {
        CloudNode {
            handle: NodeHandle::new(handle),
            parent: NodeHandle::new(record.parent),
            name: record.name.clone(),
            kind: record.kind,
            fingerprint: record.fingerprint,
            has_pending_commands: record.pending,
        }
    }
}

// ============================================================================
// Cache seeding
// ============================================================================

/// One pre-seeded synced node for the state table.
pub struct SeedNode {
    pub parent: u32,
    pub local_name: &'static str,
    pub kind: NodeKind,
    pub fsid: u64,
    pub handle: u64,
    pub fingerprint: Option<FileFingerprint>,
}

/// Build a state table holding `nodes`, returning the table and the
/// row id assigned to each node (in input order).
pub fn seed_table(nodes: &[SeedNode]) -> (Box<MemoryTable>, Vec<u32>) {
    let mut table = MemoryTable::new();
    let mut ids = Vec::new();
    for node in nodes {
        let fp = node.fingerprint.unwrap_or_else(FileFingerprint::invalid);
        let row = CachedNodeRow {
            parent_db_id: node.parent,
            local_name: node.local_name.to_string(),
            shortname: None,
            shortname_recorded: true,
            kind: node.kind,
            fsid: Fsid::new(node.fsid),
            mtime: fp.mtime,
            size: fp.size,
            checksum: fp.valid.then_some(fp.checksum),
            synced_handle: NodeHandle::new(node.handle),
        };
        let id = table.next_id();
        table
            .put(id, &serde_json::to_vec(&row).unwrap())
            .expect("seed row");
        ids.push(id.as_u32());
    }
    (Box::new(table), ids)
}

// ============================================================================
// Harness
// ============================================================================

/// Ticks a sync against the fakes with a controllable clock.
pub struct Harness {
    pub fs: Arc<MockFilesystem>,
    pub cloud: Arc<MockCloud>,
    pub sync: Sync,
    pub ctx: EngineContext,
    pub now_ds: u64,
    pub tick_ds: u64,
}

impl Harness {
    pub fn new(
        fs: Arc<MockFilesystem>,
        cloud: Arc<MockCloud>,
        table: Option<Box<MemoryTable>>,
    ) -> Self {
        init_tracing();
        let config = SyncConfig::new(
            SyncTag::new(1),
            LocalPath::from(ROOT),
            NodeHandle::new(CLOUD_ROOT),
        );
        let fs_port: Arc<dyn Filesystem> = fs.clone();
        let cloud_port: Arc<dyn CloudClient> = cloud.clone();
        let table_port: Option<Box<dyn StateTable>> = match table {
            Some(t) => Some(t),
            None => None,
        };
        let scan_service = ScanService::new(1);
        let sync = Sync::new(
            config,
            DEBRIS,
            false,
            fs_port,
            cloud_port,
            scan_service,
            table_port,
        )
        .expect("sync construction");

        Self {
            fs,
            cloud,
            sync,
            ctx: EngineContext::new(),
            now_ds: 100,
            tick_ds: 25,
        }
    }

    /// One engine tick at the current clock, then advance it.
    pub fn tick(&mut self) -> bool {
        self.ctx
            .begin_tick(self.now_ds, (self.now_ds / 10) as i64);
        let synced = self.sync.tick(&mut self.ctx);
        self.ctx.end_tick();
        self.now_ds += self.tick_ds;
        synced
    }

    /// Tick until quiescent (or `max` ticks), applying cloud action
    /// packets between ticks and giving the scan worker time to run.
    pub fn settle(&mut self, max: usize) -> bool {
        let mut synced = false;
        for _ in 0..max {
            synced = self.tick();
            self.cloud.apply_pending();
            self.wait_for_scan();
            if synced && self.ctx.flags.scans_and_moves_complete {
                break;
            }
        }
        synced
    }

    /// Give an in-flight background scan a chance to finish.
    pub fn wait_for_scan(&self) {
        if !self.sync.scan_pending() {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if self.sync.wake_cookie().take_signal() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Child node of the tree root with this cloud-canonical name.
    pub fn root_child(&self, name: &str) -> Option<driftsync_engine::tree::NodeId> {
        let tree = self.sync.tree();
        tree.child_by_name(tree.root(), name)
    }
}
