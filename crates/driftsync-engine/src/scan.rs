//! Scan service
//!
//! A process-wide, lazily started pool of worker threads that turns
//! "scan this directory" requests into batches of [`FsNode`]
//! snapshots. The reconciler submits a request and keeps ticking; a
//! worker enumerates the directory off-thread and flips the request to
//! completed, waking the owner through a weak cookie.
//!
//! Workers never touch `LocalNode`s. A request carries everything the
//! worker needs by value: the target path, the debris path to skip,
//! the follow-symlinks flag, and a `known` map of the directory's
//! previously scanned children so unchanged files keep their
//! fingerprint instead of being re-hashed.
//!
//! ## Lifecycle
//!
//! The pool is reference counted: the first [`ScanService`] in the
//! process starts the worker threads, the last one to drop joins them.
//! Shutdown uses a sentinel entry in the request deque so every worker
//! wakes, sees it, and exits without consuming it.

use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use driftsync_core::domain::{FileFingerprint, FsNode, Fsid, LocalPath, NodeKind};
use driftsync_core::ports::Filesystem;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

// One worker thread by default; hosts with big trees can size up.
const DEFAULT_THREADS: usize = 1;

static WORKER: Mutex<Weak<Worker>> = Mutex::new(Weak::new());

// ============================================================================
// ScanCookie
// ============================================================================

/// Wake signal from worker to owner.
///
/// The worker holds only a weak reference: if the owning sync is torn
/// down mid-scan, completion is delivered to nobody and the request's
/// results are dropped with it.
#[derive(Debug, Default)]
pub struct ScanCookie {
    signalled: AtomicBool,
}

impl ScanCookie {
    /// Create a cookie for a sync.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Worker side: signal completion.
    fn completed(&self) {
        self.signalled.store(true, Ordering::Release);
    }

    /// Owner side: consume the signal if one is pending.
    pub fn take_signal(&self) -> bool {
        self.signalled.swap(false, Ordering::AcqRel)
    }
}

// ============================================================================
// ScanRequest
// ============================================================================

/// One in-flight directory scan.
///
/// Carries everything the worker needs by value, including the
/// filesystem to enumerate with - the pool itself is shared across
/// every sync in the process and holds no per-sync state.
pub struct ScanRequest {
    cookie: Weak<ScanCookie>,
    fs: Arc<dyn Filesystem>,
    target_path: LocalPath,
    debris_path: LocalPath,
    follow_symlinks: bool,
    known: Mutex<HashMap<String, FsNode>>,
    completed: AtomicBool,
    results: Mutex<Vec<FsNode>>,
}

impl ScanRequest {
    /// True once the worker has published results.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// The directory this request scans.
    #[must_use]
    pub fn target_path(&self) -> &LocalPath {
        &self.target_path
    }

    /// Take the results. Valid only after [`ScanRequest::completed`].
    #[must_use]
    pub fn take_results(&self) -> Vec<FsNode> {
        std::mem::take(&mut self.results.lock().expect("scan results poisoned"))
    }
}

impl std::fmt::Debug for ScanRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanRequest")
            .field("target_path", &self.target_path)
            .field("completed", &self.completed())
            .finish()
    }
}

// ============================================================================
// ScanService
// ============================================================================

/// Handle to the process-wide scan pool.
#[derive(Clone)]
pub struct ScanService {
    worker: Arc<Worker>,
}

impl ScanService {
    /// Get a handle, starting the pool if this is the first service in
    /// the process. The first caller's thread count wins; later
    /// callers share the running pool.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let mut guard = WORKER.lock().expect("scan worker registry poisoned");
        if let Some(worker) = guard.upgrade() {
            return Self { worker };
        }
        let worker = Arc::new(Worker::start(threads.max(1)));
        *guard = Arc::downgrade(&worker);
        Self { worker }
    }

    /// Convenience constructor with the default pool size.
    #[must_use]
    pub fn with_default_threads() -> Self {
        Self::new(DEFAULT_THREADS)
    }

    /// Queue a scan of `target_path` on `fs`.
    ///
    /// `known` maps child names to their previous snapshots, letting
    /// the worker reuse fingerprints for unchanged files. A request
    /// for a path inside the debris completes immediately with no
    /// results.
    #[must_use]
    pub fn scan(
        &self,
        cookie: &Arc<ScanCookie>,
        fs: Arc<dyn Filesystem>,
        target_path: LocalPath,
        debris_path: LocalPath,
        follow_symlinks: bool,
        known: HashMap<String, FsNode>,
    ) -> Arc<ScanRequest> {
        let inside_debris = debris_path.is_containing_path_of(&target_path);

        let request = Arc::new(ScanRequest {
            cookie: Arc::downgrade(cookie),
            fs,
            target_path,
            debris_path,
            follow_symlinks,
            known: Mutex::new(known),
            completed: AtomicBool::new(inside_debris),
            results: Mutex::new(Vec::new()),
        });

        // Don't bother scanning the debris.
        if !inside_debris {
            debug!(path = %request.target_path, "queuing scan");
            self.worker.queue(Arc::clone(&request));
        }

        request
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Shared {
    // None is the shutdown sentinel; it stays at the front so every
    // worker sees it.
    pending: Mutex<VecDeque<Option<Arc<ScanRequest>>>>,
    available: Condvar,
}

struct Worker {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    fn start(num_threads: usize) -> Self {
        debug!(threads = num_threads, "starting scan workers");
        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("driftsync-scan-{i}"))
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn scan worker");
            threads.push(handle);
        }

        Self {
            shared,
            threads: Mutex::new(threads),
        }
    }

    fn queue(&self, request: Arc<ScanRequest>) {
        {
            let mut pending = self.shared.pending.lock().expect("scan queue poisoned");
            pending.push_back(Some(request));
        }
        self.shared.available.notify_one();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        debug!("stopping scan workers");
        {
            let mut pending = self.shared.pending.lock().expect("scan queue poisoned");
            pending.push_front(None);
        }
        self.shared.available.notify_all();

        let threads = std::mem::take(&mut *self.threads.lock().expect("threads poisoned"));
        for handle in threads {
            let _ = handle.join();
        }
        debug!("scan workers stopped");
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let request = {
            let mut pending = shared.pending.lock().expect("scan queue poisoned");
            loop {
                match pending.front() {
                    // Sentinel: leave it in place for sibling workers.
                    Some(None) => return,
                    Some(Some(_)) => break,
                    None => {
                        pending = shared
                            .available
                            .wait(pending)
                            .expect("scan queue poisoned");
                    }
                }
            }
            pending
                .pop_front()
                .flatten()
                .expect("non-sentinel entry expected")
        };

        debug!(path = %request.target_path, "scanning directory");
        run_scan(request.fs.as_ref(), &request);
        request.completed.store(true, Ordering::Release);
        debug!(path = %request.target_path, "scan complete");

        if let Some(cookie) = request.cookie.upgrade() {
            cookie.completed();
        } else {
            debug!(path = %request.target_path, "scan owner gone, discarding results");
        }
    }
}

fn run_scan(fs: &dyn Filesystem, request: &ScanRequest) {
    // Target missing or not a directory: empty result set, completed.
    let target = match fs.open(&request.target_path) {
        Ok(handle) => handle,
        Err(e) => {
            debug!(path = %request.target_path, error = %e, "scan target does not exist");
            return;
        }
    };
    if target.kind() != NodeKind::Dir {
        debug!(path = %request.target_path, "scan target is not a directory");
        return;
    }

    let names = match fs.list_dir(&request.target_path, request.follow_symlinks) {
        Ok(names) => names,
        Err(e) => {
            debug!(path = %request.target_path, error = %e, "unable to iterate scan target");
            return;
        }
    };

    let known = std::mem::take(&mut *request.known.lock().expect("known map poisoned"));
    let mut results = Vec::with_capacity(names.len());

    for name in names {
        let path = request.target_path.append_name(&name);
        if request.debris_path.is_containing_path_of(&path) {
            continue;
        }
        results.push(interrogate(fs, name, &path, &known));
    }

    *request.results.lock().expect("scan results poisoned") = results;
}

/// Learn everything we can about one directory entry.
fn interrogate(
    fs: &dyn Filesystem,
    name: String,
    path: &LocalPath,
    known: &HashMap<String, FsNode>,
) -> FsNode {
    let mut handle = match fs.open(path) {
        Ok(handle) => handle,
        Err(e) => {
            warn!(path = %path, error = %e, "error opening file");
            let blocked = e.is_transient();
            if blocked {
                warn!(path = %path, "file blocked");
            }
            return FsNode::unreadable(name, blocked);
        }
    };

    let mut result = FsNode {
        local_name: name.clone(),
        name: name.clone(),
        kind: handle.kind(),
        size: handle.size(),
        mtime: handle.mtime(),
        fsid: handle.fsid(),
        shortname: fs.shortname(path),
        is_symlink: handle.is_symlink(),
        is_blocked: false,
        fingerprint: FileFingerprint::invalid(),
    };

    if result.is_symlink {
        debug!(path = %path, "interrogated path is a symlink");
    }

    // No need to fingerprint directories.
    if result.kind.is_dir() {
        return result;
    }

    if let Some(prior) = known.get(&name) {
        if reuse_fingerprint(prior, &result) {
            result.fingerprint = prior.fingerprint;
            return result;
        }
    }

    match fingerprint_content(&mut *handle, result.size, result.mtime) {
        Ok(fp) => result.fingerprint = fp,
        Err(e) => {
            warn!(path = %path, error = %e, "error fingerprinting file");
            result.kind = NodeKind::Unknown;
            result.fsid = Fsid::UNDEF;
            result.is_blocked = true;
        }
    }

    result
}

/// A prior snapshot's fingerprint is reusable when type, fsid, mtime
/// and size all still match.
fn reuse_fingerprint(prior: &FsNode, current: &FsNode) -> bool {
    prior.kind == current.kind
        && prior.fsid == current.fsid
        && prior.mtime == current.mtime
        && prior.size == current.size
        && prior.fingerprint.valid
}

fn fingerprint_content(
    reader: &mut dyn Read,
    size: u64,
    mtime: i64,
) -> std::io::Result<FileFingerprint> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest: [u8; 32] = hasher.finalize().into();
    Ok(FileFingerprint::new(size, mtime, digest))
}

// ============================================================================
// Tests
// ============================================================================
