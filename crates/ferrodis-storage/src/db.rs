//! Database handle
//!
//! [`Db`] guards the [`Engine`] of one logical database with a read/write
//! lock. Commands hold the lock in shared mode for their whole duration; the
//! exclusive mode is only taken to swap in a restored checkpoint and to
//! close. The handle also owns the background task queue and the worker
//! thread that runs small compactions.

use crate::cf::META;
use crate::checkpoint::{CheckpointManifest, sync_dir};
use crate::error::{Error, Result, StatusKind};
use crate::instance::{DATA_FILE, Engine};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use ferrodis_common::{BgTask, StorageOptions};
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use tempfile::NamedTempFile;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often the worker wakes up to check for shutdown
const WORKER_TICK: Duration = Duration::from_millis(100);

/// Suffix of the staged copy while a checkpoint is being loaded
const RESTORE_SUFFIX: &str = ".restore";

/// Suffix of the replaced data file until the restored one has opened
const PREVIOUS_SUFFIX: &str = ".previous";

type SharedEngine = Arc<RwLock<Option<Engine>>>;

pub struct Db {
    index: usize,
    path: PathBuf,
    options: StorageOptions,
    engine: SharedEngine,
    tasks: Sender<BgTask>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Db {
    /// Open the database under `path` and start its background worker
    pub fn open(options: StorageOptions, index: usize, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (tasks, receiver) = bounded(options.bg_queue_capacity.max(1));
        let engine = Engine::open(&options, index, &path, tasks.clone())?;

        let db = Self {
            index,
            path,
            options,
            engine: Arc::new(RwLock::new(Some(engine))),
            tasks,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        };
        db.start_worker(receiver);
        Ok(db)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared access to the engine; `Busy` once the handle is closed
    pub fn engine(&self) -> Result<MappedRwLockReadGuard<'_, Engine>> {
        RwLockReadGuard::try_map(self.engine.read(), Option::as_ref)
            .map_err(|_| Error::busy(format!("db{} is closed", self.index)))
    }

    pub fn is_open(&self) -> bool {
        self.engine.read().is_some()
    }

    /// Queue a background task. A full queue drops the task.
    pub fn add_bg_task(&self, task: BgTask) -> bool {
        match self.tasks.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(task)) => {
                warn!("db{}: background queue full, dropping {:?}", self.index, task);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn create_checkpoint(&self, dir: impl AsRef<Path>, sync: bool) -> Result<CheckpointManifest> {
        self.engine()?.create_checkpoint(dir, sync)
    }

    /// Replace the database contents with a checkpoint.
    ///
    /// The checkpoint file is copied to a private staging file next to the
    /// live one and opened once to make sure it is a readable database. Only
    /// then, under the exclusive lock, is the current engine dropped, the live
    /// file moved aside and the staged file renamed into place. Readers see
    /// the old engine or the new one, never a mix. If the new engine fails to
    /// open the previous file is moved back and reopened.
    pub fn load_from_checkpoint(&self, dir: impl AsRef<Path>, sync: bool) -> Result<()> {
        let dir = dir.as_ref();
        let manifest = CheckpointManifest::load(dir)?;
        let started = Instant::now();

        let staged = self.stage_checkpoint(dir, sync)?;

        if let Ok(engine) = self.engine() {
            engine.cancel_background_work();
        }

        let mut slot = self.engine.write();
        drop(slot.take());
        match self.swap_in(staged, sync) {
            Ok(engine) => {
                *slot = Some(engine);
                info!(
                    "db{} restored from checkpoint {:?} (taken at {} ms) in {:?}",
                    self.index,
                    dir,
                    manifest.created_at_ms,
                    started.elapsed()
                );
                Ok(())
            }
            Err(e) => {
                error!("db{} failed to load checkpoint {:?}: {}", self.index, dir, e);
                match self.reopen_previous() {
                    Ok(engine) => *slot = Some(engine),
                    Err(reopen) => error!("db{} failed to reopen previous data: {}", self.index, reopen),
                }
                Err(e)
            }
        }
    }

    fn previous_path(&self) -> PathBuf {
        self.path.join(format!("{DATA_FILE}{PREVIOUS_SUFFIX}"))
    }

    /// Copy the checkpoint file into a uniquely named file beside the live
    /// one and check that it opens
    fn stage_checkpoint(&self, dir: &Path, sync: bool) -> Result<NamedTempFile> {
        let mut staged = tempfile::Builder::new()
            .prefix(DATA_FILE)
            .suffix(RESTORE_SUFFIX)
            .tempfile_in(&self.path)?;
        std::io::copy(&mut File::open(dir.join(DATA_FILE))?, staged.as_file_mut())?;
        if sync {
            staged.as_file().sync_all()?;
        }

        let check = redb::Database::open(staged.path())?;
        check.begin_read()?.open_table(META)?;
        Ok(staged)
    }

    /// Move the live file aside, rename `staged` into place and open it
    fn swap_in(&self, staged: NamedTempFile, sync: bool) -> Result<Engine> {
        let live = self.path.join(DATA_FILE);
        std::fs::rename(&live, self.previous_path())?;
        staged.persist(&live).map_err(|e| Error::from(e.error))?;
        if sync {
            sync_dir(&self.path)?;
        }
        let engine = Engine::open(&self.options, self.index, &self.path, self.tasks.clone())?;
        if let Err(e) = std::fs::remove_file(self.previous_path()) {
            warn!("db{}: failed to remove previous data file: {}", self.index, e);
        }
        Ok(engine)
    }

    /// Put the file moved aside by [`Db::swap_in`] back and open it
    fn reopen_previous(&self) -> Result<Engine> {
        let previous = self.previous_path();
        if previous.exists() {
            std::fs::rename(&previous, self.path.join(DATA_FILE))?;
        }
        Engine::open(&self.options, self.index, &self.path, self.tasks.clone())
    }

    fn start_worker(&self, receiver: Receiver<BgTask>) {
        let engine = Arc::clone(&self.engine);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.options.compaction_interval();
        let index = self.index;

        let handle = thread::Builder::new()
            .name(format!("ferrodis-bg-{index}"))
            .spawn(move || run_worker(index, engine, receiver, shutdown, interval));
        match handle {
            Ok(handle) => *self.worker.lock() = Some(handle),
            Err(e) => error!("db{index}: failed to start background worker: {e}"),
        }
    }

    /// Stop the worker and release the engine
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(engine) = self.engine.read().as_ref() {
            engine.cancel_background_work();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        if self.engine.write().take().is_some() {
            debug!("db{} closed", self.index);
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker(
    index: usize,
    engine: SharedEngine,
    receiver: Receiver<BgTask>,
    shutdown: Arc<AtomicBool>,
    interval: Option<Duration>,
) {
    info!("db{index}: background worker started");
    let mut last_auto = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        match receiver.recv_timeout(WORKER_TICK) {
            Ok(task) => run_task(index, &engine, &task),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Some(interval) = interval {
            if last_auto.elapsed() >= interval {
                last_auto = Instant::now();
                let guard = engine.read();
                if let Some(engine) = guard.as_ref() {
                    match engine.auto_compact() {
                        Ok(report) => debug!(
                            "db{index}: periodic compaction dropped {} records",
                            report.dropped()
                        ),
                        Err(e) => record_failure(index, engine, "periodic compaction", &e),
                    }
                }
            }
        }
    }
    info!("db{index}: background worker stopped");
}

fn run_task(index: usize, engine: &SharedEngine, task: &BgTask) {
    let guard = engine.read();
    let Some(engine) = guard.as_ref() else {
        return;
    };
    match engine.run_bg_task(task) {
        Ok(report) => debug!(
            "db{index}: {:?} on {} dropped {} records",
            task.operation,
            task.data_type,
            report.dropped()
        ),
        Err(e) => record_failure(index, engine, "background task", &e),
    }
}

fn record_failure(index: usize, engine: &Engine, what: &str, e: &Error) {
    if e.kind() == StatusKind::Busy {
        debug!("db{index}: {what} canceled");
        return;
    }
    engine.background_errors.fetch_add(1, Ordering::Relaxed);
    error!("db{index}: {what} failed: {e}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrodis_common::DataType;
    use tempfile::tempdir;

    fn open_db(options: StorageOptions) -> (tempfile::TempDir, Db) {
        let dir = tempdir().unwrap();
        let db = Db::open(options, 0, dir.path().join("db0")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let (dir, db) = open_db(StorageOptions::default());
        {
            let engine = db.engine().unwrap();
            engine.set(b"greeting", b"hello").unwrap();
            engine.hset(b"user:1", b"name", b"ada").unwrap();
            engine.rpush(b"queue", &[b"a".as_slice(), b"b".as_slice()]).unwrap();
        }
        let cp = dir.path().join("cp");
        db.create_checkpoint(&cp, true).unwrap();

        {
            let engine = db.engine().unwrap();
            engine.set(b"greeting", b"changed").unwrap();
            engine.hset(b"user:1", b"email", b"a@b").unwrap();
            engine.lpop(b"queue", 1).unwrap();
            engine.set(b"later", b"x").unwrap();
        }

        db.load_from_checkpoint(&cp, true).unwrap();
        let engine = db.engine().unwrap();
        assert_eq!(engine.get(b"greeting").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(
            engine.hgetall(b"user:1").unwrap(),
            vec![(b"name".to_vec(), b"ada".to_vec())]
        );
        assert_eq!(
            engine.lrange(b"queue", 0, -1).unwrap(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        assert_eq!(engine.get(b"later").unwrap(), None);
        assert_eq!(data_files(db.path()), [DATA_FILE]);
    }

    fn data_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(DATA_FILE))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_load_corrupt_checkpoint_keeps_database() {
        let (dir, db) = open_db(StorageOptions::default());
        db.engine().unwrap().set(b"k", b"before").unwrap();
        let cp = dir.path().join("cp");
        db.create_checkpoint(&cp, true).unwrap();
        std::fs::write(cp.join(DATA_FILE), b"garbage garbage garbage").unwrap();
        db.engine().unwrap().set(b"k", b"after").unwrap();

        assert!(db.load_from_checkpoint(&cp, true).is_err());
        assert!(db.is_open());
        assert_eq!(db.engine().unwrap().get(b"k").unwrap(), Some(b"after".to_vec()));
        assert_eq!(data_files(db.path()), [DATA_FILE]);

        // the handle is still usable for writes and later restores
        db.engine().unwrap().set(b"k2", b"v").unwrap();
        assert_eq!(db.engine().unwrap().get(b"k2").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_concurrent_loads_each_install_a_whole_checkpoint() {
        let (dir, db) = open_db(StorageOptions::default());
        let mut checkpoints = Vec::new();
        for value in ["one", "two"] {
            db.engine().unwrap().set(b"k", value.as_bytes()).unwrap();
            let cp = dir.path().join(format!("cp-{value}"));
            db.create_checkpoint(&cp, false).unwrap();
            checkpoints.push(cp);
        }

        let db = Arc::new(db);
        let handles: Vec<_> = checkpoints
            .into_iter()
            .map(|cp| {
                let db = Arc::clone(&db);
                thread::spawn(move || db.load_from_checkpoint(&cp, false))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        let value = db.engine().unwrap().get(b"k").unwrap().unwrap();
        assert!(value == b"one" || value == b"two");
        assert_eq!(data_files(db.path()), [DATA_FILE]);
    }

    #[test]
    fn test_load_missing_checkpoint_keeps_engine() {
        let (dir, db) = open_db(StorageOptions::default());
        db.engine().unwrap().set(b"k", b"v").unwrap();
        let err = db.load_from_checkpoint(dir.path().join("nope"), false).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(db.engine().unwrap().get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_closed_handle_is_busy() {
        let (_dir, db) = open_db(StorageOptions::default());
        db.close();
        assert!(!db.is_open());
        match db.engine() {
            Err(e) => assert_eq!(e.kind(), crate::StatusKind::Busy),
            Ok(_) => panic!("closed handle returned an engine"),
        }
    }

    #[test]
    fn test_concurrent_incrby_no_lost_updates() {
        const THREADS: i64 = 8;
        const ITERATIONS: i64 = 200;

        let options = StorageOptions {
            sync_writes: false,
            ..StorageOptions::default()
        };
        let (_dir, db) = open_db(options);
        let db = Arc::new(db);
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let db = Arc::clone(&db);
                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        db.engine().unwrap().incrby(b"counter", 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let value = db.engine().unwrap().get(b"counter").unwrap().unwrap();
        assert_eq!(value, (THREADS * ITERATIONS).to_string().into_bytes());
    }

    #[test]
    fn test_worker_runs_scheduled_small_compaction() {
        let options = StorageOptions {
            small_compaction_threshold: 5,
            small_compaction_duration_threshold: 0,
            sync_writes: false,
            ..StorageOptions::default()
        };
        let (_dir, db) = open_db(options);
        {
            let engine = db.engine().unwrap();
            for i in 0..5 {
                engine.hset(b"hot", format!("f{i}").as_bytes(), b"v").unwrap();
            }
            // dropping five fields crosses the threshold and schedules the key
            engine.del(&[b"hot".as_slice()]).unwrap();
            engine.hset(b"hot", b"f", b"v").unwrap();
            assert_eq!(engine.statistics().scheduled_tasks(), 1);
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let dropped = db.engine().unwrap().cf_state
                [crate::ColumnFamily::HashesData.index()]
            .records_dropped
            .load(Ordering::Relaxed);
            if dropped == 5 {
                break;
            }
            assert!(Instant::now() < deadline, "small compaction never ran");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_add_bg_task_full_queue() {
        let options = StorageOptions {
            bg_queue_capacity: 1,
            ..StorageOptions::default()
        };
        let (_dir, db) = open_db(options);
        // hold the engine exclusively so the worker cannot drain the queue
        let guard = db.engine.write();
        let mut accepted = 0;
        for _ in 0..4 {
            if db.add_bg_task(BgTask::clean_all(DataType::Sets)) {
                accepted += 1;
            }
        }
        drop(guard);
        assert!((1..=2).contains(&accepted));
    }
}
