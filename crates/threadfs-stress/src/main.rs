// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{bail, Context, Result};
use blake3::Hasher;
use clap::{Args, Parser, Subcommand};
use rand::{rngs::SmallRng, Rng, RngCore, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use threadfs_core::{
    Bridge, FaultInjector, FaultPolicy, FaultyBackend, FsConfig, MemoryBackend, MemoryStore,
    StatsSnapshot,
};
use threadfs_logging::{CliLogLevel, CliLoggingArgs};
use threadfs_posix::abi::unpack_dirents;
use threadfs_posix::{Errno, Posix, PosixResult};
use tracing::{debug, info, warn};

const WORK_ROOT: &str = "/stress";
const RACE_DIR: &str = "/stress/race";
const RACE_SLOTS: u32 = 16;

fn main() -> Result<()> {
    let cli = Cli::parse();
    // The report goes to stdout, so keep the log quiet unless asked.
    cli.logging.init_with_default_level("threadfs-stress", CliLogLevel::Warn)?;

    match cli.command {
        Command::Run(args) => {
            let json_output = args.json_output.clone();
            let report = run_workload(&args)?;
            if let Some(path) = json_output {
                let file = File::create(&path)
                    .with_context(|| format!("failed to create report {}", path.display()))?;
                serde_json::to_writer_pretty(file, &report)?;
            }
            write_json_to_stdout(&report)?;
            if report.status != "passed" {
                bail!("workload failed: {:?}", report.fatal_errors);
            }
        }
    }
    Ok(())
}

fn write_json_to_stdout<T: Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    out.flush()?;
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about = "threadfs concurrent workload runner")]
struct Cli {
    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Run(RunArgs),
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Number of worker threads to spawn
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Operations per worker
    #[arg(long, default_value_t = 500)]
    iterations: u64,

    /// Seed for the per-worker random generators
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Maximum file size in KiB
    #[arg(long, default_value_t = 64)]
    max_file_size_kib: u64,

    /// Filesystem configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fault injection policy (JSON) applied to the storage backend
    #[arg(long)]
    fault_policy: Option<PathBuf>,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug)]
enum Operation {
    MkdirRace,
    WriteRead,
    Symlink,
    Rename,
    Unlink,
    List,
}

impl Operation {
    fn label(&self) -> &'static str {
        match self {
            Operation::MkdirRace => "mkdir_race",
            Operation::WriteRead => "write_read",
            Operation::Symlink => "symlink",
            Operation::Rename => "rename",
            Operation::Unlink => "unlink",
            Operation::List => "list",
        }
    }
}

#[derive(Default, Serialize, Clone)]
struct OperationStats {
    mkdir_race: u64,
    write_read: u64,
    symlink: u64,
    rename: u64,
    unlink: u64,
    list: u64,
}

impl OperationStats {
    fn increment(&mut self, op: Operation) {
        match op {
            Operation::MkdirRace => self.mkdir_race += 1,
            Operation::WriteRead => self.write_read += 1,
            Operation::Symlink => self.symlink += 1,
            Operation::Rename => self.rename += 1,
            Operation::Unlink => self.unlink += 1,
            Operation::List => self.list += 1,
        }
    }

    fn total(&self) -> u64 {
        self.mkdir_race + self.write_read + self.symlink + self.rename + self.unlink + self.list
    }
}

impl std::ops::AddAssign<&OperationStats> for OperationStats {
    fn add_assign(&mut self, other: &OperationStats) {
        self.mkdir_race += other.mkdir_race;
        self.write_read += other.write_read;
        self.symlink += other.symlink;
        self.rename += other.rename;
        self.unlink += other.unlink;
        self.list += other.list;
    }
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
struct TreeFingerprint {
    digest: String,
    entry_count: u64,
}

#[derive(Serialize, Clone)]
struct IntegritySummary {
    before_restart: TreeFingerprint,
    after_restart: TreeFingerprint,
}

#[derive(Serialize, Clone)]
struct RaceSummary {
    contested_dirs: usize,
    winners: u64,
}

#[derive(Serialize, Clone)]
struct RunReport {
    threads: usize,
    iterations: u64,
    seed: u64,
    max_file_size_kib: u64,
    faults_enabled: bool,
    elapsed_ms: u64,
    operations: OperationStats,
    total_ops: u64,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
    races: RaceSummary,
    integrity: IntegritySummary,
    bridge: StatsSnapshot,
    injected_faults: u64,
    status: String,
}

fn load_config(args: &RunArgs) -> Result<FsConfig> {
    match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            FsConfig::from_toml_str(&text)
                .with_context(|| format!("invalid config {}", path.display()))
        }
        None => Ok(FsConfig::default()),
    }
}

fn load_fault_policy(args: &RunArgs) -> Result<FaultPolicy> {
    match &args.fault_policy {
        Some(path) => {
            let bytes = fs::read(path)
                .with_context(|| format!("failed to read fault policy {}", path.display()))?;
            FaultPolicy::from_json_bytes(&bytes)
                .with_context(|| format!("invalid fault policy {}", path.display()))
        }
        None => Ok(FaultPolicy::default()),
    }
}

fn mount(config: FsConfig, store: &MemoryStore, injector: &Arc<FaultInjector>) -> Result<Posix> {
    let store = store.clone();
    let injector = Arc::clone(injector);
    let bridge = Bridge::spawn(config, move || {
        FaultyBackend::new(MemoryBackend::with_store(store), injector)
    })
    .context("failed to mount the filesystem")?;
    Ok(Posix::new(bridge))
}

fn errno_context(err: Errno, what: &str) -> anyhow::Error {
    anyhow::Error::new(err).context(what.to_string())
}

fn run_workload(args: &RunArgs) -> Result<RunReport> {
    if args.threads == 0 {
        bail!("--threads must be at least 1");
    }
    let config = load_config(args)?;
    let policy = load_fault_policy(args)?;
    let faults_enabled = policy.enabled;

    let store = MemoryStore::new();
    let injector = Arc::new(FaultInjector::new());
    let posix = mount(config.clone(), &store, &injector)?;

    posix.mkdir(WORK_ROOT, 0o755).map_err(|e| errno_context(e, "failed to create work root"))?;
    posix.mkdir(RACE_DIR, 0o755).map_err(|e| errno_context(e, "failed to create race dir"))?;
    injector.set_policy(policy);

    info!(
        threads = args.threads,
        iterations = args.iterations,
        seed = args.seed,
        faults_enabled,
        "starting concurrent workload"
    );

    let races: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));
    let started = Instant::now();

    let mut handles = Vec::with_capacity(args.threads);
    for worker_id in 0..args.threads {
        let worker = Worker {
            id: worker_id,
            iterations: args.iterations,
            rng_seed: args.seed ^ (worker_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
            max_file_size_kib: args.max_file_size_kib.max(1),
            faults_enabled,
            races: Arc::clone(&races),
        };
        handles.push(posix.spawn(move |posix| worker.run(&posix)));
    }

    let mut aggregate_stats = OperationStats::default();
    let mut benign_errors: HashMap<String, u64> = HashMap::new();
    let mut fatal_errors: HashMap<String, u64> = HashMap::new();

    for handle in handles {
        match handle.join() {
            Ok(result) => {
                aggregate_stats += &result.stats;
                merge_counts(&mut benign_errors, &result.benign_errors);
                merge_counts(&mut fatal_errors, &result.fatal_errors);
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                *fatal_errors.entry("thread_panic".to_string()).or_insert(0) += 1;
                warn!("worker thread panicked: {}", msg);
            }
        }
    }
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    // Everything below checks state, not fault handling.
    let injected_faults = injector.hits();
    injector.clear();

    let races = races.lock().map(|guard| guard.clone()).unwrap_or_default();
    let winners: u64 = races.values().sum();
    for (name, wins) in &races {
        if *wins > 1 {
            *fatal_errors.entry("mkdir_race_multiple_winners".to_string()).or_insert(0) += 1;
            warn!(dir = %name, wins, "more than one mkdir succeeded");
        }
        let exists = posix.stat(&format!("{RACE_DIR}/{name}")).is_ok();
        if !faults_enabled && exists != (*wins == 1) {
            *fatal_errors.entry("mkdir_race_inconsistent".to_string()).or_insert(0) += 1;
            warn!(dir = %name, wins, exists, "race outcome does not match the tree");
        }
    }

    let before_restart = compute_tree_fingerprint(&posix, WORK_ROOT)
        .map_err(|e| errno_context(e, "failed to fingerprint the tree"))?;
    let bridge = posix.bridge().stats();
    posix.bridge().shutdown().context("failed to shut down the storage thread")?;

    let remounted = mount(config, &store, &injector)?;
    let after_restart = compute_tree_fingerprint(&remounted, WORK_ROOT)
        .map_err(|e| errno_context(e, "failed to fingerprint the remounted tree"))?;
    remounted.bridge().shutdown().context("failed to shut down the remounted storage thread")?;

    if before_restart != after_restart {
        if faults_enabled {
            *benign_errors.entry("restart_fingerprint_diverged".to_string()).or_insert(0) += 1;
        } else {
            *fatal_errors.entry("restart_fingerprint_mismatch".to_string()).or_insert(0) += 1;
        }
    }

    let status = if fatal_errors.is_empty() {
        "passed".to_string()
    } else {
        "failed".to_string()
    };
    info!(status = %status, elapsed_ms, ops = aggregate_stats.total(), "workload finished");

    Ok(RunReport {
        threads: args.threads,
        iterations: args.iterations,
        seed: args.seed,
        max_file_size_kib: args.max_file_size_kib,
        faults_enabled,
        elapsed_ms,
        operations: aggregate_stats.clone(),
        total_ops: aggregate_stats.total(),
        benign_errors,
        fatal_errors,
        races: RaceSummary {
            contested_dirs: races.len(),
            winners,
        },
        integrity: IntegritySummary {
            before_restart,
            after_restart,
        },
        bridge,
        injected_faults,
        status,
    })
}

fn merge_counts(target: &mut HashMap<String, u64>, source: &HashMap<String, u64>) {
    for (key, value) in source {
        *target.entry(key.clone()).or_insert(0) += value;
    }
}

struct Worker {
    id: usize,
    iterations: u64,
    rng_seed: u64,
    max_file_size_kib: u64,
    faults_enabled: bool,
    races: Arc<Mutex<HashMap<String, u64>>>,
}

struct WorkerResult {
    stats: OperationStats,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
}

enum OperationResult {
    Completed,
    Benign { label: String },
    Fatal { label: String, detail: String },
}

/// Names a worker has created in its home directory.
#[derive(Default)]
struct WorkingSet {
    files: Vec<String>,
    links: Vec<String>,
    seq: u64,
}

impl WorkingSet {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

impl Worker {
    fn run(self, posix: &Posix) -> WorkerResult {
        let mut rng = SmallRng::seed_from_u64(self.rng_seed);
        let mut stats = OperationStats::default();
        let mut benign_errors: HashMap<String, u64> = HashMap::new();
        let mut fatal_errors: HashMap<String, u64> = HashMap::new();
        let mut set = WorkingSet::default();

        let home = format!("{WORK_ROOT}/w{:02}", self.id);
        if let Err(err) = posix.mkdir(&home, 0o755).and_then(|()| posix.chdir(&home)) {
            fatal_errors.insert("worker_dir_create".into(), 1);
            warn!("worker {} failed to enter {}: {}", self.id, home, err);
            return WorkerResult {
                stats,
                benign_errors,
                fatal_errors,
            };
        }

        for _ in 0..self.iterations {
            let op = pick_operation(&mut rng);
            let result = match op {
                Operation::MkdirRace => self.mkdir_race(posix, &mut rng),
                Operation::WriteRead => self.write_read(posix, &mut rng, &mut set),
                Operation::Symlink => self.symlink_round_trip(posix, &mut rng, &mut set),
                Operation::Rename => self.rename_file(posix, &mut rng, &mut set),
                Operation::Unlink => self.unlink_file(posix, &mut rng, &mut set),
                Operation::List => self.list_home(posix, &set),
            };

            match result {
                OperationResult::Completed => stats.increment(op),
                OperationResult::Benign { label } => {
                    *benign_errors.entry(label).or_insert(0) += 1;
                }
                OperationResult::Fatal { label, detail } => {
                    *fatal_errors.entry(label.clone()).or_insert(0) += 1;
                    debug!("worker {} fatal {}: {}", self.id, label, detail);
                }
            }
        }

        WorkerResult {
            stats,
            benign_errors,
            fatal_errors,
        }
    }

    fn classify(&self, op: Operation, err: Errno) -> OperationResult {
        classify_error(op, err, self.faults_enabled)
    }

    fn mkdir_race(&self, posix: &Posix, rng: &mut SmallRng) -> OperationResult {
        let name = format!("r{:02}", rng.gen_range(0..RACE_SLOTS));
        let result = posix.mkdir(&format!("{RACE_DIR}/{name}"), 0o755);
        let Ok(mut races) = self.races.lock() else {
            return OperationResult::Fatal {
                label: "mkdir_race_poisoned".into(),
                detail: "race table poisoned".into(),
            };
        };
        let wins = races.entry(name).or_insert(0);
        match result {
            Ok(()) => {
                *wins += 1;
                OperationResult::Completed
            }
            Err(err) if err.0 == libc::EEXIST => OperationResult::Benign {
                label: "mkdir_race_lost".into(),
            },
            Err(err) => self.classify(Operation::MkdirRace, err),
        }
    }

    fn write_read(&self, posix: &Posix, rng: &mut SmallRng, set: &mut WorkingSet) -> OperationResult {
        let name = format!("f{:05}", set.next_seq());
        let len = rng.gen_range(1..=self.max_file_size_kib * 1024) as usize;
        let mut data = vec![0u8; len];
        rng.fill_bytes(&mut data);
        let expected = blake3::hash(&data);

        let fd = match posix.open(&name, libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, 0o644) {
            Ok(fd) => fd,
            Err(err) => return self.classify(Operation::WriteRead, err),
        };
        set.files.push(name.clone());

        let written = write_all(posix, fd, &data).and_then(|()| {
            if rng.gen_bool(0.25) {
                posix.fsync(fd)
            } else {
                Ok(())
            }
        });
        let closed = posix.close(fd);
        if let Err(err) = written.and(closed) {
            return self.classify(Operation::WriteRead, err);
        }

        let read_back = match read_file(posix, &name) {
            Ok(bytes) => bytes,
            Err(err) => return self.classify(Operation::WriteRead, err),
        };
        if blake3::hash(&read_back) != expected {
            return OperationResult::Fatal {
                label: "write_read_digest_mismatch".into(),
                detail: format!("{name}: wrote {len} bytes, read {}", read_back.len()),
            };
        }
        OperationResult::Completed
    }

    fn symlink_round_trip(
        &self,
        posix: &Posix,
        rng: &mut SmallRng,
        set: &mut WorkingSet,
    ) -> OperationResult {
        let seq = set.next_seq();
        let name = format!("l{seq:05}");
        // Targets are stored verbatim, dangling or not.
        let target = format!("../w{:02}/./{:08x}//t{seq}", rng.gen_range(0..64), rng.gen::<u32>());
        if let Err(err) = posix.symlink(&target, &name) {
            return self.classify(Operation::Symlink, err);
        }
        set.links.push(name.clone());

        let mut buf = [0u8; 256];
        let n = match posix.readlink(&name, &mut buf) {
            Ok(n) => n,
            Err(err) => return self.classify(Operation::Symlink, err),
        };
        if &buf[..n] != target.as_bytes() {
            return OperationResult::Fatal {
                label: "symlink_target_mismatch".into(),
                detail: format!("{name}: expected {target}, got {}", String::from_utf8_lossy(&buf[..n])),
            };
        }

        let mut short = [0u8; 3];
        match posix.readlink(&name, &mut short) {
            Ok(3) if short == target.as_bytes()[..3] => OperationResult::Completed,
            Ok(n) => OperationResult::Fatal {
                label: "symlink_truncation".into(),
                detail: format!("{name}: short readlink returned {n}"),
            },
            Err(err) => self.classify(Operation::Symlink, err),
        }
    }

    fn rename_file(&self, posix: &Posix, rng: &mut SmallRng, set: &mut WorkingSet) -> OperationResult {
        if set.files.is_empty() {
            return OperationResult::Benign {
                label: "rename_no_target".into(),
            };
        }
        let index = rng.gen_range(0..set.files.len());
        let new_name = format!("m{:05}", set.next_seq());
        let old_name = std::mem::replace(&mut set.files[index], new_name.clone());

        if let Err(err) = posix.rename(&old_name, &new_name) {
            return self.classify(Operation::Rename, err);
        }
        if let Err(err) = posix.stat(&new_name) {
            return self.classify(Operation::Rename, err);
        }
        match posix.lstat(&old_name) {
            Err(err) if err.0 == libc::ENOENT => OperationResult::Completed,
            Err(err) => self.classify(Operation::Rename, err),
            Ok(_) => OperationResult::Fatal {
                label: "rename_source_still_present".into(),
                detail: format!("{old_name} -> {new_name}"),
            },
        }
    }

    fn unlink_file(&self, posix: &Posix, rng: &mut SmallRng, set: &mut WorkingSet) -> OperationResult {
        let pool = if !set.links.is_empty() && rng.gen_bool(0.3) {
            &mut set.links
        } else {
            &mut set.files
        };
        if pool.is_empty() {
            return OperationResult::Benign {
                label: "unlink_no_target".into(),
            };
        }
        let name = pool.swap_remove(rng.gen_range(0..pool.len()));
        match posix.unlink(&name) {
            Ok(()) => OperationResult::Completed,
            Err(err) => self.classify(Operation::Unlink, err),
        }
    }

    fn list_home(&self, posix: &Posix, set: &WorkingSet) -> OperationResult {
        let names = match list_dir(posix, ".") {
            Ok(names) => names,
            Err(err) => return self.classify(Operation::List, err),
        };
        let expected = set.files.len() + set.links.len();
        if !self.faults_enabled && names.len() != expected {
            return OperationResult::Fatal {
                label: "list_count_mismatch".into(),
                detail: format!("expected {expected} entries, found {}", names.len()),
            };
        }
        OperationResult::Completed
    }
}

fn pick_operation(rng: &mut SmallRng) -> Operation {
    match rng.gen_range(0..100) {
        0..=14 => Operation::MkdirRace,
        15..=44 => Operation::WriteRead,
        45..=59 => Operation::Symlink,
        60..=74 => Operation::Rename,
        75..=89 => Operation::Unlink,
        _ => Operation::List,
    }
}

fn classify_error(op: Operation, err: Errno, faults_enabled: bool) -> OperationResult {
    // Injected faults surface as EIO; anything else is a real defect.
    if err.0 == libc::EIO && faults_enabled {
        return OperationResult::Benign {
            label: format!("{}_injected_eio", op.label()),
        };
    }
    OperationResult::Fatal {
        label: format!("{}_errno_{}", op.label(), err.0),
        detail: err.to_string(),
    }
}

fn write_all(posix: &Posix, fd: libc::c_int, mut data: &[u8]) -> PosixResult<()> {
    while !data.is_empty() {
        let n = posix.write(fd, data)?;
        if n == 0 {
            return Err(Errno::raise(libc::EIO));
        }
        data = &data[n..];
    }
    Ok(())
}

fn read_file(posix: &Posix, path: &str) -> PosixResult<Vec<u8>> {
    let fd = posix.open(path, libc::O_RDONLY, 0)?;
    let mut out = Vec::new();
    let mut buffer = vec![0u8; 32 * 1024];
    let result = loop {
        match posix.read(fd, &mut buffer) {
            Ok(0) => break Ok(()),
            Ok(n) => out.extend_from_slice(&buffer[..n]),
            Err(err) => break Err(err),
        }
    };
    let closed = posix.close(fd);
    result.and(closed).map(|()| out)
}

/// Entry names of `path`, without `.` and `..`.
fn list_dir(posix: &Posix, path: &str) -> PosixResult<Vec<String>> {
    let fd = posix.open(path, libc::O_RDONLY | libc::O_DIRECTORY, 0)?;
    let mut names = Vec::new();
    let mut buffer = vec![0u8; 4096];
    let result = loop {
        match posix.getdents(fd, &mut buffer) {
            Ok(0) => break Ok(()),
            Ok(n) => names.extend(
                unpack_dirents(&buffer[..n])
                    .into_iter()
                    .map(|(_, _, name)| name)
                    .filter(|name| name != "." && name != ".."),
            ),
            Err(err) => break Err(err),
        }
    };
    let closed = posix.close(fd);
    result.and(closed).map(|()| names)
}

/// Digest over every path, type, size and content (or link target) below
/// `root`, visited in sorted order. Timestamps are not included.
fn compute_tree_fingerprint(posix: &Posix, root: &str) -> PosixResult<TreeFingerprint> {
    let mut hasher = Hasher::new();
    let mut entry_count = 0u64;
    let mut pending = vec![root.to_string()];

    while let Some(dir) = pending.pop() {
        let mut names = list_dir(posix, &dir)?;
        names.sort();
        for name in names {
            let path = format!("{dir}/{name}");
            let st = posix.lstat(&path)?;
            entry_count += 1;
            hasher.update(path.as_bytes());
            hasher.update(&st.st_mode.to_le_bytes());
            hasher.update(&st.st_size.to_le_bytes());

            let kind = st.st_mode & libc::S_IFMT as u32;
            if kind == libc::S_IFDIR as u32 {
                pending.push(path);
            } else if kind == libc::S_IFLNK as u32 {
                let mut buf = vec![0u8; 4096];
                let n = posix.readlink(&path, &mut buf)?;
                hasher.update(&buf[..n]);
            } else {
                hasher.update(&read_file(posix, &path)?);
            }
        }
    }

    Ok(TreeFingerprint {
        digest: format!("blake3:{}", hasher.finalize().to_hex()),
        entry_count,
    })
}
