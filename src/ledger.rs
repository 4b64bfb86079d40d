//! Abuse ledger: per-address strikes, hourly usage and time-bounded bans.
//!
//! ## Summary
//! - Strike and usage counters live in lock-free maps and are cleared
//!   wholesale once their window has elapsed since the last clear. This is
//!   an approximation of a sliding window: an address can spend a full quota
//!   just before a clear and another just after.
//! - Bans live behind a single lock. Expired bans are evicted lazily on
//!   lookup.
//! - Whitelisted addresses are never counted and never banned.
//! - The ban table is persisted to a JSON file (`{"<ip>": <expiry unix
//!   seconds>}`) on a blocking worker, at most once per persist interval.
//!   Bans that land inside the interval are picked up by `flush_if_due` and
//!   by the final `flush` at shutdown.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

#[derive(Debug)]
pub enum LedgerError {
    Io(std::io::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Io(e) => write!(f, "ban list io error: {e}"),
            LedgerError::Serde(e) => write!(f, "ban list format error: {e}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::Io(e)
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serde(e)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Strikes within one strike window that trigger a ban.
    pub max_strikes: u32,
    /// Requests within one usage window that trigger a ban.
    pub max_usage_per_hour: u32,
    pub ban_duration: Duration,
    pub strike_window: Duration,
    pub usage_window: Duration,
    /// Minimum spacing between two ban-list writes.
    pub persist_interval: Duration,
    /// Where the ban list is loaded from and persisted to. `None` keeps it
    /// in memory only.
    pub ban_list_path: Option<PathBuf>,
    pub whitelist: Vec<IpAddr>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_strikes: 20,
            max_usage_per_hour: 180,
            ban_duration: Duration::from_secs(24 * 60 * 60),
            strike_window: Duration::from_secs(24 * 60 * 60),
            usage_window: Duration::from_secs(60 * 60),
            persist_interval: Duration::from_secs(5 * 60),
            ban_list_path: None,
            whitelist: Vec::new(),
        }
    }
}

/// Explicitly owned abuse ledger. Cloning shares the same tables.
#[derive(Clone)]
pub struct AbuseLedger {
    inner: Arc<LedgerInner>,
}

struct LedgerInner {
    config: LedgerConfig,
    whitelist: HashSet<IpAddr>,
    bans: Mutex<HashMap<IpAddr, SystemTime>>,
    strikes: DashMap<IpAddr, u32>,
    usage: DashMap<IpAddr, u32>,
    /// Base for the clear stamps below.
    started: Instant,
    /// Milliseconds since `started` at the last wholesale clear.
    strikes_cleared_at: AtomicU64,
    usage_cleared_at: AtomicU64,
    /// Bans changed since the last successful write.
    dirty: AtomicBool,
    last_persist: Mutex<Option<Instant>>,
    /// Serialises writers of the ban-list file.
    file_lock: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl AbuseLedger {
    /// Build a ledger, loading any ban list already on disk.
    ///
    /// A missing file is an empty list. A file that cannot be read or parsed
    /// is logged and also treated as empty; it is overwritten on the next
    /// persist.
    pub fn open(config: LedgerConfig) -> Self {
        let bans = match &config.ban_list_path {
            Some(path) => match load_ban_list(path) {
                Ok(bans) => {
                    if !bans.is_empty() {
                        crate::tlog!(
                            "ledger: loaded {} active bans from {}",
                            bans.len(),
                            path.display()
                        );
                    }
                    bans
                }
                Err(e) => {
                    crate::tlog_warn!(
                        "ledger: ignoring unreadable ban list {}: {}",
                        path.display(),
                        e
                    );
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        Self {
            inner: Arc::new(LedgerInner {
                whitelist: config.whitelist.iter().copied().collect(),
                config,
                bans: Mutex::new(bans),
                strikes: DashMap::new(),
                usage: DashMap::new(),
                started: Instant::now(),
                strikes_cleared_at: AtomicU64::new(0),
                usage_cleared_at: AtomicU64::new(0),
                dirty: AtomicBool::new(false),
                last_persist: Mutex::new(None),
                file_lock: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.inner.config
    }

    pub fn is_whitelisted(&self, addr: IpAddr) -> bool {
        self.inner.whitelist.contains(&addr)
    }

    /// Count one unit of normal traffic. Bans the address once it reaches the
    /// hourly ceiling.
    pub fn record_usage(&self, addr: IpAddr) {
        let inner = &self.inner;
        clear_if_elapsed(
            inner.started,
            &inner.usage_cleared_at,
            inner.config.usage_window,
            &inner.usage,
        );
        if self.is_whitelisted(addr) {
            return;
        }

        let count = {
            let mut entry = inner.usage.entry(addr).or_insert(0);
            *entry += 1;
            *entry
        };
        if count >= inner.config.max_usage_per_hour {
            crate::tlog_warn!("ledger: {} exceeded {} requests per window", addr, count);
            self.ban(addr);
        }
    }

    /// Count one abuse signal. The Nth strike in a window bans the address
    /// and resets its count.
    pub fn record_strike(&self, addr: IpAddr) {
        let inner = &self.inner;
        clear_if_elapsed(
            inner.started,
            &inner.strikes_cleared_at,
            inner.config.strike_window,
            &inner.strikes,
        );
        if self.is_whitelisted(addr) {
            return;
        }

        let reached = {
            let mut entry = inner.strikes.entry(addr).or_insert(0);
            *entry += 1;
            if *entry >= inner.config.max_strikes {
                *entry = 0;
                true
            } else {
                false
            }
        };
        if reached {
            crate::tlog_warn!(
                "ledger: {} reached {} strikes",
                addr,
                inner.config.max_strikes
            );
            self.ban(addr);
        }
    }

    /// Ban `addr` for the configured duration, overwriting any earlier
    /// expiry. Persistence happens off the calling thread.
    pub fn ban(&self, addr: IpAddr) {
        if self.is_whitelisted(addr) {
            return;
        }
        let expiry = SystemTime::now() + self.inner.config.ban_duration;
        lock(&self.inner.bans).insert(addr, expiry);
        self.inner.dirty.store(true, Ordering::SeqCst);
        crate::tlog!("ledger: banned {} until {}", addr, unix_secs(expiry));
        self.persist_if_due();
    }

    /// True iff `addr` holds a ban that has not yet expired. Expired entries
    /// are dropped on the way.
    pub fn is_banned(&self, addr: IpAddr) -> bool {
        let mut bans = lock(&self.inner.bans);
        match bans.get(&addr) {
            Some(expiry) if *expiry > SystemTime::now() => true,
            Some(_) => {
                bans.remove(&addr);
                false
            }
            None => false,
        }
    }

    /// Snapshot of the ban table.
    pub fn ban_list(&self) -> HashMap<IpAddr, SystemTime> {
        lock(&self.inner.bans).clone()
    }

    pub fn strikes(&self, addr: IpAddr) -> u32 {
        self.inner.strikes.get(&addr).map(|c| *c).unwrap_or(0)
    }

    pub fn usage(&self, addr: IpAddr) -> u32 {
        self.inner.usage.get(&addr).map(|c| *c).unwrap_or(0)
    }

    /// Write the ban list now if bans are pending and the persist interval
    /// has elapsed. Called from the maintenance tick.
    pub fn flush_if_due(&self) {
        if self.inner.dirty.load(Ordering::SeqCst) {
            self.persist_if_due();
        }
    }

    /// Write the ban list unconditionally on the calling thread.
    pub fn flush(&self) -> Result<(), LedgerError> {
        let Some(path) = self.inner.config.ban_list_path.clone() else {
            return Ok(());
        };
        *lock(&self.inner.last_persist) = Some(Instant::now());
        self.write_ban_list(&path)
    }

    fn persist_if_due(&self) {
        let Some(path) = self.inner.config.ban_list_path.clone() else {
            return;
        };
        {
            let mut last = lock(&self.inner.last_persist);
            let due = last.map_or(true, |at| at.elapsed() >= self.inner.config.persist_interval);
            if !due {
                return;
            }
            *last = Some(Instant::now());
        }

        let ledger = self.clone();
        let write = move || {
            if let Err(e) = ledger.write_ban_list(&path) {
                crate::tlog_warn!("ledger: failed to persist ban list: {}", e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    fn write_ban_list(&self, path: &Path) -> Result<(), LedgerError> {
        let _writer = lock(&self.inner.file_lock);
        self.inner.dirty.store(false, Ordering::SeqCst);

        let snapshot: HashMap<String, u64> = self
            .ban_list()
            .into_iter()
            .map(|(addr, expiry)| (addr.to_string(), unix_secs(expiry)))
            .collect();

        let result = write_atomically(path, &serde_json::to_vec_pretty(&snapshot)?);
        match &result {
            Ok(()) => crate::tlog!(
                "ledger: persisted {} bans to {}",
                snapshot.len(),
                path.display()
            ),
            Err(_) => self.inner.dirty.store(true, Ordering::SeqCst),
        }
        result
    }
}

/// Clear `table` if `window` has passed since the stamp in `cleared_at`.
/// Only the caller that wins the stamp update clears.
fn clear_if_elapsed(
    started: Instant,
    cleared_at: &AtomicU64,
    window: Duration,
    table: &DashMap<IpAddr, u32>,
) {
    let now = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let window = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    let last = cleared_at.load(Ordering::Acquire);
    if now.saturating_sub(last) < window {
        return;
    }
    if cleared_at
        .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        table.clear();
    }
}

fn load_ban_list(path: &Path) -> Result<HashMap<IpAddr, SystemTime>, LedgerError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    let raw: HashMap<String, u64> = serde_json::from_slice(&bytes)?;

    let now = SystemTime::now();
    let mut bans = HashMap::new();
    for (addr, expiry) in raw {
        let Ok(addr) = addr.parse::<IpAddr>() else {
            crate::tlog_warn!("ledger: skipping malformed address {:?} in ban list", addr);
            continue;
        };
        let Some(expiry) = UNIX_EPOCH.checked_add(Duration::from_secs(expiry)) else {
            crate::tlog_warn!(
                "ledger: skipping out-of-range expiry {} for {} in ban list",
                expiry,
                addr
            );
            continue;
        };
        if expiry > now {
            bans.insert(addr, expiry);
        }
    }
    Ok(bans)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
