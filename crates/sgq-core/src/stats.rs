//! Statistics module - per-thread counters, process-wide aggregation and the
//! final report

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

/// Default entropy device for LBA generator seeds.
pub const ENTROPY_PATH: &str = "/dev/urandom";

// ============================================================================
// Thread-local counters
// ============================================================================

/// Counters a worker updates on its hot path without synchronization.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LocalCounters {
    /// Commands accepted by the driver.
    pub starts: u64,
    /// Commands completed successfully.
    pub finishes: u64,
    /// `ENOMEM` retries.
    pub enomem: u64,
    /// `EAGAIN` retries.
    pub eagain: u64,
    /// `EBUSY` retries.
    pub ebusy: u64,
    /// `E2BIG` queue-full signals.
    pub e2big: u64,
    /// `EDOM` submissions.
    pub edom: u64,
    /// Completions with RECOVERED ERROR sense.
    pub recovered: u64,
    /// Data bytes moved by successful commands.
    pub bytes: u64,
    /// Completions carrying a driver-measured duration.
    pub lat_count: u64,
    /// Sum of those durations.
    pub lat_sum_ns: u64,
    /// Shortest duration.
    pub lat_min_ns: u64,
    /// Longest duration.
    pub lat_max_ns: u64,
}

impl LocalCounters {
    /// Record one driver-measured command duration.
    pub fn record_latency(&mut self, d: Duration) {
        let ns = d.as_nanos().min(u128::from(u64::MAX)) as u64;
        self.lat_min_ns = if self.lat_count == 0 {
            ns
        } else {
            self.lat_min_ns.min(ns)
        };
        self.lat_max_ns = self.lat_max_ns.max(ns);
        self.lat_sum_ns = self.lat_sum_ns.saturating_add(ns);
        self.lat_count += 1;
    }

    /// Add these counters to the shared totals.
    pub fn merge_into(&self, stats: &Stats) {
        stats.starts.fetch_add(self.starts, Ordering::Relaxed);
        stats.finishes.fetch_add(self.finishes, Ordering::Relaxed);
        stats.enomem.fetch_add(self.enomem, Ordering::Relaxed);
        stats.eagain.fetch_add(self.eagain, Ordering::Relaxed);
        stats.ebusy.fetch_add(self.ebusy, Ordering::Relaxed);
        stats.e2big.fetch_add(self.e2big, Ordering::Relaxed);
        stats.edom.fetch_add(self.edom, Ordering::Relaxed);
        stats.recovered.fetch_add(self.recovered, Ordering::Relaxed);
        stats.bytes.fetch_add(self.bytes, Ordering::Relaxed);
        if self.lat_count > 0 {
            stats.lat_count.fetch_add(self.lat_count, Ordering::Relaxed);
            stats.lat_sum_ns.fetch_add(self.lat_sum_ns, Ordering::Relaxed);
            stats.lat_min_ns.fetch_min(self.lat_min_ns, Ordering::Relaxed);
            stats.lat_max_ns.fetch_max(self.lat_max_ns, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// Shared counters
// ============================================================================

/// Process-wide totals. Workers add to them once, at exit.
#[derive(Debug)]
pub struct Stats {
    starts: AtomicU64,
    finishes: AtomicU64,
    enomem: AtomicU64,
    eagain: AtomicU64,
    ebusy: AtomicU64,
    e2big: AtomicU64,
    edom: AtomicU64,
    recovered: AtomicU64,
    bytes: AtomicU64,
    failed_workers: AtomicU64,
    lat_count: AtomicU64,
    lat_sum_ns: AtomicU64,
    lat_min_ns: AtomicU64,
    lat_max_ns: AtomicU64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            starts: AtomicU64::new(0),
            finishes: AtomicU64::new(0),
            enomem: AtomicU64::new(0),
            eagain: AtomicU64::new(0),
            ebusy: AtomicU64::new(0),
            e2big: AtomicU64::new(0),
            edom: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            failed_workers: AtomicU64::new(0),
            lat_count: AtomicU64::new(0),
            lat_sum_ns: AtomicU64::new(0),
            lat_min_ns: AtomicU64::new(u64::MAX),
            lat_max_ns: AtomicU64::new(0),
        }
    }
}

impl Stats {
    /// Fresh, zeroed totals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a worker that ended on an error.
    pub fn record_failed_worker(&self) {
        self.failed_workers.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter. Only meaningful once all workers have joined.
    pub fn snapshot(&self) -> StatsSnapshot {
        let lat_count = self.lat_count.load(Ordering::Relaxed);
        StatsSnapshot {
            starts: self.starts.load(Ordering::Relaxed),
            finishes: self.finishes.load(Ordering::Relaxed),
            enomem: self.enomem.load(Ordering::Relaxed),
            eagain: self.eagain.load(Ordering::Relaxed),
            ebusy: self.ebusy.load(Ordering::Relaxed),
            e2big: self.e2big.load(Ordering::Relaxed),
            edom: self.edom.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            failed_workers: self.failed_workers.load(Ordering::Relaxed),
            lat_count,
            lat_sum_ns: self.lat_sum_ns.load(Ordering::Relaxed),
            lat_min_ns: if lat_count == 0 {
                0
            } else {
                self.lat_min_ns.load(Ordering::Relaxed)
            },
            lat_max_ns: self.lat_max_ns.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`Stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Commands accepted by the driver.
    pub starts: u64,
    /// Commands completed successfully.
    pub finishes: u64,
    /// `ENOMEM` retries.
    pub enomem: u64,
    /// `EAGAIN` retries.
    pub eagain: u64,
    /// `EBUSY` retries.
    pub ebusy: u64,
    /// `E2BIG` queue-full signals.
    pub e2big: u64,
    /// `EDOM` submissions.
    pub edom: u64,
    /// RECOVERED ERROR completions.
    pub recovered: u64,
    /// Data bytes moved.
    pub bytes: u64,
    /// Workers that ended on an error.
    pub failed_workers: u64,
    /// Completions with a measured duration.
    pub lat_count: u64,
    /// Sum of measured durations.
    pub lat_sum_ns: u64,
    /// Shortest measured duration.
    pub lat_min_ns: u64,
    /// Longest measured duration.
    pub lat_max_ns: u64,
}

// ============================================================================
// Correlation ids
// ============================================================================

/// Process-wide pack_id source. Ids start at 1 and stay positive: after
/// `i32::MAX` the next id is 1 again, since `-1` means "any" to the driver.
#[derive(Debug)]
pub struct PackIdGen(AtomicI32);

impl Default for PackIdGen {
    fn default() -> Self {
        Self(AtomicI32::new(1))
    }
}

impl PackIdGen {
    /// Generator whose first id is 1.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn starting_at(first: i32) -> Self {
        Self(AtomicI32::new(first))
    }

    /// Take the next id.
    #[inline]
    pub fn next_id(&self) -> i32 {
        let taken = self.0.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
            Some(if id == i32::MAX { 1 } else { id + 1 })
        });
        match taken {
            Ok(id) | Err(id) => id,
        }
    }
}

// ============================================================================
// Console and entropy
// ============================================================================

/// Serializes whole lines from concurrent workers.
pub struct Console {
    out: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new(Box::new(io::stderr()))
    }
}

impl Console {
    /// Console writing to `out`.
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Write one line atomically with respect to other callers.
    pub fn line(&self, msg: &str) {
        let mut out = self.out.lock();
        // Console output is best-effort.
        let _ = writeln!(out, "{msg}");
        let _ = out.flush();
    }
}

/// Entropy device shared by workers when seeding LBA generators.
#[derive(Debug)]
pub struct EntropySource {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Default for EntropySource {
    fn default() -> Self {
        Self::new(ENTROPY_PATH)
    }
}

impl EntropySource {
    /// Read seeds from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// One 8-byte seed, read under the entropy mutex.
    pub fn seed(&self) -> io::Result<u64> {
        let _guard = self.lock.lock();
        let mut bytes = [0u8; 8];
        File::open(&self.path)?.read_exact(&mut bytes)?;
        Ok(u64::from_ne_bytes(bytes))
    }
}

/// Everything workers share.
#[derive(Debug, Default)]
pub struct Shared {
    /// Totals merged at worker exit.
    pub stats: Stats,
    /// pack_id generator.
    pub pack_ids: PackIdGen,
    /// Line-serialized console.
    pub console: Console,
    /// Seed source.
    pub entropy: EntropySource,
}

impl Shared {
    /// Shared state with a custom console and entropy source.
    pub fn new(console: Console, entropy: EntropySource) -> Self {
        Self {
            stats: Stats::new(),
            pack_ids: PackIdGen::new(),
            console,
            entropy,
        }
    }
}

// ============================================================================
// Report
// ============================================================================

/// Transient error counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorCounts {
    /// `ENOMEM` retries.
    pub enomem: u64,
    /// `EAGAIN` retries.
    pub eagain: u64,
    /// `EBUSY` retries.
    pub ebusy: u64,
    /// `E2BIG` forced drains.
    pub e2big: u64,
    /// `EDOM` submissions.
    pub edom: u64,
}

/// Driver-measured latency summary in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Samples.
    pub count: u64,
    /// Mean.
    pub mean_us: f64,
    /// Minimum.
    pub min_us: f64,
    /// Maximum.
    pub max_us: f64,
}

/// Final run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// Worker threads spawned.
    pub threads: usize,
    /// Workers that ended on an error.
    pub failed_workers: u64,
    /// Wall-clock time of the parallel phase.
    pub elapsed_secs: f64,
    /// Commands accepted by the driver.
    pub submitted: u64,
    /// Commands completed successfully.
    pub completed: u64,
    /// Completions per second.
    pub commands_per_sec: f64,
    /// Data throughput in MB/s (10^6 bytes).
    pub mb_per_sec: f64,
    /// RECOVERED ERROR completions.
    pub recovered: u64,
    /// Transient error counts.
    pub errors: ErrorCounts,
    /// Present once any command completed; driver-measured under
    /// nanosecond timing, wall-clock otherwise.
    pub latency: Option<LatencySummary>,
}

impl Report {
    /// Build from a post-join snapshot.
    pub fn new(snap: &StatsSnapshot, threads: usize, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = |n: f64| if secs > 0.0 { n / secs } else { 0.0 };
        let latency = (snap.lat_count > 0).then(|| LatencySummary {
            count: snap.lat_count,
            mean_us: snap.lat_sum_ns as f64 / snap.lat_count as f64 / 1_000.0,
            min_us: snap.lat_min_ns as f64 / 1_000.0,
            max_us: snap.lat_max_ns as f64 / 1_000.0,
        });
        Self {
            threads,
            failed_workers: snap.failed_workers,
            elapsed_secs: secs,
            submitted: snap.starts,
            completed: snap.finishes,
            commands_per_sec: rate(snap.finishes as f64),
            mb_per_sec: rate(snap.bytes as f64 / 1_000_000.0),
            recovered: snap.recovered,
            errors: ErrorCounts {
                enomem: snap.enomem,
                eagain: snap.eagain,
                ebusy: snap.ebusy,
                e2big: snap.e2big,
                edom: snap.edom,
            },
            latency,
        }
    }

    /// Human-readable report; zero counts are shown only when `verbose`.
    pub fn render(&self, verbose: bool) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "Elapsed time: {:.3} secs", self.elapsed_secs);
        let _ = writeln!(
            s,
            "Submitted {} commands, completed {} commands across {} threads",
            self.submitted, self.completed, self.threads
        );
        let _ = write!(s, "Throughput: {:.1} commands/sec", self.commands_per_sec);
        if self.mb_per_sec > 0.0 {
            let _ = write!(s, ", {:.2} MB/sec", self.mb_per_sec);
        }
        s.push('\n');

        let counts = [
            ("Recovered errors", self.recovered),
            ("ENOMEM retries", self.errors.enomem),
            ("EAGAIN retries", self.errors.eagain),
            ("EBUSY retries", self.errors.ebusy),
            ("E2BIG forced drains", self.errors.e2big),
            ("EDOM errors", self.errors.edom),
            ("Failed workers", self.failed_workers),
        ];
        for (label, n) in counts {
            if n > 0 || verbose {
                let _ = writeln!(s, "{label}: {n}");
            }
        }
        if let Some(lat) = &self.latency {
            let _ = writeln!(
                s,
                "Latency (us): mean {:.1}, min {:.1}, max {:.1} over {} commands",
                lat.mean_us, lat.min_us, lat.max_us, lat.count
            );
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_pack_ids_start_at_one_and_are_unique() {
        let ids = Arc::new(PackIdGen::new());
        assert_eq!(ids.next_id(), 1);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..1000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<i32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert!(all.iter().all(|&id| id >= 2));
    }

    #[test]
    fn test_pack_ids_wrap_to_one_not_negative() {
        let ids = PackIdGen::starting_at(i32::MAX - 1);
        assert_eq!(ids.next_id(), i32::MAX - 1);
        assert_eq!(ids.next_id(), i32::MAX);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_pack_ids_stay_positive_across_threads_at_wrap() {
        let ids = Arc::new(PackIdGen::starting_at(i32::MAX - 500));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..500).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<i32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert!(all.iter().all(|&id| id >= 1));
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 2000);
    }

    #[test]
    fn test_merge_into() {
        let stats = Stats::new();
        let mut a = LocalCounters {
            starts: 10,
            finishes: 10,
            enomem: 3,
            ..Default::default()
        };
        a.record_latency(Duration::from_micros(5));
        let mut b = LocalCounters {
            starts: 5,
            finishes: 4,
            eagain: 7,
            ..Default::default()
        };
        b.record_latency(Duration::from_micros(2));
        b.record_latency(Duration::from_micros(9));
        a.merge_into(&stats);
        b.merge_into(&stats);
        let snap = stats.snapshot();
        assert_eq!(snap.starts, 15);
        assert_eq!(snap.finishes, 14);
        assert_eq!(snap.enomem, 3);
        assert_eq!(snap.eagain, 7);
        assert_eq!(snap.lat_count, 3);
        assert_eq!(snap.lat_min_ns, 2_000);
        assert_eq!(snap.lat_max_ns, 9_000);
    }

    #[test]
    fn test_snapshot_without_latency() {
        let snap = Stats::new().snapshot();
        assert_eq!(snap.lat_min_ns, 0);
        assert_eq!(snap, StatsSnapshot::default());
    }

    #[test]
    fn test_report_rates() {
        let snap = StatsSnapshot {
            starts: 1000,
            finishes: 1000,
            bytes: 4_000_000,
            ..Default::default()
        };
        let report = Report::new(&snap, 2, Duration::from_secs(2));
        assert_eq!(report.commands_per_sec, 500.0);
        assert_eq!(report.mb_per_sec, 2.0);
        assert!(report.latency.is_none());
    }

    #[test]
    fn test_render_hides_zero_counts() {
        let snap = StatsSnapshot {
            starts: 100,
            finishes: 100,
            enomem: 3,
            ..Default::default()
        };
        let report = Report::new(&snap, 1, Duration::from_millis(10));
        let quiet = report.render(false);
        assert!(quiet.contains("ENOMEM retries: 3"));
        assert!(!quiet.contains("EAGAIN"));
        let loud = report.render(true);
        assert!(loud.contains("EAGAIN retries: 0"));
        assert!(loud.contains("Failed workers: 0"));
    }

    #[test]
    fn test_report_serializes() {
        let report = Report::new(&StatsSnapshot::default(), 1, Duration::ZERO);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"commands_per_sec\":0.0"));
        assert!(json.contains("\"latency\":null"));
    }

    #[test]
    fn test_console_lines() {
        #[derive(Clone, Default)]
        struct Sink(Arc<Mutex<Vec<u8>>>);
        impl Write for Sink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let sink = Sink::default();
        let console = Console::new(Box::new(sink.clone()));
        console.line("worker 0: done");
        console.line("worker 1: done");
        let text = String::from_utf8(sink.0.lock().clone()).unwrap();
        assert_eq!(text, "worker 0: done\nworker 1: done\n");
    }

    #[test]
    fn test_entropy_seed() {
        let seed_a = EntropySource::default().seed().unwrap();
        let seed_b = EntropySource::default().seed().unwrap();
        // 2^-64 chance of a false failure
        assert_ne!(seed_a, seed_b);
        assert!(EntropySource::new("/nonexistent/entropy").seed().is_err());
    }
}
