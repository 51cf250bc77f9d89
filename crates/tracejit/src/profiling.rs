//! Compile-time profiling: scoped timers and cache counters.
//!
//! Everything here compiles to no-ops unless the `profiler` feature is on.

#[cfg(feature = "profiler")]
use std::cell::RefCell;
#[cfg(feature = "profiler")]
use std::collections::HashMap;
#[cfg(feature = "profiler")]
use std::sync::{Mutex, OnceLock};
#[cfg(feature = "profiler")]
use std::time::{Duration, Instant};

use serde::Serialize;

#[cfg_attr(not(feature = "profiler"), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ProfilerKey {
    Compile(&'static str),
    CompilePass(&'static str),
    Cache(&'static str),
}

#[cfg(feature = "profiler")]
#[derive(Default, Clone, Copy)]
struct Stats {
    calls: u64,
    exclusive_ns: u128,
    inclusive_ns: u128,
}

#[cfg(feature = "profiler")]
struct Profiler {
    stats: Mutex<HashMap<ProfilerKey, Stats>>,
}

#[cfg(feature = "profiler")]
impl Profiler {
    fn instance() -> &'static Self {
        static INSTANCE: OnceLock<Profiler> = OnceLock::new();
        INSTANCE.get_or_init(|| Profiler {
            stats: Mutex::new(HashMap::new()),
        })
    }

    fn record(&self, key: ProfilerKey, exclusive: Duration, inclusive: Duration) {
        let mut stats = self.stats.lock().expect("profiler mutex poisoned");
        let entry = stats.entry(key).or_default();
        entry.calls = entry.calls.saturating_add(1);
        entry.exclusive_ns = entry.exclusive_ns.saturating_add(exclusive.as_nanos());
        entry.inclusive_ns = entry.inclusive_ns.saturating_add(inclusive.as_nanos());
    }

    fn take(&self) -> HashMap<ProfilerKey, Stats> {
        std::mem::take(&mut *self.stats.lock().expect("profiler mutex poisoned"))
    }
}

#[cfg(feature = "profiler")]
struct GuardFrame {
    key: ProfilerKey,
    start: Instant,
    child_time: Duration,
}

#[cfg(feature = "profiler")]
thread_local! {
    static ACTIVE_GUARDS: RefCell<Vec<GuardFrame>> = const { RefCell::new(Vec::new()) };
}

/// RAII timer; records inclusive and exclusive time on drop.
pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    key: ProfilerKey,
}

impl ScopeGuard {
    #[inline(always)]
    fn new(key: ProfilerKey) -> Self {
        #[cfg(feature = "profiler")]
        {
            ACTIVE_GUARDS.with(|stack| {
                stack.borrow_mut().push(GuardFrame {
                    key,
                    start: Instant::now(),
                    child_time: Duration::ZERO,
                });
            });
            ScopeGuard { key }
        }
        #[cfg(not(feature = "profiler"))]
        {
            let _ = key;
            ScopeGuard {}
        }
    }
}

#[cfg(feature = "profiler")]
impl Drop for ScopeGuard {
    fn drop(&mut self) {
        ACTIVE_GUARDS.with(|stack| {
            let mut stack = stack.borrow_mut();
            let Some(frame) = stack.pop() else {
                return;
            };
            debug_assert!(frame.key == self.key, "scope guard stack corrupted");
            let elapsed = frame.start.elapsed();
            let exclusive = elapsed.saturating_sub(frame.child_time);
            Profiler::instance().record(frame.key, exclusive, elapsed);
            if let Some(parent) = stack.last_mut() {
                parent.child_time = parent.child_time.saturating_add(elapsed);
            }
        });
    }
}

#[inline(always)]
pub fn compile_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::Compile(name))
}

#[inline(always)]
pub fn compile_pass_scope(name: &'static str) -> ScopeGuard {
    ScopeGuard::new(ProfilerKey::CompilePass(name))
}

#[inline(always)]
pub fn cache_event(name: &'static str) {
    #[cfg(feature = "profiler")]
    {
        Profiler::instance().record(ProfilerKey::Cache(name), Duration::ZERO, Duration::ZERO);
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub name: String,
    pub calls: u64,
    pub excl_ms: f64,
    pub incl_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfilerReport {
    pub compile: Vec<ReportRow>,
    pub passes: Vec<ReportRow>,
    pub cache: Vec<ReportRow>,
}

impl ProfilerReport {
    /// Number of times the counter `name` fired, if it fired at all.
    pub fn cache_count(&self, name: &str) -> Option<u64> {
        self.cache
            .iter()
            .find(|row| row.name == name)
            .map(|row| row.calls)
    }
}

/// Clears all collected statistics.
pub fn reset() {
    #[cfg(feature = "profiler")]
    {
        Profiler::instance().take();
    }
}

/// Drains collected statistics into a report; `None` without the `profiler` feature.
pub fn take_report() -> Option<ProfilerReport> {
    #[cfg(feature = "profiler")]
    {
        let mut report = ProfilerReport::default();
        for (key, stats) in Profiler::instance().take() {
            let (bucket, name) = match key {
                ProfilerKey::Compile(name) => (&mut report.compile, name),
                ProfilerKey::CompilePass(name) => (&mut report.passes, name),
                ProfilerKey::Cache(name) => (&mut report.cache, name),
            };
            bucket.push(ReportRow {
                name: name.to_string(),
                calls: stats.calls,
                excl_ms: stats.exclusive_ns as f64 / 1e6,
                incl_ms: stats.inclusive_ns as f64 / 1e6,
            });
        }
        for bucket in [&mut report.compile, &mut report.passes, &mut report.cache] {
            bucket.sort_by(|a, b| a.name.cmp(&b.name));
        }
        Some(report)
    }
    #[cfg(not(feature = "profiler"))]
    {
        None
    }
}

pub fn take_report_json() -> Option<String> {
    take_report().and_then(|report| serde_json::to_string(&report).ok())
}
