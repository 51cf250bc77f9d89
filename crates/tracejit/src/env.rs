use std::env;
use std::sync::OnceLock;

static TRACEJIT_DISABLE_COMPILE: OnceLock<bool> = OnceLock::new();
static TRACEJIT_CACHE_CAPACITY: OnceLock<usize> = OnceLock::new();
static TRACEJIT_MAX_FUSED_INPUTS: OnceLock<usize> = OnceLock::new();
static TRACEJIT_PASS_STATS: OnceLock<bool> = OnceLock::new();

const DEFAULT_CACHE_CAPACITY: usize = 64;
const DEFAULT_MAX_FUSED_INPUTS: usize = 24;

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn read_bool(name: &str) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

fn read_usize(name: &str, default: usize) -> usize {
    match env::var(name) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed > 0 => parsed,
            _ => {
                log::warn!("ignoring invalid {name}={value:?}; using {default}");
                default
            }
        },
        Err(_) => default,
    }
}

/// Initial state of the global compile switch.
pub(crate) fn compile_disabled_by_env() -> bool {
    *TRACEJIT_DISABLE_COMPILE.get_or_init(|| read_bool("TRACEJIT_DISABLE_COMPILE"))
}

/// Maximum number of compiled graphs kept per function.
pub(crate) fn cache_capacity() -> usize {
    *TRACEJIT_CACHE_CAPACITY
        .get_or_init(|| read_usize("TRACEJIT_CACHE_CAPACITY", DEFAULT_CACHE_CAPACITY))
}

pub(crate) fn max_fused_inputs() -> usize {
    *TRACEJIT_MAX_FUSED_INPUTS
        .get_or_init(|| read_usize("TRACEJIT_MAX_FUSED_INPUTS", DEFAULT_MAX_FUSED_INPUTS))
}

pub(crate) fn pass_stats_enabled() -> bool {
    *TRACEJIT_PASS_STATS.get_or_init(|| read_bool("TRACEJIT_PASS_STATS"))
}
