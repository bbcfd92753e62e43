//! Worker-count derivation from available CPU cores.

use tracing::warn;

pub const DEFAULT_CPU_CORES: usize = 4;
pub const MIN_CPU_CORES: usize = 1;

/// Bounds `value` between `minimum` and `maximum` inclusive.
pub fn clamp(value: usize, minimum: usize, maximum: usize) -> usize {
    value.max(minimum).min(maximum)
}

/// Parses the `CPU_CORES` value, falling back to the default on garbage.
pub fn parse_cpu_cores(raw: Option<&str>) -> usize {
    let Some(raw) = raw else {
        return DEFAULT_CPU_CORES;
    };
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return DEFAULT_CPU_CORES;
    }
    match cleaned.parse::<i64>() {
        Ok(parsed) if parsed >= MIN_CPU_CORES as i64 => parsed as usize,
        Ok(_) => MIN_CPU_CORES,
        Err(_) => {
            warn!(value = cleaned, default = DEFAULT_CPU_CORES, "Invalid CPU_CORES, using default");
            DEFAULT_CPU_CORES
        }
    }
}

/// Derives the worker pool size from the core count: `clamp(cores/4, 1, 8)`.
pub fn derive_workers(cpu_cores: usize) -> usize {
    let cores = cpu_cores.max(MIN_CPU_CORES);
    clamp(cores / 4, 1, 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults_and_garbage() {
        assert_eq!(parse_cpu_cores(None), DEFAULT_CPU_CORES);
        assert_eq!(parse_cpu_cores(Some("")), DEFAULT_CPU_CORES);
        assert_eq!(parse_cpu_cores(Some("banana")), DEFAULT_CPU_CORES);
        assert_eq!(parse_cpu_cores(Some("0")), MIN_CPU_CORES);
        assert_eq!(parse_cpu_cores(Some(" 16 ")), 16);
    }

    #[test]
    fn worker_derivation_clamps() {
        assert_eq!(derive_workers(1), 1);
        assert_eq!(derive_workers(4), 1);
        assert_eq!(derive_workers(8), 2);
        assert_eq!(derive_workers(16), 4);
        assert_eq!(derive_workers(64), 8);
    }
}
