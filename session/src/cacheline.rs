use std::fs;

/// Cache line size assumed when the platform does not expose one.
pub const DEFAULT_CACHE_LINE: u64 = 64;

/// Read the native cache line size from `/proc/cpuinfo`.
///
/// Falls back to [DEFAULT_CACHE_LINE] when the file is unavailable (non-Linux
/// platforms, restricted environments) or does not carry a `clflush size`
/// field.
pub fn native_cache_line_size() -> u64 {
    let size = fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|cpuinfo| parse_clflush_size(&cpuinfo))
        .unwrap_or(DEFAULT_CACHE_LINE);
    log::debug!(target: "session", "native cache line size: {size}");
    size
}

fn parse_clflush_size(cpuinfo: &str) -> Option<u64> {
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim() != "clflush size" {
            continue;
        }
        match value.trim().parse::<u64>() {
            Ok(0) | Err(_) => return None,
            Ok(size) => return Some(size),
        }
    }
    None
}
