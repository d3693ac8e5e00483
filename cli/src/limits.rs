//! Parsing of human-readable resource limit flags into the wire types.

use std::collections::BTreeMap;

use protobuf::job::v1::{IoDeviceLimits, IoLimits, MemoryLimits};

/// Parses a CPU limit into millicores. Accepts a whole number of cores
/// (e.g. `4`) or a millicore count (e.g. `100m`).
pub fn parse_cpu_limit(cpus: &str) -> Result<i64, String> {
    if let Some(millis) = cpus.strip_suffix('m') {
        return millis
            .parse::<i64>()
            .map_err(|err| format!("invalid value for cpu limit: {err}"));
    }
    cpus.parse::<i64>()
        .map(|n| n * 1000)
        .map_err(|err| format!("invalid value for cpu limit: {err}"))
}

/// Parses a memory size with a decimal (`k`, `M`, `G`) or binary (`Ki`,
/// `Mi`, `Gi`) suffix into bytes.
pub fn parse_memory_limit(limit: &str) -> Result<i64, String> {
    const UNITS: &[(&str, i64)] = &[
        ("Ki", 1024),
        ("Mi", 1024 * 1024),
        ("Gi", 1024 * 1024 * 1024),
        ("k", 1000),
        ("M", 1000 * 1000),
        ("G", 1000 * 1000 * 1000),
    ];
    for (suffix, multiplier) in UNITS {
        if let Some(value) = limit.strip_suffix(suffix) {
            return value
                .parse::<i64>()
                .map(|n| n * multiplier)
                .map_err(|err| format!("invalid memory limit {limit:?}: {err}"));
        }
    }
    Err(format!(
        "unknown memory limit format: {limit} (expecting k, M, G, Ki, Mi, Gi suffix)"
    ))
}

pub fn parse_memory_limits(
    soft_limit: Option<&str>,
    limit: Option<&str>,
) -> Result<MemoryLimits, String> {
    let mut limits = MemoryLimits::default();
    if let Some(soft) = soft_limit {
        limits.soft_limit = Some(
            parse_memory_limit(soft)
                .map_err(|err| format!("invalid value for memory soft limit: {err}"))?,
        );
    }
    if let Some(hard) = limit {
        limits.limit = Some(
            parse_memory_limit(hard)
                .map_err(|err| format!("invalid value for memory limit: {err}"))?,
        );
    }
    Ok(limits)
}

/// Parses per-device IO limit flags of the form `<id|path>=<limit>` and
/// merges them into one entry per device.
pub fn parse_io_limits(
    read_bps: &[String],
    write_bps: &[String],
    read_iops: &[String],
    write_iops: &[String],
) -> Result<Vec<IoDeviceLimits>, String> {
    let mut devices: BTreeMap<String, IoLimits> = BTreeMap::new();

    let mut merge = |entries: &[String],
                     set: fn(&mut IoLimits, i64)|
     -> Result<(), String> {
        for entry in entries {
            let (device, value) = entry
                .split_once('=')
                .ok_or_else(|| format!("invalid device limit {entry:?} (expecting <device>=<limit>)"))?;
            let value = value
                .parse::<i64>()
                .map_err(|err| format!("invalid device limit {entry:?}: {err}"))?;
            set(devices.entry(device.to_owned()).or_default(), value);
        }
        Ok(())
    };

    merge(read_bps, |l, v| l.read_bps = Some(v))?;
    merge(write_bps, |l, v| l.write_bps = Some(v))?;
    merge(read_iops, |l, v| l.read_iops = Some(v))?;
    merge(write_iops, |l, v| l.write_iops = Some(v))?;

    Ok(devices
        .into_iter()
        .map(|(device, limits)| IoDeviceLimits {
            device,
            limits: Some(limits),
        })
        .collect())
}
