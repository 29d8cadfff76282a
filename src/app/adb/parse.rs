use regex::Regex;

use crate::app::models::DeviceEntry;

/// Parses `devices` output. The header and daemon banner lines are skipped.
pub fn parse_adb_devices(output: &str) -> Vec<DeviceEntry> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let serial = tokens.next()?.to_string();
            let status = tokens.next()?.to_string();
            Some(DeviceEntry { serial, status })
        })
        .collect()
}

/// A single `getprop <key>` value; blank output means "unavailable".
pub fn parse_getprop_value(output: &str) -> String {
    output
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Parses `du -s <path>` output (`<sizeKB>\t<path>`) into kilobytes.
pub fn parse_du_size_kb(output: &str) -> Option<u64> {
    let size_re = Regex::new(r"^\s*(\d+)\s+\S").ok()?;
    output.lines().find_map(|line| {
        size_re
            .captures(line)
            .and_then(|caps| caps[1].parse::<u64>().ok())
    })
}
