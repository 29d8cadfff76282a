use std::path::{Path, PathBuf};

use crate::app::models::Device;

pub fn validate_device_path(path: &str) -> Result<(), String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err("device path is required".to_string());
    }
    if !trimmed.starts_with('/') {
        return Err("device path must be absolute and start with '/'".to_string());
    }
    if trimmed.contains('\0') {
        return Err("device path contains invalid characters".to_string());
    }
    if trimmed == "/" {
        return Err("device path must not be root".to_string());
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err("device path must not contain '..' segments".to_string());
    }
    Ok(())
}

/// Last non-empty segment of a device path.
pub fn device_basename(device_path: &str) -> Option<&str> {
    device_path
        .trim()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
}

/// Where `pull <remote> <local>` lands: inside `local` when it is an existing directory.
pub fn pull_destination(remote_path: &str, local_path: &Path) -> PathBuf {
    match device_basename(remote_path) {
        Some(name) if local_path.is_dir() => local_path.join(name),
        _ => local_path.to_path_buf(),
    }
}

/// Where `push <local> <remote>` lands: inside `remote` when it names a directory (trailing '/').
pub fn push_destination(local_path: &Path, remote_path: &str) -> String {
    let trimmed = remote_path.trim();
    if !trimmed.ends_with('/') {
        return trimmed.to_string();
    }
    match local_path.file_name() {
        Some(name) => format!("{trimmed}{}", name.to_string_lossy()),
        None => trimmed.trim_end_matches('/').to_string(),
    }
}

pub fn sanitize_component(value: &str) -> String {
    value.trim().replace([':', '.'], "_")
}

/// `<root>/<model>-<serial>` with ':' and '.' flattened in both parts.
pub fn device_artifact_dir(root: &Path, device: &Device) -> PathBuf {
    root.join(format!(
        "{}-{}",
        sanitize_component(&device.model),
        sanitize_component(&device.serial)
    ))
}
