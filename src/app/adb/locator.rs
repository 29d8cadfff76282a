use std::path::{Path, PathBuf};

use crate::app::error::AppError;

pub const DEFAULT_TRANSPORT: &str = "adb";

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

pub fn resolve_transport_program(config_command_path: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if normalized.is_empty() {
        DEFAULT_TRANSPORT.to_string()
    } else {
        normalized
    }
}

/// Looks a bare program name up on `PATH`.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .flat_map(|dir| {
            let candidate = dir.join(program);
            if cfg!(windows) {
                vec![candidate.with_extension("exe"), candidate]
            } else {
                vec![candidate]
            }
        })
        .find(|candidate| candidate.is_file())
}

pub fn validate_transport_program(program: &str, trace_id: &str) -> Result<(), AppError> {
    if program.trim().is_empty() {
        return Err(AppError::validation("Transport command is empty", trace_id));
    }
    let path = Path::new(program);
    let is_bare_name = path.components().count() == 1 && !path.is_absolute();
    if is_bare_name {
        return match find_on_path(program) {
            Some(_) => Ok(()),
            None => Err(AppError::command_not_found(
                format!("Transport '{program}' was not found on PATH"),
                trace_id,
            )),
        };
    }
    if path.is_dir() {
        return Err(AppError::validation(
            "Transport path must point to an executable file",
            trace_id,
        ));
    }
    if !path.exists() {
        return Err(AppError::command_not_found(
            "Transport executable not found at the configured path",
            trace_id,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::error::ErrorKind;

    #[test]
    fn strips_wrapping_quotes() {
        assert_eq!(
            normalize_command_path("  \"/opt/android/platform-tools/adb\"  "),
            "/opt/android/platform-tools/adb"
        );
        assert_eq!(
            normalize_command_path("  '/opt/android/platform-tools/adb'  "),
            "/opt/android/platform-tools/adb"
        );
    }

    #[test]
    fn resolves_empty_to_default_transport() {
        assert_eq!(resolve_transport_program(""), "adb");
        assert_eq!(resolve_transport_program("   "), "adb");
    }

    #[test]
    fn missing_path_is_command_not_found() {
        let err = validate_transport_program("/this/path/should/not/exist/adb", "t").unwrap_err();
        assert_eq!(err.kind, ErrorKind::CommandNotFound);
    }

    #[test]
    fn missing_bare_name_is_command_not_found() {
        let err =
            validate_transport_program("definitely-not-a-real-transport-binary", "t").unwrap_err();
        assert_eq!(err.kind, ErrorKind::CommandNotFound);
    }

    #[test]
    fn directory_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = validate_transport_program(&dir.path().to_string_lossy(), "t").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
