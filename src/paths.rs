//! Path display helpers for progress titles.
//!
//! Commands and file paths reported by engines are absolute more often than
//! not; relativizing them against the run's working directory keeps progress
//! lines readable in chat.

use std::path::Path;

pub fn relativize_path(value: &str, base: Option<&Path>) -> String {
    if value.is_empty() {
        return value.to_string();
    }
    let base = match base {
        Some(base) => base.to_path_buf(),
        None => match std::env::current_dir() {
            Ok(cwd) => cwd,
            Err(_) => return value.to_string(),
        },
    };
    let base_str = base.to_string_lossy();
    if base_str.is_empty() {
        return value.to_string();
    }
    if value == base_str {
        return ".".to_string();
    }
    let prefix = if base_str.ends_with('/') {
        base_str.to_string()
    } else {
        format!("{base_str}/")
    };
    if let Some(suffix) = value.strip_prefix(&prefix) {
        if suffix.is_empty() {
            return ".".to_string();
        }
        return suffix.to_string();
    }
    value.to_string()
}

/// Strip `<base>/` anywhere inside a shell command string.
pub fn relativize_command(value: &str, base: Option<&Path>) -> String {
    let base = match base {
        Some(base) => base.to_path_buf(),
        None => match std::env::current_dir() {
            Ok(cwd) => cwd,
            Err(_) => return value.to_string(),
        },
    };
    let prefix = format!("{}/", base.to_string_lossy());
    value.replace(&prefix, "")
}
