//! Small helpers — id generation, path resolution, string manipulation.

use std::path::PathBuf;

/// Generate a short random hex id of `len` characters (max 32).
///
/// Message ids use 12 chars, subagent task ids 8. Uniqueness is only
/// required within one process lifetime.
pub fn gen_hex_id(len: usize) -> String {
    let full = uuid::Uuid::new_v4().simple().to_string();
    full[..len.min(32)].to_string()
}

/// Get the NiBot data directory (e.g. `~/.nibot/`).
pub fn get_data_path() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nibot")
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
        if path == "~" {
            home
        } else {
            home.join(&path[2..])
        }
    } else {
        PathBuf::from(path)
    }
}

/// Sanitize a session key for use as a filename: `:`, `/` and `\` become `_`.
pub fn safe_filename(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            ':' | '/' | '\\' => '_',
            other => other,
        })
        .collect()
}

/// Truncate a string to `max_len` characters, appending `…` if cut.
/// Unicode-safe.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
