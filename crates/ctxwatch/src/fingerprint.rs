//! Stable content and path fingerprints.
//!
//! Used for duplicate tool-output detection and for keying per-project state
//! on disk. The hash must not change between releases: persisted directory
//! names depend on it.

/// FNV-1a 64-bit hash.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Stable key for a project path, used as its directory name.
///
/// Trailing separators are ignored so `/repo` and `/repo/` share state.
pub fn project_key(project_path: &str) -> String {
    let trimmed = project_path.trim_end_matches(['/', '\\']);
    let normalized = if trimmed.is_empty() { project_path } else { trimmed };
    format!("{:016x}", fnv1a(normalized.as_bytes()))
}
