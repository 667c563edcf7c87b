//! Branch / run-id name validation.

use super::error::GitError;

/// Validate a branch or run name: alphanumeric, hyphens, underscores,
/// slashes, dots. Rejects path traversal (`..`), leading dashes, lock-file
/// suffixes, and control or shell characters.
pub fn validate_name(name: &str) -> Result<(), GitError> {
    if name.is_empty() {
        return Err(GitError::InvalidName("name cannot be empty".into()));
    }
    if name.starts_with('-') {
        return Err(GitError::InvalidName(format!(
            "name cannot start with a dash: {name}"
        )));
    }
    if name.contains("..") {
        return Err(GitError::InvalidName(format!(
            "name cannot contain '..': {name}"
        )));
    }
    if name.ends_with('/') || name.ends_with(".lock") || name.contains("//") {
        return Err(GitError::InvalidName(format!("not a valid ref name: {name}")));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(GitError::InvalidName(format!(
            "name contains invalid characters: {name}"
        )));
    }
    Ok(())
}
