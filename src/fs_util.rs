use std::path::{Path, PathBuf};

/// Resolve the user's home directory, or error if unset.
pub fn home_dir() -> anyhow::Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| anyhow::anyhow!("HOME environment variable is not set"))
}

/// Directory holding config and learned rules: the parent of
/// `RULEWEAVE_CONFIG` when set, else `~/.ruleweave`.
pub fn state_dir() -> PathBuf {
    if let Ok(path) = std::env::var("RULEWEAVE_CONFIG") {
        if let Some(parent) = PathBuf::from(path).parent() {
            return parent.to_path_buf();
        }
    }
    home_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".ruleweave")
}

/// Create `dir` (and parents) readable only by the owner.
pub fn ensure_private_dir(dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| anyhow::anyhow!("failed to create {}: {e}", dir.display()))?;
    restrict(dir, 0o700)
}

/// Replace `path` with `contents` through a sibling temp file, so readers
/// never see a half-written file. The result is owner-only.
pub fn write_private(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)
        .map_err(|e| anyhow::anyhow!("failed to write {}: {e}", tmp.display()))?;
    restrict(&tmp, 0o600)?;
    std::fs::rename(&tmp, path)
        .map_err(|e| anyhow::anyhow!("failed to move {} into place: {e}", path.display()))
}

/// Owner-only permissions: `0o700` for directories, `0o600` for files.
/// A no-op off unix.
#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| anyhow::anyhow!("failed to chmod {mode:o} {}: {e}", path.display()))
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> anyhow::Result<()> {
    Ok(())
}
