//! Temp-then-rename file replacement.

use std::io::Write;
use std::path::Path;

use th_core::{Error, Result};

/// Replace `path` with `contents` so readers see either the old file or the
/// complete new one, never a partial write.
///
/// The temp file is created next to the target so the final rename stays on
/// one filesystem.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent directory", path.display())))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::from(e.error))?;
    Ok(())
}
