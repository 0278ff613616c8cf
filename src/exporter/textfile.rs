//! Atomic writes of `.prom` files for the node_exporter textfile collector.
//!
//! The collector may read the file at any moment, so the text is written to
//! a temporary file in the same directory and renamed over the target.

use tempfile::NamedTempFile;

use std::io::{self, Write};
use std::path::Path;

/// Replaces `path` with `text` in a single rename.
pub fn write(path: &Path, text: &str) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(text.as_bytes())?;
    file.as_file().sync_all()?;

    // the temporary file is created 0600, the collector runs as another user
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }

    file.persist(path).map_err(|e| e.error)?;

    Ok(())
}
