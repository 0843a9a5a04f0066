use chrono::Utc;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Exclusive advisory lock held for the lifetime of the hub process. A second
/// hub started against the same socket fails to take it and exits.
pub struct HubLock {
    file: File,
}

impl HubLock {
    pub fn try_acquire(path: &Path, socket_path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        let metadata = format!(
            "owner_pid={}\nsocket={}\nacquired_at={}\n",
            std::process::id(),
            socket_path.display(),
            Utc::now().to_rfc3339(),
        );
        file.set_len(0)?;
        file.write_all(metadata.as_bytes())?;
        file.flush()?;

        Ok(Some(Self { file }))
    }
}

impl Drop for HubLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
