use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const STAGING_PREFIX: &str = ".handover.partial.";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Writes `bytes` to `target` so readers see either the old file or the
/// complete new one. Parent directories are created as needed.
pub fn atomic_write(target: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        Some(_) => Path::new("."),
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("`{}` is not a file path", target.display()),
            ));
        }
    };
    fs::create_dir_all(dir)?;

    let staging = staging_path(dir, target)?;
    let result = stage_and_swap(&staging, target, bytes).and_then(|()| sync_dir(dir));
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

fn stage_and_swap(staging: &Path, target: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(staging)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    if let Err(err) = fs::rename(staging, target) {
        // Platforms without replace-on-rename need the target gone first.
        if !target.exists() {
            return Err(err);
        }
        fs::remove_file(target)?;
        fs::rename(staging, target)?;
    }
    Ok(())
}

fn staging_path(dir: &Path, target: &Path) -> io::Result<PathBuf> {
    let name = target
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no file name"))?;
    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    Ok(dir.join(format!(
        "{STAGING_PREFIX}{name}.{}.{seq}",
        std::process::id()
    )))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
