use std::io::Write;
use std::path::Path;
use crate::config::Preallocation;

const ZERO_CHUNK: usize = 1024 * 1024;

pub(crate) fn preallocate_sync(path: &Path, size: u64, strategy: Preallocation) -> std::io::Result<()> {

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;

    match strategy {
        Preallocation::None => {}
        Preallocation::Sparse => file.set_len(size)?,
        Preallocation::Full => {
            let mut file = file;
            let zeros = vec![0u8; ZERO_CHUNK.min(size as usize).max(1)];
            let mut remaining = size;
            while remaining > 0 {
                let n = (remaining as usize).min(zeros.len());
                file.write_all(&zeros[..n])?;
                remaining -= n as u64;
            }
            file.flush()?;
        }
        Preallocation::Native => native(&file, size)?,
    }

    tracing::debug!("preallocated {} bytes for {:?} using {:?}", size, path, strategy);
    Ok(())
}

// posix_fallocate reserves real extents on Linux; set_len maps to
// SetEndOfFile on Windows; everything else gets a sparse file.
#[cfg(target_os = "linux")]
fn native(file: &std::fs::File, size: u64) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    nix::fcntl::posix_fallocate(file.as_raw_fd(), 0, size as i64)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

#[cfg(windows)]
fn native(file: &std::fs::File, size: u64) -> std::io::Result<()> {
    file.set_len(size)
}

#[cfg(not(any(target_os = "linux", windows)))]
fn native(file: &std::fs::File, size: u64) -> std::io::Result<()> {
    file.set_len(size)
}
