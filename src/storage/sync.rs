//! Platform-specific file synchronization for the WAL.
//!
//! Linux gets `fdatasync`; macOS needs `F_FULLFSYNC` to defeat the drive
//! write cache; everything else falls back to a full `fsync`.

use std::fs::File;
use std::io;

#[cfg(target_os = "linux")]
pub fn sync_file(file: &File) -> io::Result<()> {
    file.sync_data()
}

#[cfg(target_os = "macos")]
pub fn sync_file(file: &File) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn sync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}
