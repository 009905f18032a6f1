use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct DiskStatus {
    pub all: u64,
    pub used: u64,
    pub free: u64,
}

/// Free/used bytes of the filesystem holding `path`.
#[cfg(unix)]
pub fn disk_usage(path: &Path) -> Result<DiskStatus> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
    let frag = stat.fragment_size() as u64;
    let all = stat.blocks() as u64 * frag;
    let free = stat.blocks_free() as u64 * frag;
    Ok(DiskStatus {
        all,
        used: all - free,
        free,
    })
}

#[cfg(not(unix))]
pub fn disk_usage(_path: &Path) -> Result<DiskStatus> {
    Err(crate::error::Error::ErrOthers(
        "disk usage unsupported on this platform".to_owned(),
    ))
}
