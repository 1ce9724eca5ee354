//! Bind-mount primitives for sandbox root assembly

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use zygote_core::{Result, ZygoteError};

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| ZygoteError::MountFailed {
        target: path.display().to_string(),
        reason: "path contains a nul byte".to_string(),
    })
}

fn mount_err(target: &Path, what: &str) -> ZygoteError {
    ZygoteError::MountFailed {
        target: target.display().to_string(),
        reason: format!("{}: {}", what, io::Error::last_os_error()),
    }
}

/// Bind `source` onto `target`
pub fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    let source_c = path_cstring(source)?;
    let target_c = path_cstring(target)?;
    let ret = unsafe {
        libc::mount(
            source_c.as_ptr(),
            target_c.as_ptr(),
            ptr::null(),
            libc::MS_BIND,
            ptr::null(),
        )
    };
    if ret != 0 {
        return Err(mount_err(target, "bind mount"));
    }
    Ok(())
}

/// Remount an existing bind read-only. A fresh bind ignores MS_RDONLY,
/// so imposing read-only is always this second remount step.
pub fn remount_readonly(target: &Path) -> Result<()> {
    let target_c = path_cstring(target)?;
    let ret = unsafe {
        libc::mount(
            ptr::null(),
            target_c.as_ptr(),
            ptr::null(),
            libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
            ptr::null(),
        )
    };
    if ret != 0 {
        return Err(mount_err(target, "read-only remount"));
    }
    Ok(())
}

/// Mark the mount private so later mount events under it do not
/// propagate to the host
pub fn make_private(target: &Path) -> Result<()> {
    let none = CString::new("none").expect("static str");
    let target_c = path_cstring(target)?;
    let ret = unsafe {
        libc::mount(
            none.as_ptr(),
            target_c.as_ptr(),
            ptr::null(),
            libc::MS_PRIVATE,
            ptr::null(),
        )
    };
    if ret != 0 {
        return Err(mount_err(target, "private propagation"));
    }
    Ok(())
}

/// Lazy-detach whatever is mounted at `target`. Nothing mounted there
/// (EINVAL) or no such path (ENOENT) is not an error.
pub fn unmount_detach(target: &Path) -> Result<()> {
    let target_c = path_cstring(target)?;
    let ret = unsafe { libc::umount2(target_c.as_ptr(), libc::MNT_DETACH) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINVAL) && err.raw_os_error() != Some(libc::ENOENT) {
            return Err(ZygoteError::MountFailed {
                target: target.display().to_string(),
                reason: format!("detach: {}", err),
            });
        }
    }
    Ok(())
}
