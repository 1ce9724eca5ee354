//! Fork wire protocol: hand (rootfs fd, cgroup.procs fd) to a Zygote
//!
//! One `AF_UNIX/SOCK_STREAM` connection per fork. Client sends one
//! payload byte with an `SCM_RIGHTS` ancillary message carrying
//! exactly two descriptors, in order (rootfs, cgroup.procs); the
//! Zygote replies with a 4-byte native-endian status, zero meaning
//! the fork landed.

use log::debug;
use std::collections::HashSet;
use std::io::Read;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use zygote_cgroup::Cgroup;
use zygote_core::{Result, ZygoteError};

/// Minimum spare memory (limit - usage) a Zygote needs before it may
/// fork a child
pub const FORK_SPARE_FLOOR_MB: i64 = 3;

fn proto_err(sandbox: &str, reason: String) -> ZygoteError {
    ZygoteError::ForkProtocol {
        sandbox: sandbox.to_string(),
        reason,
    }
}

/// sendmsg one payload byte plus `fds` as a single SCM_RIGHTS
/// control message
fn send_fds(sock: RawFd, fds: &[RawFd]) -> std::io::Result<()> {
    let payload = [0u8; 1];
    let iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: 1,
    };

    let fd_bytes = mem::size_of_val(fds);
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(std::io::Error::other("CMSG_FIRSTHDR null"));
    }
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as usize;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr().cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            fd_bytes,
        );
    }

    let sent = unsafe { libc::sendmsg(sock, &msg, 0) };
    if sent != 1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Connect to the Zygote's comms socket, pass the two descriptors,
/// and wait for its verdict. Non-zero status is a failed fork.
pub fn send_fork_request(
    parent_id: &str,
    sock_path: &Path,
    root_fd: RawFd,
    procs_fd: RawFd,
) -> Result<()> {
    let mut stream = UnixStream::connect(sock_path)
        .map_err(|e| proto_err(parent_id, format!("connect {}: {}", sock_path.display(), e)))?;

    debug!(
        "[SANDBOX {}] fork request: rootFD={} procsFD={}",
        parent_id, root_fd, procs_fd
    );
    send_fds(stream.as_raw_fd(), &[root_fd, procs_fd])
        .map_err(|e| proto_err(parent_id, format!("sendmsg: {}", e)))?;

    let mut status_buf = [0u8; 4];
    stream
        .read_exact(&mut status_buf)
        .map_err(|e| proto_err(parent_id, format!("read status: {}", e)))?;
    let status = i32::from_ne_bytes(status_buf);
    if status != 0 {
        return Err(proto_err(parent_id, format!("non-zero status: {}", status)));
    }
    Ok(())
}

/// Move every PID that appeared in the parent cgroup since `orig`
/// into the child cgroup. Interpreter threads may keep spawning
/// during the handoff, so passes repeat until one moves nothing.
pub fn migrate_pids(
    parent_cg: &Cgroup,
    child_cg: &Cgroup,
    orig: &HashSet<String>,
) -> Result<usize> {
    let mut total = 0;
    loop {
        let mut moved = 0;
        for pid in parent_cg.pids()? {
            if !orig.contains(&pid) {
                child_cg.add_pid(&pid)?;
                moved += 1;
            }
        }
        if moved == 0 {
            break;
        }
        total += moved;
    }
    Ok(total)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Mock Zygote side of the wire, for tests

    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixListener;

    pub struct ReceivedFork {
        pub payload_len: usize,
        pub fds: Vec<RawFd>,
    }

    /// recvmsg one fork request off an accepted connection
    pub fn recv_fork_request(conn: &UnixStream) -> std::io::Result<ReceivedFork> {
        let mut payload = [0u8; 16];
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr().cast(),
            iov_len: payload.len(),
        };

        let cmsg_space = unsafe { libc::CMSG_SPACE((4 * mem::size_of::<RawFd>()) as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_space;

        let received = unsafe { libc::recvmsg(conn.as_raw_fd(), &mut msg, 0) };
        if received < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut fds = Vec::new();
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let (level, kind, len) =
                unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type, (*cmsg).cmsg_len) };
            if level == libc::SOL_SOCKET && kind == libc::SCM_RIGHTS {
                let data_len = len - unsafe { libc::CMSG_LEN(0) } as usize;
                let count = data_len / mem::size_of::<RawFd>();
                for i in 0..count {
                    let mut fd: RawFd = 0;
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            libc::CMSG_DATA(cmsg).add(i * mem::size_of::<RawFd>()),
                            (&mut fd as *mut RawFd).cast::<u8>(),
                            mem::size_of::<RawFd>(),
                        );
                    }
                    fds.push(fd);
                }
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }

        Ok(ReceivedFork {
            payload_len: received as usize,
            fds,
        })
    }

    /// Accept one fork request and answer with `status`
    pub fn serve_one_fork(listener: UnixListener, status: i32) -> std::io::Result<ReceivedFork> {
        let (mut conn, _) = listener.accept()?;
        let received = recv_fork_request(&conn)?;
        conn.write_all(&status.to_ne_bytes())?;
        for fd in &received.fds {
            unsafe { libc::close(*fd) };
        }
        Ok(received)
    }
}
