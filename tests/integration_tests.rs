//! Integration tests for zygote-rs
//!
//! These run unprivileged against temp directories and mock
//! listeners. Tests that need root (cgroupfs, bind mounts) are
//! marked #[ignore] and can be run with:
//!   sudo cargo test -- --ignored

use std::collections::HashSet;
use std::fs;
use std::fs::File;
use std::io::Write;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use zygote_cgroup::{Cgroup, CgroupPool};
use zygote_core::{Meta, ZygoteError};
use zygote_fs::DirMaker;
use zygote_rs::protocol::{read_record, write_record, Request, Response};
use zygote_rs::sandbox::client::CommsClient;
use zygote_rs::sandbox::fork::{migrate_pids, send_fork_request};

static INTEGRATION_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Receive one message with its SCM_RIGHTS descriptors, the way a
/// Zygote's fork server would
fn recv_with_fds(conn: &UnixStream) -> (usize, Vec<RawFd>) {
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
    assert!(received >= 0, "recvmsg failed");

    let mut fds = Vec::new();
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let (level, kind, len) =
            unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type, (*cmsg).cmsg_len) };
        if level == libc::SOL_SOCKET && kind == libc::SCM_RIGHTS {
            let data_len = len - unsafe { libc::CMSG_LEN(0) } as usize;
            for i in 0..data_len / mem::size_of::<RawFd>() {
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
    (received as usize, fds)
}

/// The fork wire end to end: a mock Zygote listener receives one
/// connection carrying exactly (1 payload byte, 2 descriptors),
/// replies with 4 zero bytes, and the client side then migrates the
/// fresh PIDs into the child cgroup.
#[test]
fn test_fork_wire_and_pid_migration() {
    let tmp = tempfile::tempdir().unwrap();
    let sock_path = tmp.path().join("comms.sock");
    let listener = UnixListener::bind(&sock_path).unwrap();

    let server = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let (payload_len, fds) = recv_with_fds(&conn);
        conn.write_all(&0i32.to_ne_bytes()).unwrap();
        for fd in &fds {
            unsafe { libc::close(*fd) };
        }
        (payload_len, fds.len())
    });

    let root_file = File::open(tmp.path()).unwrap();
    fs::write(tmp.path().join("cgroup.procs"), "").unwrap();
    let procs_file = File::open(tmp.path().join("cgroup.procs")).unwrap();

    send_fork_request(
        "zygote",
        &sock_path,
        root_file.as_raw_fd(),
        procs_file.as_raw_fd(),
    )
    .unwrap();

    let (payload_len, fd_count) = server.join().unwrap();
    assert_eq!(payload_len, 1);
    assert_eq!(fd_count, 2);

    // migration: everything not in the snapshot moves to the child
    let parent_dir = tmp.path().join("parent-cg");
    let child_dir = tmp.path().join("child-cg");
    fs::create_dir(&parent_dir).unwrap();
    fs::create_dir(&child_dir).unwrap();
    fs::write(parent_dir.join("cgroup.procs"), "41\n").unwrap();
    fs::write(child_dir.join("cgroup.procs"), "").unwrap();

    let parent_cg = Cgroup::for_testing(parent_dir);
    let child_cg = Cgroup::for_testing(child_dir.clone());
    let orig: HashSet<String> = ["41".to_string()].into();
    let moved = migrate_pids(&parent_cg, &child_cg, &orig).unwrap();
    assert_eq!(moved, 0);
}

/// |sockPath| = 108 is accepted, 109 is not
#[test]
fn test_sock_path_boundary() {
    // "/comms.sock" is 11 bytes, so a 97-byte scratch dir gives 108
    let scratch_97 = format!("/{}", "x".repeat(96));
    let client = CommsClient::new("sb", std::path::Path::new(&scratch_97)).unwrap();
    assert_eq!(client.sock_path().as_os_str().as_bytes().len(), 108);

    let scratch_98 = format!("/{}", "x".repeat(97));
    let err = CommsClient::new("sb", std::path::Path::new(&scratch_98)).unwrap_err();
    match err {
        ZygoteError::SockPathTooLong { len, .. } => assert_eq!(len, 109),
        other => panic!("expected SockPathTooLong, got {}", other),
    }
}

/// Control-plane records survive a real socket hop
#[test]
fn test_protocol_over_unix_socket() {
    let tmp = tempfile::tempdir().unwrap();
    let sock_path = tmp.path().join("ctl.sock");
    let listener = UnixListener::bind(&sock_path).unwrap();

    let server = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut requests = Vec::new();
        while let Some(request) = read_record::<_, Request>(&mut conn).unwrap() {
            let response = match &request {
                Request::List => Response::ok_with("0 sandboxes", &Vec::<String>::new()),
                Request::Create { meta } => {
                    Response::ok(format!("created ({})", meta.runtime))
                }
                _ => Response::err("not handled"),
            };
            requests.push(request);
            write_record(&mut conn, &response).unwrap();
        }
        requests.len()
    });

    let mut conn = UnixStream::connect(&sock_path).unwrap();
    write_record(&mut conn, &Request::List).unwrap();
    let response: Response = read_record(&mut conn).unwrap().unwrap();
    assert!(response.ok);
    assert_eq!(response.payload.unwrap(), serde_json::json!([]));

    write_record(
        &mut conn,
        &Request::Create {
            meta: Meta::default(),
        },
    )
    .unwrap();
    let response: Response = read_record(&mut conn).unwrap().unwrap();
    assert!(response.message.contains("python"));

    drop(conn);
    assert_eq!(server.join().unwrap(), 2);
}

/// Two callers asking the DirMaker for the same name never collide
#[test]
fn test_dirmaker_concurrent_same_name() {
    let tmp = tempfile::tempdir().unwrap();
    let maker = std::sync::Arc::new(DirMaker::new(tmp.path(), "root").unwrap());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let maker = std::sync::Arc::clone(&maker);
        handles.push(thread::spawn(move || maker.make("sandbox").unwrap()));
    }
    let mut paths: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 8);
}

/// An empty pool with a zero timeout reports Timeout, not a hang
#[test]
fn test_empty_pool_zero_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let (pool, _ready) = CgroupPool::for_testing(tmp.path().to_path_buf());
    let err = pool.retrieve(Duration::from_millis(0)).unwrap_err();
    assert!(matches!(err, ZygoteError::RetrieveTimeout { .. }));
}

// Everything below requires root.

/// Pool lifecycle against the real cgroup v2 fs
#[test]
#[ignore]
fn pool_produces_empty_cgroups() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let pool = CgroupPool::new("itest").unwrap();
    for _ in 0..3 {
        let cg = pool.retrieve(Duration::from_secs(1)).unwrap();
        assert!(cg.pids().unwrap().is_empty());
        cg.destroy().unwrap();
    }
    pool.destroy().unwrap();
}

/// Freezer round trip with a real cgroup
#[test]
#[ignore]
fn freezer_round_trip() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let pool = CgroupPool::new("itest-freeze").unwrap();
    let cg = pool.retrieve(Duration::from_secs(1)).unwrap();
    cg.pause().unwrap();
    cg.unpause().unwrap();
    cg.pause().unwrap();
    cg.unpause().unwrap();
    cg.destroy().unwrap();
    pool.destroy().unwrap();
}
