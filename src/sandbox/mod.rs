//! The sandbox object: root assembly, runtime process, ref-counted
//! parent/child forest
//!
//! A sandbox's cgroup and mounts outlive its own interpreter: forked
//! children share copy-on-write pages with the parent, and only the
//! parent's cgroup is charged for them. `cg_ref_count` is 1 for the
//! sandbox itself plus 1 per live child; physical teardown happens
//! only when it reaches zero, cascading up the ancestor chain.

pub mod bootstrap;
pub mod client;
pub mod fork;

use crate::events::{EventKind, EventSender, SandboxEvent};
use crate::mempool::MemPool;
use bootstrap::BootstrapRenderer;
use client::CommsClient;
use fork::FORK_SPARE_FLOOR_MB;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use zygote_cgroup::Cgroup;
use zygote_core::{Meta, Result, ZygoteError};
use zygote_fs::mount;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Fresh,
    Running,
    Paused,
    Destroying,
    Destroyed,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxState::Fresh => "fresh",
            SandboxState::Running => "running",
            SandboxState::Paused => "paused",
            SandboxState::Destroying => "destroying",
            SandboxState::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

pub struct Sandbox {
    id: String,
    meta: Meta,
    base_image_dir: PathBuf,
    root_dir: PathBuf,
    code_dir: Option<PathBuf>,
    scratch_dir: PathBuf,
    client: CommsClient,
    /// 1 for self, plus 1 for each live child
    cg_ref_count: AtomicI32,
    parent: Option<Arc<Sandbox>>,
    children: Mutex<HashMap<String, Weak<Sandbox>>>,
    state: Mutex<SandboxState>,
    cgroup: Mutex<Option<Cgroup>>,
    events: Option<EventSender>,
    mem: Option<Arc<MemPool>>,
}

impl Sandbox {
    /// Assemble a sandbox: mount its root, render bootstrap code,
    /// apply the cgroup envelope, and (when a parent is given) fork
    /// the interpreter from that Zygote.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        parent: Option<Arc<Sandbox>>,
        base_image_dir: &Path,
        id: &str,
        root_dir: PathBuf,
        code_dir: Option<PathBuf>,
        scratch_dir: PathBuf,
        cgroup: Cgroup,
        meta: Meta,
        renderer: &dyn BootstrapRenderer,
        events: Option<EventSender>,
        mem: Option<Arc<MemPool>>,
    ) -> Result<Arc<Sandbox>> {
        // the socket-path guard runs before anything is mounted
        let client = CommsClient::new(id, &scratch_dir)?;

        if let Some(mem) = &mem {
            mem.reserve(meta.mem_limit_mb)?;
        }
        let unwind_mem = |mem: &Option<Arc<MemPool>>| {
            if let Some(mem) = mem {
                mem.credit(meta.mem_limit_mb);
            }
        };

        if let Err(e) = populate_root(base_image_dir, &root_dir, code_dir.as_deref(), &scratch_dir)
        {
            unwind_root(&root_dir);
            unwind_mem(&mem);
            let _ = cgroup.release();
            return Err(e);
        }

        let setup = bootstrap::write_bootstrap(renderer, id, &meta, &scratch_dir)
            .and_then(|_| cgroup.set_mem_limit_mb(meta.mem_limit_mb))
            .and_then(|_| cgroup.set_cpu_percent(meta.cpu_percent));
        if let Err(e) = setup {
            unwind_root(&root_dir);
            unwind_mem(&mem);
            let _ = cgroup.release();
            return Err(e);
        }

        let sandbox = Arc::new(Sandbox {
            id: id.to_string(),
            meta,
            base_image_dir: base_image_dir.to_path_buf(),
            root_dir,
            code_dir,
            scratch_dir,
            client,
            cg_ref_count: AtomicI32::new(1),
            parent,
            children: Mutex::new(HashMap::new()),
            state: Mutex::new(SandboxState::Fresh),
            cgroup: Mutex::new(Some(cgroup)),
            events,
            mem,
        });

        if let Some(parent) = sandbox.parent.clone() {
            if let Err(e) = parent.fork_child(&sandbox) {
                sandbox.unwind_create();
                return Err(e);
            }
            *sandbox.state.lock().unwrap() = SandboxState::Running;
            sandbox.emit(EventKind::Start, Arc::clone(&sandbox));
            parent.emit(EventKind::Fork, parent.clone());
        }

        info!(
            "[SANDBOX {}] created ({}, leaf={})",
            sandbox.id, sandbox.meta.runtime, sandbox.meta.is_leaf
        );
        Ok(sandbox)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn code_dir(&self) -> Option<&Path> {
        self.code_dir.as_deref()
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn base_image_dir(&self) -> &Path {
        &self.base_image_dir
    }

    pub fn client(&self) -> &CommsClient {
        &self.client
    }

    pub fn parent(&self) -> Option<&Arc<Sandbox>> {
        self.parent.as_ref()
    }

    pub fn state(&self) -> SandboxState {
        *self.state.lock().unwrap()
    }

    pub fn cg_ref_count(&self) -> i32 {
        self.cg_ref_count.load(Ordering::SeqCst)
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    fn emit(&self, kind: EventKind, handle: Arc<Sandbox>) {
        if let Some(events) = &self.events {
            let _ = events.send(SandboxEvent {
                kind,
                sandbox: handle,
            });
        }
    }

    fn with_cgroup<T>(&self, op: &str, f: impl FnOnce(&Cgroup) -> Result<T>) -> Result<T> {
        let guard = self.cgroup.lock().unwrap();
        match guard.as_ref() {
            Some(cg) => f(cg),
            None => Err(ZygoteError::InvalidState {
                sandbox: self.id.clone(),
                state: "released".to_string(),
                op: op.to_string(),
            }),
        }
    }

    /// Launch a fresh interpreter inside the chroot. Only valid for
    /// sandboxes with no parent (Zygote roots and cold leaves);
    /// everything else is born by fork.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.parent.is_some() {
            return Err(ZygoteError::InvalidState {
                sandbox: self.id.clone(),
                state: "forked".to_string(),
                op: "start".to_string(),
            });
        }
        {
            let state = self.state.lock().unwrap();
            if *state != SandboxState::Fresh {
                return Err(ZygoteError::InvalidState {
                    sandbox: self.id.clone(),
                    state: state.to_string(),
                    op: "start".to_string(),
                });
            }
        }

        // the fd is handed to the guest as fd 3 so it can enrol
        // itself with a single write
        let procs_file = self.with_cgroup("start", |cg| cg.open_procs_file())?;

        let runtime = self.meta.runtime;
        let bootstrap_guest = format!("/host/{}", runtime.bootstrap_file());
        let mut command = Command::new(runtime.interpreter());
        command
            .arg(runtime.server_path())
            .arg(&bootstrap_guest)
            .arg("1")
            .arg("true")
            .env_clear();

        let procs_fd = procs_file.as_raw_fd();
        let root_dir = self.root_dir.clone();
        unsafe {
            command.pre_exec(move || {
                if libc::dup2(procs_fd, 3) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                nix::unistd::chroot(&root_dir)
                    .and_then(|_| nix::unistd::chdir("/"))
                    .map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        // the runtime double-forks into the background, so this wait
        // returns promptly
        let status = child.wait()?;
        drop(procs_file);
        if !status.success() {
            return Err(ZygoteError::InvalidState {
                sandbox: self.id.clone(),
                state: format!("runtime exited with {}", status),
                op: "start".to_string(),
            });
        }

        *self.state.lock().unwrap() = SandboxState::Running;
        self.emit(EventKind::Start, Arc::clone(self));
        Ok(())
    }

    /// Freeze the cgroup and hand unused memory back to the pool
    pub fn pause(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != SandboxState::Running {
            return Err(ZygoteError::InvalidState {
                sandbox: self.id.clone(),
                state: state.to_string(),
                op: "pause".to_string(),
            });
        }

        self.with_cgroup("pause", |cg| {
            cg.pause()?;
            let usage = cg.mem_usage_mb()?;
            let new_limit = usage + 1;
            let old_limit = cg.mem_limit_mb();
            if new_limit < old_limit {
                cg.set_mem_limit_mb(new_limit)?;
                if let Some(mem) = &self.mem {
                    mem.credit(old_limit - new_limit);
                }
            }
            Ok(())
        })?;

        *state = SandboxState::Paused;
        drop(state);
        self.emit(EventKind::Pause, Arc::clone(self));
        Ok(())
    }

    /// Raise the memory limit back over current usage, then thaw
    pub fn unpause(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != SandboxState::Paused {
            return Err(ZygoteError::InvalidState {
                sandbox: self.id.clone(),
                state: state.to_string(),
                op: "unpause".to_string(),
            });
        }

        self.with_cgroup("unpause", |cg| {
            let usage = cg.mem_usage_mb()?;
            let new_limit = usage.saturating_sub(1);
            let old_limit = cg.mem_limit_mb();
            if new_limit > old_limit {
                cg.set_mem_limit_mb(new_limit)?;
                if let Some(mem) = &self.mem {
                    mem.debit_forced(new_limit - old_limit);
                }
            }
            cg.unpause()
        })?;

        *state = SandboxState::Running;
        drop(state);
        self.emit(EventKind::Unpause, Arc::clone(self));
        Ok(())
    }

    /// Freeze, kill every process, and give the cgroup back to its
    /// pool. The mounts and the sandbox object survive for children.
    pub fn stop(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut guard = self.cgroup.lock().unwrap();
        if let Some(cg) = guard.take() {
            cg.pause()?;
            cg.kill_all_procs()?;
            if let Some(mem) = &self.mem {
                mem.credit(cg.mem_limit_mb());
            }
            cg.release()?;
        }
        *state = SandboxState::Fresh;
        Ok(())
    }

    /// Logically kill the sandbox. Resources are physically released
    /// once every descendant has exited.
    pub fn destroy(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SandboxState::Destroying || *state == SandboxState::Destroyed {
                // strict mode: a second destroy is a ref-count bug
                return Err(ZygoteError::RefCountUnderflow {
                    sandbox: self.id.clone(),
                });
            }
            *state = SandboxState::Destroying;
        }

        // freeze so nothing inside races the teardown
        {
            let guard = self.cgroup.lock().unwrap();
            if let Some(cg) = guard.as_ref() {
                if let Err(e) = cg.pause() {
                    warn!("[SANDBOX {}] freeze before destroy: {}", self.id, e);
                }
            }
        }

        self.dec_cg_ref_count()?;
        self.emit(EventKind::Destroy, Arc::clone(self));
        Ok(())
    }

    /// Non-forced eviction path: destroy only if observed paused
    pub fn destroy_if_paused(self: &Arc<Self>) -> Result<bool> {
        if self.state() != SandboxState::Paused {
            return Ok(false);
        }
        self.destroy()?;
        Ok(true)
    }

    /// Drop one reference; at zero, tear down the cgroup, the
    /// mounts, and the root dir, then propagate to the parent.
    fn dec_cg_ref_count(self: &Arc<Self>) -> Result<()> {
        let prev = self.cg_ref_count.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            self.cg_ref_count.fetch_add(1, Ordering::SeqCst);
            return Err(ZygoteError::RefCountUnderflow {
                sandbox: self.id.clone(),
            });
        }
        if prev > 1 {
            debug!(
                "[SANDBOX {}] ref-count {} ({} children outstanding)",
                self.id,
                prev - 1,
                self.child_count()
            );
            return Ok(());
        }

        // last reference: teardown is best-effort all the way down so
        // a failed step cannot leak the ones after it
        {
            let mut guard = self.cgroup.lock().unwrap();
            if let Some(cg) = guard.take() {
                if let Err(e) = cg.kill_all_procs() {
                    warn!("[SANDBOX {}] kill procs: {}", self.id, e);
                }
                let limit = cg.mem_limit_mb();
                if let Err(e) = cg.release() {
                    warn!("[SANDBOX {}] release cgroup: {}", self.id, e);
                }
                if let Some(mem) = &self.mem {
                    mem.credit(limit);
                }
            }
        }
        if let Err(e) = mount::unmount_detach(&self.root_dir) {
            warn!("[SANDBOX {}] unmount root: {}", self.id, e);
        }
        if let Err(e) = fs::remove_dir_all(&self.root_dir) {
            warn!("[SANDBOX {}] remove root: {}", self.id, e);
        }
        *self.state.lock().unwrap() = SandboxState::Destroyed;
        info!("[SANDBOX {}] torn down", self.id);

        if let Some(parent) = &self.parent {
            parent.child_exit(&self.id)?;
        }
        Ok(())
    }

    /// A child's resources are gone; drop it and the reference it
    /// held on us
    fn child_exit(self: &Arc<Self>, child_id: &str) -> Result<()> {
        self.children.lock().unwrap().remove(child_id);
        // a logically-dead parent is already out of the evictor's
        // books; only live parents report the priority drop
        let state = self.state();
        if state != SandboxState::Destroying && state != SandboxState::Destroyed {
            self.emit(EventKind::ChildExit, Arc::clone(self));
        }
        self.dec_cg_ref_count()
    }

    /// Fork `child`'s interpreter from this Zygote and migrate the
    /// new PIDs into the child's cgroup.
    fn fork_child(self: &Arc<Self>, child: &Arc<Sandbox>) -> Result<()> {
        let spare = self.with_cgroup("fork", |cg| {
            let usage = cg.mem_usage_mb()? as i64;
            Ok(cg.mem_limit_mb() as i64 - usage)
        })?;
        if spare < FORK_SPARE_FLOOR_MB {
            return Err(ZygoteError::ForkInsufficientSpare {
                sandbox: self.id.clone(),
                spare_mb: spare,
                needed_mb: FORK_SPARE_FLOOR_MB,
            });
        }

        // the child must be reachable (and counted) before any of its
        // processes exist
        self.children
            .lock()
            .unwrap()
            .insert(child.id.clone(), Arc::downgrade(child));
        self.cg_ref_count.fetch_add(1, Ordering::SeqCst);

        let result = self.fork_child_inner(child);
        if result.is_err() {
            self.children.lock().unwrap().remove(&child.id);
            self.cg_ref_count.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    fn fork_child_inner(self: &Arc<Self>, child: &Arc<Sandbox>) -> Result<()> {
        let orig: HashSet<String> =
            self.with_cgroup("fork", |cg| cg.pids())?.into_iter().collect();

        let root_file = File::open(&child.root_dir)?;
        let procs_file = child.with_cgroup("fork", |cg| cg.open_procs_file())?;

        fork::send_fork_request(
            &self.id,
            self.client.sock_path(),
            root_file.as_raw_fd(),
            procs_file.as_raw_fd(),
        )?;

        let guard = self.cgroup.lock().unwrap();
        let parent_cg = guard.as_ref().ok_or_else(|| ZygoteError::InvalidState {
            sandbox: self.id.clone(),
            state: "released".to_string(),
            op: "fork".to_string(),
        })?;
        let child_guard = child.cgroup.lock().unwrap();
        let child_cg = child_guard
            .as_ref()
            .ok_or_else(|| ZygoteError::InvalidState {
                sandbox: child.id.clone(),
                state: "released".to_string(),
                op: "fork".to_string(),
            })?;
        let moved = fork::migrate_pids(parent_cg, child_cg, &orig)?;
        debug!(
            "[SANDBOX {}] forked {} ({} pids migrated)",
            self.id, child.id, moved
        );
        Ok(())
    }

    fn unwind_create(self: &Arc<Self>) {
        if let Some(cg) = self.cgroup.lock().unwrap().take() {
            let _ = cg.release();
        }
        if let Some(mem) = &self.mem {
            mem.credit(self.meta.mem_limit_mb);
        }
        unwind_root(&self.root_dir);
        *self.state.lock().unwrap() = SandboxState::Destroyed;
    }

    /// Kernel-free sandbox for evictor and cache tests
    #[doc(hidden)]
    pub fn for_testing(id: &str, events: Option<EventSender>) -> Arc<Sandbox> {
        let scratch = std::env::temp_dir();
        Arc::new(Sandbox {
            id: id.to_string(),
            meta: Meta::default(),
            base_image_dir: PathBuf::new(),
            root_dir: std::env::temp_dir().join(format!("zygote-test-root-{}", id)),
            code_dir: None,
            scratch_dir: scratch.clone(),
            client: CommsClient::new(id, &scratch).expect("temp dir socket path"),
            cg_ref_count: AtomicI32::new(1),
            parent: None,
            children: Mutex::new(HashMap::new()),
            state: Mutex::new(SandboxState::Fresh),
            cgroup: Mutex::new(None),
            events,
            mem: None,
        })
    }

    #[doc(hidden)]
    pub fn set_state_for_testing(&self, state: SandboxState) {
        *self.state.lock().unwrap() = state;
    }

    #[doc(hidden)]
    pub fn set_cgroup_for_testing(&self, cgroup: Cgroup) {
        *self.cgroup.lock().unwrap() = Some(cgroup);
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("cg_ref_count", &self.cg_ref_count())
            .field("children", &self.child_count())
            .finish()
    }
}

/// Stack the sandbox's mounts in order: base image (read-only,
/// private), user code on `/handler` (read-only), scratch on `/host`
/// and `<scratch>/tmp` on `/tmp` (both writable). Any failure
/// short-circuits; the caller unwinds.
fn populate_root(
    base_image_dir: &Path,
    root_dir: &Path,
    code_dir: Option<&Path>,
    scratch_dir: &Path,
) -> Result<()> {
    mount::bind_mount(base_image_dir, root_dir)?;
    mount::remount_readonly(root_dir)?;
    mount::make_private(root_dir)?;

    if let Some(code_dir) = code_dir {
        let handler = root_dir.join("handler");
        mount::bind_mount(code_dir, &handler)?;
        mount::remount_readonly(&handler)?;
    }

    let tmp_dir = scratch_dir.join("tmp");
    match fs::create_dir(&tmp_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e.into()),
    }
    fs::set_permissions(&tmp_dir, fs::Permissions::from_mode(0o777))?;

    mount::bind_mount(scratch_dir, &root_dir.join("host"))?;
    mount::bind_mount(&tmp_dir, &root_dir.join("tmp"))?;
    Ok(())
}

fn unwind_root(root_dir: &Path) {
    if let Err(e) = mount::unmount_detach(root_dir) {
        warn!("unwind {}: {}", root_dir.display(), e);
    }
    if let Err(e) = fs::remove_dir_all(root_dir) {
        warn!("unwind {}: {}", root_dir.display(), e);
    }
}
