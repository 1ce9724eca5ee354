//! Daemon-side sandbox registry and lifecycle entry points

use crate::cache::ImportCache;
use crate::evictor::Evictor;
use crate::mempool::MemPool;
use crate::packages::{PackagePullerInstaller, PipLambdaInstaller};
use crate::sandbox::bootstrap::{BootstrapRenderer, TemplateBootstrap};
use crate::sandbox::{Sandbox, SandboxState};
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;
use zygote_cgroup::CgroupPool;
use zygote_core::{DaemonConfig, Meta, Result, Runtime, ZygoteError};
use zygote_fs::DirMaker;

const CGROUP_WAIT: Duration = Duration::from_secs(1);

/// Point-in-time view of a sandbox, for the control plane
#[derive(Debug, Clone, Serialize)]
pub struct SandboxInfo {
    pub id: String,
    pub state: String,
    pub runtime: String,
    pub is_leaf: bool,
    pub cg_ref_count: i32,
    pub children: usize,
}

/// Owns every long-lived piece of the daemon: the directory makers,
/// the cgroup pools, the memory budget, the import cache, the
/// evictor, and the `id -> Sandbox` map.
///
/// The map mutex guards point lookups and inserts only; it is never
/// held across a blocking sandbox operation.
pub struct Manager {
    config: DaemonConfig,
    root_dirs: Arc<DirMaker>,
    scratch_dirs: Arc<DirMaker>,
    code_dirs: Arc<DirMaker>,
    cgroup_pool: Arc<CgroupPool>,
    pp_pool: Arc<CgroupPool>,
    mem: Arc<MemPool>,
    evictor: Option<Evictor>,
    cache: ImportCache,
    installer: Arc<PipLambdaInstaller>,
    renderer: Arc<dyn BootstrapRenderer>,
    sandboxes: Mutex<HashMap<String, Arc<Sandbox>>>,
}

impl Manager {
    pub fn new(config: DaemonConfig) -> Result<Manager> {
        let root_dirs = Arc::new(DirMaker::new(&config.work_dir, "root")?);
        let scratch_dirs = Arc::new(DirMaker::new(&config.work_dir, "scratch")?);
        let code_dirs = Arc::new(DirMaker::new(&config.work_dir, "code")?);

        let cgroup_pool = Arc::new(CgroupPool::new(&config.pool_name)?);
        let pp_pool = Arc::new(CgroupPool::new(&format!("{}-pp", config.pool_name))?);

        let mem = Arc::new(MemPool::new(&config.pool_name, config.total_mb));
        let evictor = Evictor::new(Arc::clone(&mem));
        let renderer: Arc<dyn BootstrapRenderer> = Arc::new(TemplateBootstrap);

        let base_image_dir = config.base_image_dir();
        let installer = Arc::new(PipLambdaInstaller::new(
            base_image_dir.join("packages"),
            admin_sandbox_factory(
                base_image_dir.clone(),
                Arc::clone(&root_dirs),
                Arc::clone(&scratch_dirs),
                Arc::clone(&pp_pool),
                Arc::clone(&renderer),
            ),
        ));
        let installer_trait: Arc<dyn PackagePullerInstaller> = Arc::clone(&installer) as Arc<dyn PackagePullerInstaller>;

        let cache = ImportCache::new(
            Arc::clone(&root_dirs),
            Arc::clone(&code_dirs),
            Arc::clone(&scratch_dirs),
            base_image_dir,
            Arc::clone(&cgroup_pool),
            installer_trait,
            Arc::clone(&renderer),
            Some(evictor.events()),
            Some(Arc::clone(&mem)),
        );

        Ok(Manager {
            config,
            root_dirs,
            scratch_dirs,
            code_dirs,
            cgroup_pool,
            pp_pool,
            mem,
            evictor: Some(evictor),
            cache,
            installer,
            renderer,
            sandboxes: Mutex::new(HashMap::new()),
        })
    }

    pub fn mem(&self) -> &Arc<MemPool> {
        &self.mem
    }

    pub fn cache(&self) -> &ImportCache {
        &self.cache
    }

    pub fn get(&self, id: &str) -> Result<Arc<Sandbox>> {
        self.sandboxes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ZygoteError::SandboxNotFound { id: id.to_string() })
    }

    fn register(&self, sandbox: &Arc<Sandbox>) {
        self.sandboxes
            .lock()
            .unwrap()
            .insert(sandbox.id().to_string(), Arc::clone(sandbox));
    }

    /// Create a leaf sandbox. With a `parent_id` the leaf is forked
    /// straight from that sandbox; otherwise the import cache picks
    /// (and lazily materializes) the best Zygote for the package set.
    pub fn create_sandbox(&self, meta: &Meta) -> Result<Arc<Sandbox>> {
        let code_dir = self.code_dirs.make("lambda")?;

        let sandbox = match &meta.parent_id {
            Some(parent_id) => {
                let parent = self.get(parent_id)?;
                self.fork_from(&parent, meta.clone(), Some(code_dir))?
            }
            None => self.cache.create(Some(code_dir), meta)?,
        };

        self.register(&sandbox);
        // Zygote ancestors materialized along the way stay reachable
        // through the leaf's parent chain, not through the map
        Ok(sandbox)
    }

    fn fork_from(
        &self,
        parent: &Arc<Sandbox>,
        meta: Meta,
        code_dir: Option<PathBuf>,
    ) -> Result<Arc<Sandbox>> {
        let id = Uuid::new_v4().to_string();
        let root_dir = self.root_dirs.make(&id)?;
        let scratch_dir = self.scratch_dirs.make(&id)?;
        let cgroup = self.cgroup_pool.retrieve(CGROUP_WAIT)?;
        Sandbox::create(
            Some(Arc::clone(parent)),
            &self.config.base_image_dir(),
            &id,
            root_dir,
            code_dir,
            scratch_dir,
            cgroup,
            meta,
            self.renderer.as_ref(),
            self.evictor.as_ref().map(|e| e.events()),
            Some(Arc::clone(&self.mem)),
        )
    }

    /// Fork a new sandbox off an existing one, reusing its meta
    pub fn fork_sandbox(&self, id: &str) -> Result<Arc<Sandbox>> {
        let parent = self.get(id)?;
        let mut meta = parent.meta().clone();
        meta.parent_id = Some(id.to_string());
        let code_dir = parent.code_dir().map(|p| p.to_path_buf());
        let child = self.fork_from(&parent, meta, code_dir)?;
        self.register(&child);
        Ok(child)
    }

    pub fn start_sandbox(&self, id: &str) -> Result<()> {
        self.get(id)?.start()
    }

    pub fn stop_sandbox(&self, id: &str) -> Result<()> {
        self.get(id)?.stop()
    }

    pub fn pause_sandbox(&self, id: &str) -> Result<()> {
        self.get(id)?.pause()
    }

    pub fn unpause_sandbox(&self, id: &str) -> Result<()> {
        self.get(id)?.unpause()
    }

    pub fn destroy_sandbox(&self, id: &str) -> Result<()> {
        let sandbox = self.get(id)?;
        sandbox.destroy()?;
        self.sandboxes.lock().unwrap().remove(id);
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        self.sandboxes.lock().unwrap().keys().cloned().collect()
    }

    pub fn inspect(&self, id: &str) -> Result<SandboxInfo> {
        let sandbox = self.get(id)?;
        Ok(SandboxInfo {
            id: sandbox.id().to_string(),
            state: sandbox.state().to_string(),
            runtime: sandbox.meta().runtime.to_string(),
            is_leaf: sandbox.meta().is_leaf,
            cg_ref_count: sandbox.cg_ref_count(),
            children: sandbox.child_count(),
        })
    }

    /// Destroy every sandbox, stop the evictor, and tear down both
    /// cgroup pools. Cooperative: nothing is left for process exit.
    pub fn shutdown(mut self) -> Result<()> {
        info!("manager shutting down");
        let sandboxes: Vec<Arc<Sandbox>> =
            self.sandboxes.lock().unwrap().values().cloned().collect();
        for sandbox in sandboxes {
            if sandbox.state() != SandboxState::Destroyed
                && sandbox.state() != SandboxState::Destroying
            {
                if let Err(e) = sandbox.destroy() {
                    warn!("destroy {} on shutdown: {}", sandbox.id(), e);
                }
            }
        }
        self.sandboxes.lock().unwrap().clear();

        // cached Zygotes and the admin sandbox hold cgroups of their
        // own; they go before the pools can be emptied
        self.cache.shutdown();
        self.installer.shutdown();

        if let Some(evictor) = self.evictor.take() {
            evictor.shutdown();
        }

        // the cache and the installer's factory hold the other
        // references to the pools
        drop(self.cache);
        drop(self.installer);

        let cgroup_pool = Arc::try_unwrap(self.cgroup_pool).map_err(|_| ZygoteError::PoolInit {
            pool: "sandbox".to_string(),
            reason: "still referenced at shutdown".to_string(),
        })?;
        cgroup_pool.destroy()?;
        let pp_pool = Arc::try_unwrap(self.pp_pool).map_err(|_| ZygoteError::PoolInit {
            pool: "pp".to_string(),
            reason: "still referenced at shutdown".to_string(),
        })?;
        pp_pool.destroy()?;

        self.root_dirs.destroy();
        self.scratch_dirs.destroy();
        self.code_dirs.destroy();
        Ok(())
    }
}

fn admin_sandbox_factory(
    base_image_dir: PathBuf,
    root_dirs: Arc<DirMaker>,
    scratch_dirs: Arc<DirMaker>,
    pp_pool: Arc<CgroupPool>,
    renderer: Arc<dyn BootstrapRenderer>,
) -> crate::packages::AdminSandboxFactory {
    Box::new(move || {
        let id = Uuid::new_v4().to_string();
        let root_dir = root_dirs.make(&format!("pp-{}", id))?;
        let scratch_dir = scratch_dirs.make("pp")?;
        let cgroup = pp_pool.retrieve(CGROUP_WAIT)?;
        let meta = Meta {
            runtime: Runtime::Python,
            ..Default::default()
        };
        let sandbox = Sandbox::create(
            None,
            &base_image_dir,
            &id,
            root_dir,
            Some(base_image_dir.join("admin-lambdas").join("pip-lambda")),
            scratch_dir,
            cgroup,
            meta,
            renderer.as_ref(),
            None,
            None,
        )?;
        sandbox.start()?;
        Ok(sandbox)
    })
}
