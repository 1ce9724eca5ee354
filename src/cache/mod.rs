//! Import cache: a trie over package sets whose nodes are Zygotes
//!
//! Each root-to-node path accumulates packages, so a node's Zygote
//! has pre-imported everything on that path. A request for package
//! set P is served by the deepest node whose own additions are all
//! wanted by P; the node's Zygote (materialized lazily, recursively
//! forking ancestors into existence) then forks the leaf.

use crate::events::EventSender;
use crate::mempool::MemPool;
use crate::packages::{link_packages, PackagePullerInstaller};
use crate::sandbox::bootstrap::BootstrapRenderer;
use crate::sandbox::Sandbox;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;
use uuid::Uuid;
use zygote_cgroup::CgroupPool;
use zygote_core::{Meta, Result, ZygoteError};
use zygote_fs::DirMaker;

/// How long a sandbox creation waits for a pooled cgroup
const CGROUP_WAIT: Duration = Duration::from_secs(1);

pub struct CacheNode {
    /// Packages added at this level (the full working set is the
    /// union along the path from the root)
    packages: Vec<String>,
    children: Mutex<Vec<Arc<CacheNode>>>,
    parent: Weak<CacheNode>,
    inner: Mutex<NodeInner>,
}

#[derive(Default)]
struct NodeInner {
    sandbox: Option<Arc<Sandbox>>,
    sb_ref_count: u32,
    /// No lambda here, just a packages dir linking this node's
    /// working set. Lazily built when the Zygote is first needed.
    code_dir: Option<PathBuf>,
    /// Inferred from packages, lazily
    meta: Option<Meta>,
}

impl CacheNode {
    fn new_root() -> Arc<CacheNode> {
        Arc::new(CacheNode {
            packages: Vec::new(),
            children: Mutex::new(Vec::new()),
            parent: Weak::new(),
            inner: Mutex::new(NodeInner::default()),
        })
    }

    /// Full package set along the path from the root
    fn path_packages(self: &Arc<CacheNode>) -> Vec<String> {
        let mut packages = match self.parent.upgrade() {
            Some(parent) => parent.path_packages(),
            None => Vec::new(),
        };
        packages.extend(self.packages.iter().cloned());
        packages
    }

    /// Deepest descendant (including self) whose additions are all
    /// in `wanted`; None if this node itself is unusable
    pub fn lookup(self: &Arc<CacheNode>, wanted: &HashSet<String>) -> Option<Arc<CacheNode>> {
        // a node importing anything the lambda does not want is
        // unusable, and so is its whole subtree
        if !self.packages.iter().all(|p| wanted.contains(p)) {
            return None;
        }
        // prefer a child: more packages pre-imported
        for child in self.children.lock().unwrap().iter() {
            if let Some(found) = child.lookup(wanted) {
                return Some(found);
            }
        }
        Some(Arc::clone(self))
    }

    pub fn sb_ref_count(&self) -> u32 {
        self.inner.lock().unwrap().sb_ref_count
    }

    pub fn sandbox(&self) -> Option<Arc<Sandbox>> {
        self.inner.lock().unwrap().sandbox.clone()
    }
}

pub struct ImportCache {
    root_dirs: Arc<DirMaker>,
    code_dirs: Arc<DirMaker>,
    scratch_dirs: Arc<DirMaker>,
    base_image_dir: PathBuf,
    cgroup_pool: Arc<CgroupPool>,
    installer: Arc<dyn PackagePullerInstaller>,
    renderer: Arc<dyn BootstrapRenderer>,
    events: Option<EventSender>,
    mem: Option<Arc<MemPool>>,
    root: Arc<CacheNode>,
}

impl ImportCache {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root_dirs: Arc<DirMaker>,
        code_dirs: Arc<DirMaker>,
        scratch_dirs: Arc<DirMaker>,
        base_image_dir: PathBuf,
        cgroup_pool: Arc<CgroupPool>,
        installer: Arc<dyn PackagePullerInstaller>,
        renderer: Arc<dyn BootstrapRenderer>,
        events: Option<EventSender>,
        mem: Option<Arc<MemPool>>,
    ) -> Self {
        Self {
            root_dirs,
            code_dirs,
            scratch_dirs,
            base_image_dir,
            cgroup_pool,
            installer,
            renderer,
            events,
            mem,
            root: CacheNode::new_root(),
        }
    }

    pub fn root(&self) -> &Arc<CacheNode> {
        &self.root
    }

    /// Grow a chain of nodes under the root, one level per package
    /// batch, reusing existing levels with identical additions.
    /// Returns the deepest node of the branch.
    pub fn add_branch(&self, levels: &[Vec<String>]) -> Arc<CacheNode> {
        let mut node = Arc::clone(&self.root);
        for packages in levels {
            let mut children = node.children.lock().unwrap();
            let existing = children.iter().find(|c| &c.packages == packages).cloned();
            let child = match existing {
                Some(child) => child,
                None => {
                    let child = Arc::new(CacheNode {
                        packages: packages.clone(),
                        children: Mutex::new(Vec::new()),
                        parent: Arc::downgrade(&node),
                        inner: Mutex::new(NodeInner::default()),
                    });
                    children.push(Arc::clone(&child));
                    child
                }
            };
            drop(children);
            node = child;
        }
        node
    }

    /// Produce a leaf sandbox for `meta.installs`, forked from the
    /// best-matching Zygote in the trie
    pub fn create(&self, code_dir: Option<PathBuf>, meta: &Meta) -> Result<Arc<Sandbox>> {
        let wanted: HashSet<String> = meta.installs.iter().cloned().collect();
        let node = self.root.lookup(&wanted).ok_or(ZygoteError::NoZygote)?;
        debug!(
            "serving installs {:?} from node with packages {:?}",
            meta.installs, node.packages
        );
        self.create_child_from_node(&node, meta.clone(), code_dir, meta)
    }

    /// Fork a child (a leaf, or a deeper node's Zygote) from `node`'s
    /// Zygote. Tries twice: the first failure may be a stale Zygote,
    /// so the retry rebuilds it.
    fn create_child_from_node(
        &self,
        node: &Arc<CacheNode>,
        child_meta: Meta,
        child_code_dir: Option<PathBuf>,
        template: &Meta,
    ) -> Result<Arc<Sandbox>> {
        let mut force_new = false;
        let mut last_err = ZygoteError::NoZygote;

        for _ in 0..2 {
            let (zygote, is_new) = self.get_sandbox_in_node(node, template, force_new)?;

            let mut child_meta = child_meta.clone();
            child_meta.parent_id = Some(zygote.id().to_string());

            let result = self.new_child_sandbox(&zygote, child_meta, child_code_dir.clone());
            self.put_sandbox_in_node(node, &zygote)?;

            match result {
                Ok(child) => return Ok(child),
                Err(e) if is_new => return Err(e),
                Err(e) => {
                    warn!("fork from cached Zygote failed ({}), rebuilding it", e);
                    last_err = e;
                    force_new = true;
                }
            }
        }
        Err(last_err)
    }

    fn new_child_sandbox(
        &self,
        zygote: &Arc<Sandbox>,
        child_meta: Meta,
        code_dir: Option<PathBuf>,
    ) -> Result<Arc<Sandbox>> {
        let id = Uuid::new_v4().to_string();
        let root_dir = self.root_dirs.make(&format!("import-cache-{}", id))?;
        let scratch_dir = self.scratch_dirs.make("import-cache")?;
        let cgroup = self.cgroup_pool.retrieve(CGROUP_WAIT)?;
        Sandbox::create(
            Some(Arc::clone(zygote)),
            &self.base_image_dir,
            &id,
            root_dir,
            code_dir,
            scratch_dir,
            cgroup,
            child_meta,
            self.renderer.as_ref(),
            self.events.clone(),
            self.mem.clone(),
        )
    }

    /// Take a reference on the node's Zygote, materializing (or
    /// rebuilding) it first when needed. Returns the handle and
    /// whether it was created by this call.
    fn get_sandbox_in_node(
        &self,
        node: &Arc<CacheNode>,
        template: &Meta,
        force_new: bool,
    ) -> Result<(Arc<Sandbox>, bool)> {
        let mut inner = node.inner.lock().unwrap();

        if force_new {
            if let Some(old) = inner.sandbox.take() {
                inner.sb_ref_count = 0;
                thread::spawn(move || {
                    if let Err(e) = old.destroy() {
                        warn!("destroying stale Zygote {}: {}", old.id(), e);
                    }
                });
            }
        }

        if let Some(sandbox) = inner.sandbox.clone() {
            // FAST PATH
            if inner.sb_ref_count == 0 {
                if let Err(e) = sandbox.unpause() {
                    inner.sandbox = None;
                    return Err(e);
                }
            }
            inner.sb_ref_count += 1;
            return Ok((sandbox, false));
        }

        // SLOW PATH
        let sandbox = self.materialize_node(node, &mut inner, template)?;
        inner.sandbox = Some(Arc::clone(&sandbox));
        inner.sb_ref_count = 1;
        Ok((sandbox, true))
    }

    /// Drop a reference on the node's Zygote; the last one out
    /// pauses it
    fn put_sandbox_in_node(&self, node: &Arc<CacheNode>, sandbox: &Arc<Sandbox>) -> Result<()> {
        let mut inner = node.inner.lock().unwrap();

        let still_current = inner
            .sandbox
            .as_ref()
            .map(|s| Arc::ptr_eq(s, sandbox))
            .unwrap_or(false);
        if !still_current {
            return Ok(());
        }

        if inner.sb_ref_count == 0 {
            return Err(ZygoteError::RefCountUnderflow {
                sandbox: sandbox.id().to_string(),
            });
        }
        inner.sb_ref_count -= 1;

        if inner.sb_ref_count == 0 {
            if let Err(e) = sandbox.pause() {
                warn!("pausing idle Zygote {}: {}", sandbox.id(), e);
                inner.sandbox = None;
            }
        }
        Ok(())
    }

    /// Destroy every Zygote materialized in the trie, deepest first.
    /// Called at daemon shutdown, after in-flight requests drained;
    /// each destroy cascades its ref-count up the ancestor chain.
    pub fn shutdown(&self) {
        shutdown_node(&self.root);
    }

    /// Build this node's Zygote: install and link its packages, then
    /// fork from the parent node (recursively materializing it), or
    /// cold-start an interpreter at the root.
    fn materialize_node(
        &self,
        node: &Arc<CacheNode>,
        inner: &mut NodeInner,
        template: &Meta,
    ) -> Result<Arc<Sandbox>> {
        if inner.code_dir.is_none() {
            let code_dir = self.code_dirs.make("import-cache")?;

            let path_packages = node.path_packages();
            let installs = self.installer.install_packages(&path_packages)?;

            let mut top_level = Vec::new();
            for pkg in &path_packages {
                let package = self.installer.pull_package(pkg)?;
                top_level.extend(package.meta.top_level);
            }

            link_packages(self.installer.as_ref(), &code_dir, &installs)?;
            inner.code_dir = Some(code_dir);

            // policy: pre-import the top level of every installed
            // package; narrower import sets are possible but this is
            // what amortizes best across leaves
            inner.meta = Some(Meta {
                is_leaf: false,
                installs,
                imports: top_level,
                runtime: template.runtime,
                mem_limit_mb: template.mem_limit_mb,
                cpu_percent: template.cpu_percent,
                parent_id: None,
            });
        }

        let meta = inner
            .meta
            .clone()
            .expect("meta is set with code_dir")
            .make_zygote();
        let code_dir = inner.code_dir.clone();

        if let Some(parent_node) = node.parent.upgrade() {
            // this node's Zygote is itself a fork of the parent's
            self.create_child_from_node(&parent_node, meta, code_dir, template)
        } else {
            info!("cold-starting root Zygote ({})", meta.runtime);
            let id = Uuid::new_v4().to_string();
            let root_dir = self.root_dirs.make(&format!("import-cache-{}", id))?;
            let scratch_dir = self.scratch_dirs.make("import-cache")?;
            let cgroup = self.cgroup_pool.retrieve(CGROUP_WAIT)?;
            let sandbox = Sandbox::create(
                None,
                &self.base_image_dir,
                &id,
                root_dir,
                code_dir,
                scratch_dir,
                cgroup,
                meta,
                self.renderer.as_ref(),
                self.events.clone(),
                self.mem.clone(),
            )?;
            sandbox.start()?;
            Ok(sandbox)
        }
    }
}

fn shutdown_node(node: &Arc<CacheNode>) {
    for child in node.children.lock().unwrap().iter() {
        shutdown_node(child);
    }
    let mut inner = node.inner.lock().unwrap();
    inner.sb_ref_count = 0;
    if let Some(sandbox) = inner.sandbox.take() {
        if let Err(e) = sandbox.destroy() {
            warn!("destroying Zygote {} at shutdown: {}", sandbox.id(), e);
        }
    }
}
