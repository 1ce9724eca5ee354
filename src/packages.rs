//! Package pulling and installation interfaces
//!
//! Installation itself happens inside an admin sandbox (an ordinary
//! lambda that shells out to pip); this module only drives it and
//! records the returned metadata.

use crate::sandbox::Sandbox;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use zygote_core::{Result, ZygoteError};

/// What the pip-install admin lambda returns
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageMeta {
    #[serde(rename = "Deps", default)]
    pub deps: Vec<String>,
    #[serde(rename = "TopLevel", default)]
    pub top_level: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    #[serde(rename = "Pkg")]
    pkg: &'a str,
    #[serde(rename = "AlreadyInstalled")]
    already_installed: bool,
}

#[derive(Debug, Clone)]
pub struct Package {
    pub name: String,
    pub meta: PackageMeta,
}

pub trait PackagePuller: Send + Sync {
    /// Install one package (if needed) and report its metadata
    fn pull_package(&self, pkg: &str) -> Result<Package>;
}

pub trait PackageInstaller: Send + Sync {
    /// Install a set of packages; returns the normalized names
    fn install_packages(&self, pkgs: &[String]) -> Result<Vec<String>>;
    /// Host directory holding an installed package's files
    fn package_dir(&self, pkg: &str) -> PathBuf;
}

pub trait PackagePullerInstaller: PackagePuller + PackageInstaller {}
impl<T: PackagePuller + PackageInstaller> PackagePullerInstaller for T {}

struct PackageEntry {
    install_mutex: Mutex<()>,
    installed: AtomicBool,
    meta: Mutex<PackageMeta>,
}

/// Builds the admin sandbox hosting the pip-install lambda, on first
/// use (a cold interpreter start needs root, so it cannot happen at
/// daemon construction time in tests)
pub type AdminSandboxFactory = Box<dyn Fn() -> Result<Arc<Sandbox>> + Send + Sync>;

/// Drives the pip-install admin lambda inside a long-lived admin
/// sandbox. Concurrent pulls of the same package serialize on a
/// per-package mutex; a package installed once is never re-installed.
pub struct PipLambdaInstaller {
    packages: Mutex<HashMap<String, Arc<PackageEntry>>>,
    package_dir: PathBuf,
    admin: Mutex<Option<Arc<Sandbox>>>,
    factory: AdminSandboxFactory,
}

impl PipLambdaInstaller {
    pub fn new(package_dir: PathBuf, factory: AdminSandboxFactory) -> Self {
        Self {
            packages: Mutex::new(HashMap::new()),
            package_dir,
            admin: Mutex::new(None),
            factory,
        }
    }

    fn admin(&self) -> Result<Arc<Sandbox>> {
        let mut slot = self.admin.lock().unwrap();
        if slot.is_none() {
            *slot = Some((self.factory)()?);
        }
        Ok(Arc::clone(slot.as_ref().expect("just set")))
    }

    /// Destroy the admin sandbox, if one was ever started
    pub fn shutdown(&self) {
        if let Some(admin) = self.admin.lock().unwrap().take() {
            if let Err(e) = admin.destroy() {
                warn!("destroying admin sandbox {}: {}", admin.id(), e);
            }
        }
    }

    /// pip package names are case-insensitive with `_` == `-`
    pub fn normalize(pkg: &str) -> String {
        pkg.to_lowercase().replace('_', "-")
    }

    fn entry(&self, pkg: &str) -> Arc<PackageEntry> {
        let mut packages = self.packages.lock().unwrap();
        packages
            .entry(pkg.to_string())
            .or_insert_with(|| {
                Arc::new(PackageEntry {
                    install_mutex: Mutex::new(()),
                    installed: AtomicBool::new(false),
                    meta: Mutex::new(PackageMeta::default()),
                })
            })
            .clone()
    }

    fn sandbox_install(&self, pkg: &str) -> Result<PackageMeta> {
        let target = self.package_dir.join(pkg);
        let already_installed = target.exists();
        if already_installed {
            debug!("package {} already on disk", pkg);
        } else {
            info!("pip install {} into {}", pkg, target.display());
        }

        let request = PullRequest {
            pkg,
            already_installed,
        };
        let body = serde_json::to_vec(&request).map_err(|e| ZygoteError::Package {
            pkg: pkg.to_string(),
            reason: format!("encode request: {}", e),
        })?;

        let response = self.admin()?.client().run("pip-install", &body)?;
        if !response.is_ok() {
            return Err(ZygoteError::Package {
                pkg: pkg.to_string(),
                reason: format!("install lambda returned {}", response.status),
            });
        }

        let mut meta: PackageMeta =
            serde_json::from_slice(&response.body).map_err(|e| ZygoteError::Package {
                pkg: pkg.to_string(),
                reason: format!("decode metadata: {}", e),
            })?;
        for dep in &mut meta.deps {
            *dep = Self::normalize(dep);
        }
        Ok(meta)
    }
}

impl PackagePuller for PipLambdaInstaller {
    fn pull_package(&self, pkg: &str) -> Result<Package> {
        let pkg = Self::normalize(pkg);
        let entry = self.entry(&pkg);

        // fast path
        if entry.installed.load(Ordering::Acquire) {
            return Ok(Package {
                name: pkg,
                meta: entry.meta.lock().unwrap().clone(),
            });
        }

        let _guard = entry.install_mutex.lock().unwrap();
        if !entry.installed.load(Ordering::Acquire) {
            let meta = self.sandbox_install(&pkg)?;
            *entry.meta.lock().unwrap() = meta;
            entry.installed.store(true, Ordering::Release);
        }

        let meta = entry.meta.lock().unwrap().clone();
        Ok(Package { name: pkg, meta })
    }
}

impl PackageInstaller for PipLambdaInstaller {
    fn install_packages(&self, pkgs: &[String]) -> Result<Vec<String>> {
        let mut installed = Vec::with_capacity(pkgs.len());
        for pkg in pkgs {
            installed.push(self.pull_package(pkg)?.name);
        }
        Ok(installed)
    }

    fn package_dir(&self, pkg: &str) -> PathBuf {
        self.package_dir.join(Self::normalize(pkg))
    }
}

/// Installer that reports every package as present with no metadata.
/// Used when a node has no packages to materialize and in tests.
pub struct NoopInstaller {
    package_dir: PathBuf,
}

impl NoopInstaller {
    pub fn new(package_dir: PathBuf) -> Self {
        Self { package_dir }
    }
}

impl PackagePuller for NoopInstaller {
    fn pull_package(&self, pkg: &str) -> Result<Package> {
        Ok(Package {
            name: PipLambdaInstaller::normalize(pkg),
            meta: PackageMeta::default(),
        })
    }
}

impl PackageInstaller for NoopInstaller {
    fn install_packages(&self, pkgs: &[String]) -> Result<Vec<String>> {
        Ok(pkgs
            .iter()
            .map(|p| PipLambdaInstaller::normalize(p))
            .collect())
    }

    fn package_dir(&self, pkg: &str) -> PathBuf {
        self.package_dir.join(PipLambdaInstaller::normalize(pkg))
    }
}

/// Symlink each installed package's tree into `<code_dir>/packages/`
pub fn link_packages(
    installer: &dyn PackageInstaller,
    code_dir: &Path,
    pkgs: &[String],
) -> Result<()> {
    let packages_dir = code_dir.join("packages");
    std::fs::create_dir_all(&packages_dir)?;
    for pkg in pkgs {
        let source = installer.package_dir(pkg);
        let link = packages_dir.join(pkg);
        if link.exists() {
            continue;
        }
        std::os::unix::fs::symlink(&source, &link)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_lowers_and_dashes() {
        assert_eq!(PipLambdaInstaller::normalize("NumPy"), "numpy");
        assert_eq!(
            PipLambdaInstaller::normalize("typing_extensions"),
            "typing-extensions"
        );
    }

    #[test]
    fn test_package_meta_decodes_lambda_reply() {
        let meta: PackageMeta =
            serde_json::from_str(r#"{"Deps":["six"],"TopLevel":["numpy"]}"#).unwrap();
        assert_eq!(meta.deps, vec!["six"]);
        assert_eq!(meta.top_level, vec!["numpy"]);
    }

    #[test]
    fn test_link_packages_creates_symlinks() {
        let tmp = tempdir().unwrap();
        let pkg_root = tmp.path().join("packages");
        std::fs::create_dir_all(pkg_root.join("numpy")).unwrap();
        let code_dir = tmp.path().join("code");
        std::fs::create_dir(&code_dir).unwrap();

        let installer = NoopInstaller::new(pkg_root.clone());
        link_packages(&installer, &code_dir, &["numpy".to_string()]).unwrap();

        let link = code_dir.join("packages").join("numpy");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        // idempotent
        link_packages(&installer, &code_dir, &["numpy".to_string()]).unwrap();
    }
}
