//! Bootstrap code rendered into a sandbox's scratch directory
//!
//! The runtime server inside the chroot loads
//! `/host/bootstrap.{py,js,rb}` on startup. A Zygote's bootstrap
//! pre-imports its package working set; a leaf's also wires up the
//! user handler from `/handler`.

use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use zygote_core::{Meta, Result, Runtime, ZygoteError};

/// External collaborator seam: turns sandbox metadata into runtime
/// bootstrap code.
pub trait BootstrapRenderer: Send + Sync {
    fn render(&self, meta: &Meta) -> Result<Vec<u8>>;
}

/// Default renderer with one built-in template per runtime
pub struct TemplateBootstrap;

impl BootstrapRenderer for TemplateBootstrap {
    fn render(&self, meta: &Meta) -> Result<Vec<u8>> {
        let code = match meta.runtime {
            Runtime::Python => render_python(meta),
            Runtime::Node => render_node(meta),
            Runtime::Ruby => render_ruby(meta),
        };
        Ok(code.into_bytes())
    }
}

fn render_python(meta: &Meta) -> String {
    let mut code = String::new();
    code.push_str("import sys\n");
    code.push_str("sys.path.insert(0, '/host/packages')\n");
    for module in &meta.imports {
        code.push_str(&format!("import {}\n", module));
    }
    if meta.is_leaf {
        code.push_str("sys.path.insert(0, '/handler')\n");
        code.push_str("from f import f as handler\n");
    } else {
        code.push_str("handler = None\n");
    }
    code
}

fn render_node(meta: &Meta) -> String {
    let mut code = String::new();
    code.push_str("module.paths.unshift('/host/packages');\n");
    for module in &meta.imports {
        code.push_str(&format!("require('{}');\n", module));
    }
    if meta.is_leaf {
        code.push_str("exports.handler = require('/handler/f.js').f;\n");
    } else {
        code.push_str("exports.handler = null;\n");
    }
    code
}

fn render_ruby(meta: &Meta) -> String {
    let mut code = String::new();
    code.push_str("$LOAD_PATH.unshift('/host/packages')\n");
    for module in &meta.imports {
        code.push_str(&format!("require '{}'\n", module));
    }
    if meta.is_leaf {
        code.push_str("require '/handler/f'\n");
    }
    code
}

/// Render and write `<scratch>/bootstrap.<ext>` (0600). Zero bytes of
/// rendered code is an error: a sandbox with nothing to load is a bug
/// in the template, not an empty workload.
pub fn write_bootstrap(
    renderer: &dyn BootstrapRenderer,
    sandbox_id: &str,
    meta: &Meta,
    scratch_dir: &Path,
) -> Result<PathBuf> {
    let code = renderer.render(meta)?;
    if code.is_empty() {
        return Err(ZygoteError::EmptyBootstrap {
            sandbox: sandbox_id.to_string(),
        });
    }

    let path = scratch_dir.join(meta.runtime.bootstrap_file());
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true).mode(0o600);
    let mut file = opts.open(&path)?;
    use std::io::Write;
    file.write_all(&code)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn test_python_zygote_imports_working_set() {
        let meta = Meta {
            is_leaf: false,
            imports: vec!["numpy".to_string(), "pandas".to_string()],
            ..Default::default()
        };
        let code = TemplateBootstrap.render(&meta).unwrap();
        let code = String::from_utf8(code).unwrap();
        assert!(code.contains("import numpy\n"));
        assert!(code.contains("import pandas\n"));
        assert!(!code.contains("/handler"));
    }

    #[test]
    fn test_python_leaf_wires_handler() {
        let meta = Meta::default();
        let code = String::from_utf8(TemplateBootstrap.render(&meta).unwrap()).unwrap();
        assert!(code.contains("from f import f as handler"));
    }

    #[test]
    fn test_write_bootstrap_mode_and_name() {
        let tmp = tempdir().unwrap();
        let meta = Meta {
            runtime: Runtime::Node,
            ..Default::default()
        };
        let path = write_bootstrap(&TemplateBootstrap, "sb", &meta, tmp.path()).unwrap();
        assert!(path.ends_with("bootstrap.js"));
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_empty_rendering_is_an_error() {
        struct Empty;
        impl BootstrapRenderer for Empty {
            fn render(&self, _meta: &Meta) -> Result<Vec<u8>> {
                Ok(Vec::new())
            }
        }
        let tmp = tempdir().unwrap();
        let err = write_bootstrap(&Empty, "sb", &Meta::default(), tmp.path()).unwrap_err();
        assert!(matches!(err, ZygoteError::EmptyBootstrap { .. }));
    }
}
