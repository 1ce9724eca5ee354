//! Sandbox metadata and runtime kinds

use crate::{Result, ZygoteError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Interpreter runtime hosted inside a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Python,
    Node,
    Ruby,
}

impl Runtime {
    /// File name of the bootstrap code written into the scratch dir
    pub fn bootstrap_file(&self) -> &'static str {
        match self {
            Runtime::Python => "bootstrap.py",
            Runtime::Node => "bootstrap.js",
            Runtime::Ruby => "bootstrap.rb",
        }
    }

    /// Path of the runtime server inside the sandbox root
    pub fn server_path(&self) -> &'static str {
        match self {
            Runtime::Python => "/runtime/python/server.py",
            Runtime::Node => "/runtime/node/server.js",
            Runtime::Ruby => "/runtime/ruby/server.rb",
        }
    }

    /// Interpreter binary expected inside the base image. Absolute:
    /// the guest environment is cleared, so there is no PATH.
    pub fn interpreter(&self) -> &'static str {
        match self {
            Runtime::Python => "/usr/bin/python3",
            Runtime::Node => "/usr/bin/node",
            Runtime::Ruby => "/usr/bin/ruby",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Runtime::Python => "python",
            Runtime::Node => "node",
            Runtime::Ruby => "ruby",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Runtime {
    type Err = ZygoteError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "python" => Ok(Runtime::Python),
            "node" => Ok(Runtime::Node),
            "ruby" => Ok(Runtime::Ruby),
            other => Err(ZygoteError::Unsupported {
                runtime: other.to_string(),
            }),
        }
    }
}

/// Per-sandbox metadata: what is pre-installed, what was imported,
/// and the resource envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    /// Leaf sandboxes serve user code; non-leaves are Zygotes
    pub is_leaf: bool,
    /// Packages installed into the code dir
    pub installs: Vec<String>,
    /// Top-level modules pre-imported by the interpreter
    pub imports: Vec<String>,
    pub runtime: Runtime,
    pub mem_limit_mb: u32,
    pub cpu_percent: u32,
    /// ID of the sandbox this one was forked from, if any
    pub parent_id: Option<String>,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            is_leaf: true,
            installs: Vec::new(),
            imports: Vec::new(),
            runtime: Runtime::Python,
            mem_limit_mb: 128,
            cpu_percent: 100,
            parent_id: None,
        }
    }
}

impl Meta {
    /// Derive the Zygote variant of this meta: same package working
    /// set, no user code
    pub fn make_zygote(&self) -> Meta {
        Meta {
            is_leaf: false,
            parent_id: None,
            ..self.clone()
        }
    }

    pub fn is_zygote(&self) -> bool {
        !self.is_leaf
    }
}
