use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "zygote-ctl")]
#[command(version, about = "Manage sandboxes on a running zygoted", long_about = None)]
#[command(after_help = "EXAMPLES:
    zygote-ctl create --runtime python --install numpy --install pandas
    zygote-ctl list
    zygote-ctl pause 3b4f...
    zygote-ctl fork 3b4f...
    zygote-ctl destroy 3b4f...
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Daemon control socket
    #[arg(long, value_name = "PATH", global = true)]
    pub socket: Option<PathBuf>,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a leaf sandbox
    Create {
        /// Interpreter runtime (python, node, ruby)
        #[arg(long, default_value = "python")]
        runtime: String,

        /// Package to pre-install (repeatable)
        #[arg(long = "install", value_name = "PKG")]
        installs: Vec<String>,

        /// Memory limit in MB
        #[arg(long, default_value_t = 128)]
        memory: u32,

        /// CPU limit as percent of one core
        #[arg(long, default_value_t = 100)]
        cpu: u32,

        /// Fork directly from this sandbox instead of the cache
        #[arg(long, value_name = "ID")]
        parent: Option<String>,
    },

    /// Start a cold sandbox's interpreter
    Start { id: String },

    /// Stop a sandbox's processes, keeping its resources
    Stop { id: String },

    /// Freeze a sandbox
    Pause { id: String },

    /// Thaw a sandbox
    Unpause { id: String },

    /// Fork a new sandbox from an existing one
    Fork { id: String },

    /// Destroy a sandbox
    Destroy { id: String },

    /// List sandbox IDs
    List,

    /// Show one sandbox's state
    Inspect { id: String },
}
