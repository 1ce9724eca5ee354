//! zygoted: the sandbox daemon
//!
//! Listens on a Unix socket and serves control-plane records
//! (create / start / stop / pause / unpause / fork / delete / list /
//! inspect) against the manager. Each accepted connection gets its
//! own thread; closing a connection never cancels in-flight work.

use clap::Parser;
use log::{error, info, warn};
use std::fs;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use zygote_rs::protocol::{read_record, write_record, Request, Response};
use zygote_rs::{DaemonConfig, Manager};

#[derive(Parser, Debug)]
#[command(name = "zygoted", about = "Zygote-forking sandbox daemon")]
struct Args {
    /// Config file (JSON); defaults apply when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the control socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Override the private work directory
    #[arg(long)]
    work_dir: Option<PathBuf>,
}

fn main() {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => match DaemonConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("config {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => DaemonConfig::default(),
    };
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(work_dir) = args.work_dir {
        config.work_dir = work_dir;
    }

    let socket_path = config.socket_path.clone();
    let manager = match Manager::new(config) {
        Ok(manager) => Arc::new(manager),
        Err(e) => {
            error!("manager init: {}", e);
            std::process::exit(1);
        }
    };

    // a previous unclean exit may have left the socket behind
    if socket_path.exists() {
        let _ = fs::remove_file(&socket_path);
    }
    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!("bind {}: {}", socket_path.display(), e);
            std::process::exit(1);
        }
    };
    info!("listening on {}", socket_path.display());

    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let manager = Arc::clone(&manager);
                thread::spawn(move || serve_connection(stream, manager));
            }
            Err(e) => warn!("accept: {}", e),
        }
    }
}

fn serve_connection(stream: UnixStream, manager: Arc<Manager>) {
    let mut reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(e) => {
            warn!("clone connection: {}", e);
            return;
        }
    };
    let mut writer = stream;

    loop {
        let request: Request = match read_record(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                warn!("read request: {}", e);
                return;
            }
        };

        let response = handle_request(&manager, request);
        if let Err(e) = write_record(&mut writer, &response) {
            warn!("write response: {}", e);
            return;
        }
    }
}

fn handle_request(manager: &Manager, request: Request) -> Response {
    match request {
        Request::Create { meta } => match manager.create_sandbox(&meta) {
            Ok(sandbox) => {
                Response::ok_with(format!("created sandbox {}", sandbox.id()), &sandbox.id())
            }
            Err(e) => Response::err(format!("create failed: {}", e)),
        },
        Request::Delete { id } => match manager.destroy_sandbox(&id) {
            Ok(()) => Response::ok(format!("destroyed sandbox {}", id)),
            Err(e) => Response::err(format!("destroy failed: {}", e)),
        },
        Request::Start { id } => match manager.start_sandbox(&id) {
            Ok(()) => Response::ok(format!("started sandbox {}", id)),
            Err(e) => Response::err(format!("start failed: {}", e)),
        },
        Request::Stop { id } => match manager.stop_sandbox(&id) {
            Ok(()) => Response::ok(format!("stopped sandbox {}", id)),
            Err(e) => Response::err(format!("stop failed: {}", e)),
        },
        Request::Pause { id } => match manager.pause_sandbox(&id) {
            Ok(()) => Response::ok(format!("paused sandbox {}", id)),
            Err(e) => Response::err(format!("pause failed: {}", e)),
        },
        Request::Unpause { id } => match manager.unpause_sandbox(&id) {
            Ok(()) => Response::ok(format!("unpaused sandbox {}", id)),
            Err(e) => Response::err(format!("unpause failed: {}", e)),
        },
        Request::Fork { id } => match manager.fork_sandbox(&id) {
            Ok(child) => {
                Response::ok_with(format!("forked sandbox {}", child.id()), &child.id())
            }
            Err(e) => Response::err(format!("fork failed: {}", e)),
        },
        Request::List => {
            let ids = manager.list();
            Response::ok_with(format!("{} sandboxes", ids.len()), &ids)
        }
        Request::Inspect { id } => match manager.inspect(&id) {
            Ok(info) => Response::ok_with(format!("sandbox {}", id), &info),
            Err(e) => Response::err(format!("inspect failed: {}", e)),
        },
    }
}
