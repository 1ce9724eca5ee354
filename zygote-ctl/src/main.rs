//! Sandbox control CLI - drive a running zygoted over its Unix socket

mod cli;
mod client;

use clap::Parser;
use cli::{Cli, Commands};
use client::DaemonClient;
use console::style;
use std::path::PathBuf;
use zygote_core::{Meta, Runtime};
use zygote_rs::protocol::{Request, Response};

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().filter_or(
        "RUST_LOG",
        if cli.verbose { "debug" } else { "warn" },
    ))
    .init();

    let socket = cli
        .socket
        .clone()
        .unwrap_or_else(|| PathBuf::from("/var/run/zygoted.sock"));

    let request = match build_request(&cli.command) {
        Ok(request) => request,
        Err(message) => {
            eprintln!("Error: {}", message);
            std::process::exit(1);
        }
    };

    let mut client = match DaemonClient::connect(&socket) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error: cannot reach zygoted at {}: {}", socket.display(), e);
            std::process::exit(1);
        }
    };

    match client.send(&request) {
        Ok(response) => print_response(&response),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn build_request(command: &Commands) -> Result<Request, String> {
    let request = match command {
        Commands::Create {
            runtime,
            installs,
            memory,
            cpu,
            parent,
        } => {
            let runtime: Runtime = runtime
                .parse()
                .map_err(|e| format!("{}", e))?;
            Request::Create {
                meta: Meta {
                    is_leaf: true,
                    installs: installs.clone(),
                    imports: Vec::new(),
                    runtime,
                    mem_limit_mb: *memory,
                    cpu_percent: *cpu,
                    parent_id: parent.clone(),
                },
            }
        }
        Commands::Start { id } => Request::Start { id: id.clone() },
        Commands::Stop { id } => Request::Stop { id: id.clone() },
        Commands::Pause { id } => Request::Pause { id: id.clone() },
        Commands::Unpause { id } => Request::Unpause { id: id.clone() },
        Commands::Fork { id } => Request::Fork { id: id.clone() },
        Commands::Destroy { id } => Request::Delete { id: id.clone() },
        Commands::List => Request::List,
        Commands::Inspect { id } => Request::Inspect { id: id.clone() },
    };
    Ok(request)
}

fn print_response(response: &Response) {
    if response.ok {
        println!("{} {}", style("ok").green().bold(), response.message);
    } else {
        println!("{} {}", style("error").red().bold(), response.message);
    }
    if let Some(payload) = &response.payload {
        match serde_json::to_string_pretty(payload) {
            Ok(pretty) => println!("{}", pretty),
            Err(_) => println!("{}", payload),
        }
    }
    if !response.ok {
        std::process::exit(1);
    }
}
