//! dfiibridge - operator CLI for bridge sessions.
//!
//! Starts demo servers, inspects the session registry and calls functions on
//! running peers.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dfiibridge")]
#[command(about = "Session-brokered RPC bridge")]
struct Args {
    /// Session registry directory (defaults to ~/.dfiibridge)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a server exposing an `echo` function
    Serve {
        /// Host name to advertise (defaults to this machine's name)
        #[arg(long)]
        host: Option<String>,

        /// Address to bind
        #[arg(long, default_value = "tcp://*:0")]
        bind: String,

        /// Discovery metadata, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,
    },

    /// Print known sessions
    List {
        /// Probe each session and evict the unreachable ones
        #[arg(long)]
        check: bool,

        /// Only sessions whose metadata contains every entry
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,
    },

    /// Call a function on one session and print the reply
    Call {
        host: String,
        port: u16,
        func: String,
        args: Vec<String>,

        /// Reply timeout in milliseconds (-1 waits forever)
        #[arg(long, default_value = "5000", allow_negative_numbers = true)]
        timeout: i64,

        /// Send request_reply=false
        #[arg(long)]
        no_reply: bool,
    },

    /// Probe one session, evicting it if unreachable
    Ping { host: String, port: u16 },

    /// Probe every session and evict the dead ones
    Clean,
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let sessions = commands::open_registry(args.root)?;

    match args.command {
        Command::Serve { host, bind, meta } => commands::serve(sessions, host, bind, meta).await,
        Command::List { check, meta } => commands::list(&sessions, check, meta).await,
        Command::Call {
            host,
            port,
            func,
            args,
            timeout,
            no_reply,
        } => commands::call(sessions, &host, port, &func, args, timeout, !no_reply).await,
        Command::Ping { host, port } => commands::ping(&sessions, &host, port).await,
        Command::Clean => commands::clean(&sessions).await,
    }
}
