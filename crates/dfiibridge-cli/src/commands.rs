//! Subcommand implementations.

use anyhow::{bail, Context, Result};
use dfiibridge::config::timeout_from_millis;
use dfiibridge::{callback_fn, BridgeClient, BridgeCore, BridgeServer, Reply, SessionManager};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const RUNNING_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn open_registry(root: Option<PathBuf>) -> Result<Arc<SessionManager>> {
    let sessions = match root {
        Some(root) => SessionManager::open_at(&root)
            .with_context(|| format!("failed to open registry at {}", root.display()))?,
        None => SessionManager::open().context("failed to open the default registry")?,
    };
    Ok(Arc::new(sessions))
}

pub async fn serve(
    sessions: Arc<SessionManager>,
    host: Option<String>,
    bind: String,
    meta: Vec<(String, String)>,
) -> Result<()> {
    let mut builder = BridgeServer::builder()
        .session_manager(sessions)
        .bind_address(bind);
    if let Some(host) = host {
        builder = builder.hostname(host);
    }
    for (key, value) in meta {
        builder = builder.userdata(key, value);
    }

    let mut server = builder.build()?;
    server.register_function("echo", callback_fn(|args| Ok(args.join(" "))))?;
    server.listen_async().await?;

    // Port for scripts to read (intentional stdout)
    println!("BRIDGE_PORT={}", server.session().port());
    info!("Serving as {}", server.session());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received, exiting");
                break;
            }
            _ = tokio::time::sleep(RUNNING_POLL_INTERVAL) => {
                if !server.is_running() {
                    info!("Stopped by remote request");
                    break;
                }
            }
        }
    }

    server.stop().await?;
    Ok(())
}

pub async fn list(
    sessions: &Arc<SessionManager>,
    check: bool,
    meta: Vec<(String, String)>,
) -> Result<()> {
    let criteria: BTreeMap<String, String> = meta.into_iter().collect();
    let found = sessions.find_by_metadata(&criteria, check).await?;

    for session in &found {
        let userdata: Vec<String> = session
            .userdata()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!(
            "{}\t{}\t{}\t{}",
            session.hostname(),
            session.port(),
            session.version(),
            userdata.join(",")
        );
    }

    let evicted = sessions.eviction_count();
    if evicted > 0 {
        info!("Evicted {} stale session(s)", evicted);
    }
    Ok(())
}

pub async fn call(
    sessions: Arc<SessionManager>,
    host: &str,
    port: u16,
    func: &str,
    args: Vec<String>,
    timeout_ms: i64,
    request_reply: bool,
) -> Result<()> {
    let session = sessions.get(host, port, false).await?;

    let mut client = BridgeClient::new(BridgeCore::new(sessions));
    client.connect_to(&session).await?;
    let replies = client
        .execute(func, &args, request_reply, timeout_from_millis(timeout_ms))
        .await?;

    let mut failed = false;
    for reply in replies {
        match Reply::parse(&reply) {
            Reply::Success(text) => println!("{}", text),
            Reply::Failure(message) => {
                eprintln!("remote failure: {}", message);
                failed = true;
            }
        }
    }

    if failed {
        bail!("{} on {}:{} failed", func, host, port);
    }
    Ok(())
}

pub async fn ping(sessions: &Arc<SessionManager>, host: &str, port: u16) -> Result<()> {
    let session = sessions.get(host, port, false).await?;
    if sessions.ping(&session).await {
        println!("{} is alive", session);
        Ok(())
    } else {
        bail!("{} is unreachable and was removed from the registry", session)
    }
}

pub async fn clean(sessions: &Arc<SessionManager>) -> Result<()> {
    let removed = sessions.clean().await?;
    println!("Removed {} stale session(s)", removed);
    Ok(())
}
