//! Health transitions against a scriptable in-process stand-in for the
//! remote store.
//!
//! A tiny TCP server speaks just enough of the Redis wire protocol to answer
//! the commands the client sends (ping echoes the payload deadpool uses for
//! connection checks). Stopping and restarting it drives the manager through
//! the full healthy -> degraded -> healthy cycle without a live Redis.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use haven_cache::{Backend, CacheConfig, CacheManager, RemoteConfig};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("haven_cache=debug")
        .with_test_writer()
        .try_init();
}

/// Parse one complete RESP command (array of bulk strings) from the front of
/// the buffer. Returns the arguments and the number of bytes consumed, or
/// None while the command is still incomplete.
fn parse_command(buf: &[u8]) -> Option<(Vec<String>, usize)> {
    fn read_line(buf: &[u8], pos: usize) -> Option<(&str, usize)> {
        let end = buf[pos..].windows(2).position(|w| w == b"\r\n")? + pos;
        let line = std::str::from_utf8(&buf[pos..end]).ok()?;
        Some((line, end + 2))
    }

    let (header, mut pos) = read_line(buf, 0)?;
    let argc: usize = header.strip_prefix('*')?.parse().ok()?;
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        let (len_line, body) = read_line(buf, pos)?;
        let len: usize = len_line.strip_prefix('$')?.parse().ok()?;
        if buf.len() < body + len + 2 {
            return None;
        }
        args.push(String::from_utf8_lossy(&buf[body..body + len]).to_string());
        pos = body + len + 2;
    }
    Some((args, pos))
}

fn respond(args: &[String]) -> Vec<u8> {
    let command = args
        .first()
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or_default();
    match command.as_str() {
        // deadpool verifies recycled connections with PING <n> and expects
        // the payload echoed back
        "PING" => match args.get(1) {
            Some(echo) => format!("${}\r\n{echo}\r\n", echo.len()).into_bytes(),
            None => b"+PONG\r\n".to_vec(),
        },
        "GET" => b"$-1\r\n".to_vec(),
        "SET" | "PSETEX" | "FLUSHDB" | "CLIENT" => b"+OK\r\n".to_vec(),
        "INCR" | "INCRBY" => b":2\r\n".to_vec(),
        "DEL" | "DBSIZE" | "EXISTS" => b":0\r\n".to_vec(),
        "PTTL" => b":-2\r\n".to_vec(),
        "SCAN" => b"*2\r\n$1\r\n0\r\n*0\r\n".to_vec(),
        _ => b"+OK\r\n".to_vec(),
    }
}

async fn handle_conn(
    mut stream: TcpStream,
    log: Arc<Mutex<Vec<String>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        tokio::select! {
            read = stream.read(&mut chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);

                let mut replies = Vec::new();
                while let Some((args, consumed)) = parse_command(&buf) {
                    buf.drain(..consumed);
                    replies.extend_from_slice(&respond(&args));
                    log.lock().unwrap().push(args.join(" "));
                }
                if !replies.is_empty() && stream.write_all(&replies).await.is_err() {
                    return;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

struct FakeRedis {
    addr: SocketAddr,
    log: Arc<Mutex<Vec<String>>>,
    shutdown: watch::Sender<bool>,
}

impl FakeRedis {
    /// Bind an ephemeral port, or rebind the given address after a restart.
    async fn start(addr: Option<SocketAddr>) -> Self {
        let bind_to = addr.unwrap_or_else(|| "127.0.0.1:0".parse().unwrap());
        let listener = TcpListener::bind(bind_to).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, rx) = watch::channel(false);

        tokio::spawn({
            let log = Arc::clone(&log);
            let mut accept_rx = rx.clone();
            async move {
                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            let Ok((stream, _)) = accepted else { return };
                            tokio::spawn(handle_conn(stream, Arc::clone(&log), rx.clone()));
                        }
                        changed = accept_rx.changed() => {
                            if changed.is_err() || *accept_rx.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Self { addr, log, shutdown }
    }

    /// Close the listener and every open connection.
    fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

fn stub_config(addr: SocketAddr) -> CacheConfig {
    CacheConfig {
        remote: RemoteConfig {
            enabled: true,
            url: format!("redis://{addr}"),
            pool_size: 2,
            timeout_ms: 500,
        },
        local_fallback: true,
        health_check_interval_ms: 100,
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn manager_starts_healthy_against_reachable_store() {
    init_tracing();
    let server = FakeRedis::start(None).await;
    let cache = CacheManager::new(stub_config(server.addr)).await.unwrap();

    assert!(cache.is_healthy());
    assert!(cache.ping().await);

    cache.set("greeting", &json!("hello"), None, "files").await.unwrap();
    let commands = server.commands();
    assert!(
        commands.iter().any(|c| c.starts_with("PSETEX haven:files:v1:greeting")),
        "writes while healthy must reach the remote store, saw: {commands:?}"
    );

    let stats = cache.stats().await;
    assert_eq!(stats.backend, Backend::Remote);
    assert!(stats.healthy);

    cache.destroy();
    server.stop();
}

#[tokio::test]
async fn data_path_failure_flips_to_degraded_and_recovery_restores_health() {
    init_tracing();
    let server = FakeRedis::start(None).await;
    let addr = server.addr;
    let cache = CacheManager::new(stub_config(addr)).await.unwrap();
    assert!(cache.is_healthy());

    cache.set("x", &1, None, "files").await.unwrap();

    // Kill the store out from under the manager
    server.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The failed remote call degrades the manager and lands the write locally
    cache.set("y", &2, None, "files").await.unwrap();
    assert!(!cache.is_healthy());
    let stats = cache.stats().await;
    assert_eq!(stats.backend, Backend::Local);
    assert!(!stats.healthy);

    let y: Option<i64> = cache.get("y", "files").await.unwrap();
    assert_eq!(y, Some(2));

    // Bring the store back and wait for the probe loop to notice
    let revived = FakeRedis::start(Some(addr)).await;
    let mut recovered = false;
    for _ in 0..40 {
        if cache.is_healthy() {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(recovered, "health loop never flipped back after restart");
    assert!(cache.ping().await);

    cache.destroy();
    revived.stop();
}

#[tokio::test]
async fn degraded_invalidation_is_replayed_on_recovery() {
    init_tracing();
    let server = FakeRedis::start(None).await;
    let addr = server.addr;
    let cache = CacheManager::new(stub_config(addr)).await.unwrap();
    assert!(cache.is_healthy());

    server.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Invalidate while the store is down; the bump lands in the mirror
    cache.set("doc", &1, None, "files").await.unwrap();
    let version = cache.invalidate_namespace("files").await.unwrap();
    assert_eq!(version, 2);
    assert!(!cache.is_healthy());

    // On recovery the bump must be pushed to the remote counter before the
    // manager reports healthy, otherwise the invalidated keys would become
    // reachable again under the stale version
    let revived = FakeRedis::start(Some(addr)).await;
    let mut recovered = false;
    for _ in 0..40 {
        if cache.is_healthy() {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(recovered, "health loop never flipped back after restart");

    let commands = revived.commands();
    assert!(
        commands
            .iter()
            .any(|c| c.starts_with("INCRBY haven:files:__version__")),
        "recovery must replay the version bump, saw: {commands:?}"
    );

    cache.destroy();
    revived.stop();
}
