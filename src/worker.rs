//! Worker process
//!
//! Each worker binds the shared listening address with `SO_REUSEPORT`, so the
//! kernel spreads incoming connections over every live worker. Requests are
//! admitted through the slot gate and processed on the blocking pool, which is
//! capped at the slot count. Slot events go to stdout for the supervisor from a
//! dedicated reporter thread; logs go to stderr.

use anyhow::{Context, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::admission::{GatedListener, SlotLease, SlotTable};
use crate::config::ServiceConfig;
use crate::http::{router, AppState};
use crate::lifecycle::RequestLifecycle;
use crate::protocol::{spawn_reporter, FramedWriter, SlotEvent};

/// Runtime sized for one worker: pipeline work never exceeds the slot count
pub fn runtime(config: &ServiceConfig) -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(config.threads.clamp(1, 4))
        .max_blocking_threads(config.threads)
        .thread_name("thermo-worker")
        .build()
}

/// Bind with address/port reuse and the configured backlog
pub fn bind_reuseport(config: &ServiceConfig) -> Result<TcpListener> {
    let addr = resolve(&config.bind_addr())?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .context("Failed to create socket")?;

    socket.set_reuseaddr(true).context("Failed to set SO_REUSEADDR")?;
    socket.set_reuseport(true).context("Failed to set SO_REUSEPORT")?;
    socket
        .bind(addr)
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket
        .listen(config.backlog as u32)
        .context("Failed to listen")
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("Invalid bind address {}", addr))?
        .next()
        .with_context(|| format!("Bind address {} resolved to nothing", addr))
}

/// Serve until SIGTERM or SIGINT, then drain in-flight requests
pub async fn run(config: Arc<ServiceConfig>, index: usize) -> Result<()> {
    let lifecycle = Arc::new(RequestLifecycle::from_config(Arc::clone(&config)).context("Failed to open storage")?);

    let (events, inbox) = mpsc::unbounded_channel();
    spawn_reporter(inbox, FramedWriter::new(std::io::stdout())).context("Failed to start slot event reporter")?;

    let slots = SlotTable::new(config.threads, events.clone());
    let listener = GatedListener::new(bind_reuseport(&config)?, Arc::clone(&slots));

    info!(
        "🔧 Worker {} (pid {}) listening on {} with {} slots",
        index,
        std::process::id(),
        config.bind_addr(),
        config.threads
    );
    if events
        .send(SlotEvent::Ready {
            pid: std::process::id(),
            slots: config.threads,
        })
        .is_err()
    {
        warn!("Slot event reporter exited before startup");
    }
    drop(events);

    let app = router(AppState::new(lifecycle, slots, index));
    axum::serve(listener, app.into_make_service_with_connect_info::<SlotLease>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Worker server failed")?;

    info!("Worker {} stopped", index);
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = terminate.recv() => info!("SIGTERM received, draining"),
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, draining"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_two_sockets_share_a_port() {
        let first = ServiceConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServiceConfig::default()
        };
        let a = bind_reuseport(&first).unwrap();
        let port = a.local_addr().unwrap().port();

        let second = ServiceConfig { port, ..first };
        let b = bind_reuseport(&second).unwrap();
        assert_eq!(b.local_addr().unwrap().port(), port);
    }

    /// Forwards every write as one message
    struct ChannelWriter(std::sync::mpsc::Sender<Vec<u8>>);

    impl std::io::Write for ChannelWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .send(buf.to_vec())
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_slot_events_flow_while_blocking_pool_is_saturated() {
        let config = ServiceConfig {
            threads: 1,
            ..ServiceConfig::default()
        };
        let rt = runtime(&config).unwrap();

        // occupy the only blocking thread, as a long pipeline would
        let busy = rt.spawn_blocking(|| std::thread::sleep(std::time::Duration::from_secs(2)));

        let (written, frames) = std::sync::mpsc::channel();
        let (events, inbox) = mpsc::unbounded_channel();
        let _reporter = spawn_reporter(inbox, FramedWriter::new(ChannelWriter(written))).unwrap();

        let slots = SlotTable::new(1, events);
        let permits = Arc::new(tokio::sync::Semaphore::new(1));
        let lease = slots.lease(permits.try_acquire_owned().unwrap()).unwrap();

        let frame = frames.recv_timeout(std::time::Duration::from_millis(500)).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&frame[4..]).unwrap();
        assert_eq!(json["event"], "begin");
        assert_eq!(json["request_id"], lease.request_id().to_string());
        assert!(!busy.is_finished());

        rt.shutdown_background();
    }

    #[test]
    fn test_resolve_rejects_garbage() {
        assert!(resolve("not an address").is_err());
        assert!(resolve("127.0.0.1:8080").is_ok());
    }
}
