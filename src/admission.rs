//! Admission control inside one worker process
//!
//! ## Slots
//!
//! A worker owns `threads` request slots. [`GatedListener`] takes a slot
//! permit *before* calling `accept`, so once every slot is busy new
//! connections stay in the kernel backlog instead of being accepted and
//! parked in userspace.
//!
//! Each accepted connection is bound to a slot right away. The binding is a
//! [`SlotLease`] that carries the permit, so the supervisor's deadline clock
//! starts at accept and covers the upload as well as the pipeline. The lease
//! reaches handlers as connect info and is released only when the connection
//! and every pipeline task holding a clone are done.

use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use chrono::{DateTime, Utc};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::protocol::SlotEvent;

// ============================================================================
// Slot table
// ============================================================================

/// Which request occupies which slot
pub struct SlotTable {
    slots: Mutex<Vec<Option<Uuid>>>,
    events: mpsc::UnboundedSender<SlotEvent>,
}

impl SlotTable {
    pub fn new(capacity: usize, events: mpsc::UnboundedSender<SlotEvent>) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![None; capacity]),
            events,
        })
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Bind a fresh request id to the lowest free slot and announce it.
    ///
    /// `permit` is held until the lease and all its clones are dropped.
    /// `None` when every slot is taken, which the accept gate should make
    /// impossible.
    pub fn lease(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Option<SlotLease> {
        let guard = self.bind(Uuid::new_v4())?;
        Some(SlotLease {
            inner: Arc::new(LeaseInner { guard, _permit: permit }),
        })
    }

    fn bind(self: &Arc<Self>, request_id: Uuid) -> Option<SlotGuard> {
        let slot = {
            let mut slots = self.lock();
            let slot = slots.iter().position(Option::is_none)?;
            slots[slot] = Some(request_id);
            slot
        };

        let started_at = Utc::now();
        self.emit(SlotEvent::Begin {
            slot,
            request_id: request_id.to_string(),
            started_at,
        });
        debug!(request_id = %request_id, slot, "Slot bound");

        Some(SlotGuard {
            table: Arc::clone(self),
            slot,
            request_id,
            started_at,
        })
    }

    fn end(&self, slot: usize, request_id: Uuid) {
        if let Some(entry) = self.lock().get_mut(slot) {
            *entry = None;
        }
        self.emit(SlotEvent::End {
            slot,
            request_id: request_id.to_string(),
        });
        debug!(request_id = %request_id, slot, "Slot released");
    }

    fn emit(&self, event: SlotEvent) {
        if self.events.send(event).is_err() {
            warn!("Slot event reporter is gone");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Option<Uuid>>> {
        // a poisoned table still holds valid slot data
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases its slot when dropped
struct SlotGuard {
    table: Arc<SlotTable>,
    slot: usize,
    request_id: Uuid,
    started_at: DateTime<Utc>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.table.end(self.slot, self.request_id);
    }
}

/// One connection's claim on a slot and its accept permit
#[derive(Clone)]
pub struct SlotLease {
    inner: Arc<LeaseInner>,
}

// fields drop in order: the slot is released before the permit
struct LeaseInner {
    guard: SlotGuard,
    _permit: OwnedSemaphorePermit,
}

impl SlotLease {
    pub fn slot(&self) -> usize {
        self.inner.guard.slot
    }

    pub fn request_id(&self) -> Uuid {
        self.inner.guard.request_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.guard.started_at
    }
}

impl std::fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLease")
            .field("slot", &self.slot())
            .field("request_id", &self.request_id())
            .finish()
    }
}

impl Connected<IncomingStream<'_, GatedListener>> for SlotLease {
    fn connect_info(stream: IncomingStream<'_, GatedListener>) -> Self {
        stream.io().lease.clone()
    }
}

// ============================================================================
// Slot-gated accept
// ============================================================================

/// TCP listener that holds one slot per accepted connection
pub struct GatedListener {
    inner: TcpListener,
    permits: Arc<Semaphore>,
    slots: Arc<SlotTable>,
}

impl GatedListener {
    pub fn new(inner: TcpListener, slots: Arc<SlotTable>) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(slots.capacity())),
            slots,
        }
    }

    /// Connections currently holding a permit
    pub fn permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.permits)
    }
}

impl Listener for GatedListener {
    type Io = SlotStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                // the semaphore is never closed
                std::future::pending::<()>().await;
                continue;
            };

            match self.inner.accept().await {
                Ok((stream, addr)) => {
                    let Some(lease) = self.slots.lease(permit) else {
                        error!("Permit granted with no free slot; dropping {}", addr);
                        continue;
                    };
                    debug!(
                        "Accepted {} into slot {} ({} slots free)",
                        addr,
                        lease.slot(),
                        self.permits.available_permits()
                    );
                    return (SlotStream { stream, lease }, addr);
                }
                Err(e) if is_connection_error(&e) => continue,
                Err(e) => {
                    // typically EMFILE; back off instead of spinning
                    error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

/// An accepted connection holding its slot lease
pub struct SlotStream {
    stream: TcpStream,
    lease: SlotLease,
}

impl AsyncRead for SlotStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SlotStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn drain(rx: &mut mpsc::UnboundedReceiver<SlotEvent>) -> Vec<SlotEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_slot_table_binds_lowest_free_slot() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = SlotTable::new(2, tx);
        // more permits than slots so the table itself gets to refuse
        let permits = Arc::new(Semaphore::new(3));
        let permit = || Arc::clone(&permits).try_acquire_owned().unwrap();

        let a = table.lease(permit()).unwrap();
        let b = table.lease(permit()).unwrap();
        assert_eq!((a.slot(), b.slot()), (0, 1));
        assert!(table.lease(permit()).is_none());
        assert_eq!(table.in_use(), 2);

        let a_id = a.request_id();
        drop(a);
        let c = table.lease(permit()).unwrap();
        assert_eq!(c.slot(), 0);
        assert_ne!(c.request_id(), a_id);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], SlotEvent::Begin { slot: 0, request_id, .. } if *request_id == a_id.to_string()));
        assert!(matches!(&events[2], SlotEvent::End { slot: 0, request_id } if *request_id == a_id.to_string()));
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn test_lease_clones_share_one_slot_and_permit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let table = SlotTable::new(1, tx);
        let permits = Arc::new(Semaphore::new(1));

        let lease = table.lease(Arc::clone(&permits).try_acquire_owned().unwrap()).unwrap();
        let held_by_pipeline = lease.clone();
        drop(lease);

        // the connection is gone but the pipeline still holds the slot
        assert_eq!(table.in_use(), 1);
        assert_eq!(permits.available_permits(), 0);
        assert_eq!(drain(&mut rx).len(), 1);

        drop(held_by_pipeline);
        assert_eq!(table.in_use(), 0);
        assert_eq!(permits.available_permits(), 1);
        assert!(matches!(drain(&mut rx).as_slice(), [SlotEvent::End { slot: 0, .. }]));
    }

    #[tokio::test]
    async fn test_accept_binds_a_slot_before_any_bytes_arrive() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = GatedListener::new(tcp, SlotTable::new(1, tx));

        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await;

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [SlotEvent::Begin { slot: 0, request_id, .. }] if *request_id == stream.lease.request_id().to_string()
        ));

        drop(stream);
        assert!(matches!(drain(&mut rx).as_slice(), [SlotEvent::End { slot: 0, .. }]));
    }

    #[tokio::test]
    async fn test_accept_waits_for_a_free_slot() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut listener = GatedListener::new(tcp, SlotTable::new(2, tx));

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        let _c3 = TcpStream::connect(addr).await.unwrap();

        let (first, _) = listener.accept().await;
        let (_second, _) = listener.accept().await;
        assert_eq!(listener.permits().available_permits(), 0);

        // the third connection sits in the backlog while both slots are held
        assert!(timeout(Duration::from_millis(200), listener.accept()).await.is_err());

        drop(first);
        let third = timeout(Duration::from_secs(2), listener.accept()).await;
        assert!(third.is_ok());
    }
}
