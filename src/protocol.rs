//! Worker → supervisor slot event channel
//!
//! Workers write length-prefixed JSON frames (4-byte big-endian length, then
//! the body) to stdout. The supervisor reads them from the child's pipe and
//! derives each slot's deadline from the `Begin` timestamp. Frames are written
//! by a dedicated reporter thread fed through an unbounded channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::thread;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Upper bound on one frame body
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SlotEvent {
    /// Worker is listening with `slots` request slots
    Ready { pid: u32, slots: usize },
    /// A request was bound to `slot`
    Begin {
        slot: usize,
        request_id: String,
        started_at: DateTime<Utc>,
    },
    /// `slot` was released
    End { slot: usize, request_id: String },
}

/// Length prefix plus JSON body for one event
pub fn encode_frame(event: &SlotEvent) -> io::Result<Vec<u8>> {
    let body = serde_json::to_vec(event)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {}", body.len(), MAX_FRAME_LEN),
        ));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Next frame, or `None` when the writer closed the stream between frames
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<SlotEvent>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} exceeds {}", len, MAX_FRAME_LEN),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let event = serde_json::from_slice(&body)?;
    Ok(Some(event))
}

/// Destination for slot events
pub trait EventSink: Send + 'static {
    fn send(&mut self, event: &SlotEvent) -> io::Result<()>;
}

/// Frames events onto a blocking writer (stdout in a worker)
pub struct FramedWriter<W> {
    writer: W,
}

impl<W: Write> FramedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send + 'static> EventSink for FramedWriter<W> {
    fn send(&mut self, event: &SlotEvent) -> io::Result<()> {
        let frame = encode_frame(event)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()
    }
}

/// Start the thread that owns `sink` and forwards queued events to it.
///
/// The thread lives outside the async runtime and its blocking pool, so a
/// worker with every slot busy still reports `Begin`/`End` immediately. It
/// exits once every sender is dropped.
pub fn spawn_reporter<S: EventSink>(
    events: mpsc::UnboundedReceiver<SlotEvent>,
    sink: S,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("slot-events".to_string())
        .spawn(move || pump_events(events, sink))
}

/// A sink failure means the supervisor is gone; remaining events are drained
/// and dropped so request handling never blocks on it.
fn pump_events<S: EventSink>(mut events: mpsc::UnboundedReceiver<SlotEvent>, mut sink: S) {
    let mut healthy = true;
    while let Some(event) = events.blocking_recv() {
        if !healthy {
            continue;
        }
        match sink.send(&event) {
            Ok(()) => debug!("Reported {:?}", event),
            Err(e) => {
                warn!("Slot event channel closed: {}", e);
                healthy = false;
            }
        }
    }
}
