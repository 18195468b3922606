//! Background Response Reader
//!
//! Continuously frames inbound bytes for push-style adapters and hands every
//! frame to a [`ResponseParser`]. Parsed commands wait in a bounded queue
//! until the connector drains them.

use obd_protocol::{Command, ObdError, ResponseFramer, Transport, ASYNCHRONOUS_FRAME_CAPACITY};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Commands kept before new frames are dropped
pub const MAX_BUFFERED_COMMANDS: usize = 32;

/// Turns one adapter frame into a command, if the frame carries one
pub trait ResponseParser: Send {
    /// Frame terminator used by the adapter
    fn end_of_line(&self) -> u8;

    fn process_response(&mut self, frame: &[u8]) -> Option<Command>;
}

/// Handle to a running reader task
#[derive(Debug)]
pub struct ResponseReader {
    queue: Arc<Mutex<VecDeque<Command>>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ResponseReader {
    /// Spawn the reader on the current tokio runtime
    ///
    /// The reader stops on end of stream, on a read error or once `cancel`
    /// fires.
    pub fn start(
        transport: Transport,
        parser: Box<dyn ResponseParser>,
        cancel: CancellationToken,
    ) -> Self {
        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(MAX_BUFFERED_COMMANDS)));
        let running = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(read_loop(
            transport,
            parser,
            queue.clone(),
            running.clone(),
            cancel.clone(),
        ));

        Self {
            queue,
            running,
            cancel,
            task,
        }
    }

    /// Take every command parsed since the last call, in arrival order
    pub fn pull_available_commands(&self) -> Vec<Command> {
        lock_queue(&self.queue).drain(..).collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop reading; idempotent
    pub fn shutdown(&self) {
        if self.is_running() {
            info!("Shutting down response reader");
        }
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Whether the reader task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ResponseReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Lock the queue, recovering it if a holder panicked
fn lock_queue(queue: &Mutex<VecDeque<Command>>) -> MutexGuard<'_, VecDeque<Command>> {
    queue.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
        warn!("Response queue lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

async fn read_loop(
    transport: Transport,
    mut parser: Box<dyn ResponseParser>,
    queue: Arc<Mutex<VecDeque<Command>>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut framer = ResponseFramer::new(ASYNCHRONOUS_FRAME_CAPACITY, parser.end_of_line(), &[]);
    let mut chunk = [0u8; ASYNCHRONOUS_FRAME_CAPACITY];

    let reason: ObdError = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break ObdError::Cancelled,
            read = transport.read_chunk(&mut chunk) => read,
        };
        let count = match read {
            Ok(count) => count,
            Err(e) => break e,
        };

        for frame in framer.push_slice(&chunk[..count]) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Discarding frame: {}", e);
                    continue;
                }
            };
            if frame.is_empty() {
                continue;
            }
            debug!("<- {}", String::from_utf8_lossy(&frame));

            // frames are parsed even while the queue is full
            if let Some(command) = parser.process_response(&frame) {
                let mut pending = lock_queue(&queue);
                if pending.len() < MAX_BUFFERED_COMMANDS {
                    pending.push_back(command);
                } else {
                    debug!("Response queue full, dropping {}", command.name());
                }
            }
        }
    };

    match reason {
        ObdError::Cancelled => debug!("Response reader cancelled"),
        e => warn!("Response reader stopped: {}", e),
    }
    running.store(false, Ordering::SeqCst);
}
