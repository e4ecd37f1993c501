use crate::envelope::{decode_line, Envelope};
use crate::observability::ScalerMetrics;
use crate::router::MessageRouter;
use crate::shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default cap on one envelope line, newline included
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Dispatch pool and framing limits of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Concurrent dispatch workers
    pub pool_size: usize,
    /// Longer lines are discarded as malformed
    pub max_line_bytes: usize,
}

impl ListenerOptions {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self::new(16)
    }
}

/// Running listener
pub struct ListenerHandle {
    local_addr: SocketAddr,
    trigger: ShutdownTrigger,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and end open reads.
    /// Handlers already submitted keep running.
    pub async fn shutdown(self) {
        self.trigger.trigger();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }
    }
}

/// Bind `addr` and start accepting envelope connections
pub async fn listen<A: ToSocketAddrs>(
    addr: A,
    router: Arc<MessageRouter>,
    options: ListenerOptions,
) -> std::io::Result<ListenerHandle> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let (trigger, shutdown) = shutdown_channel();

    let pool = WorkerPool::start(router, options.pool_size);
    let task = tokio::spawn(accept_loop(
        listener,
        pool,
        options.max_line_bytes.max(1),
        shutdown,
    ));

    info!(
        addr = %local_addr,
        pool_size = options.pool_size,
        max_line_bytes = options.max_line_bytes,
        "Envelope listener started"
    );
    Ok(ListenerHandle {
        local_addr,
        trigger,
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    pool: WorkerPool,
    max_line_bytes: usize,
    mut shutdown: ShutdownSignal,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.triggered() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted connection");
                tokio::spawn(read_connection(
                    stream,
                    peer,
                    pool.clone(),
                    max_line_bytes,
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
            }
        }
    }

    info!("Envelope listener stopped");
}

/// Read newline-delimited envelopes until EOF. Never waits on handlers.
async fn read_connection(
    stream: TcpStream,
    peer: SocketAddr,
    pool: WorkerPool,
    max_line_bytes: usize,
    mut shutdown: ShutdownSignal,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = shutdown.triggered() => break,
            read = read_line(&mut reader, &mut buf, max_line_bytes) => read,
        };

        match read {
            Ok(Line::Eof) => break,
            Ok(Line::Complete) => {}
            Ok(Line::Oversized) => {
                warn!(peer = %peer, max_line_bytes, "Discarding oversized line");
                pool.metrics.inc_rejected("malformed");
                continue;
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Connection read failed");
                break;
            }
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim(),
            Err(e) => {
                warn!(peer = %peer, error = %e, "Discarding non UTF-8 line");
                pool.metrics.inc_rejected("malformed");
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }

        match decode_line(line) {
            Ok(envelope) => {
                pool.metrics.inc_received(envelope.kind());
                pool.submit(envelope);
            }
            Err(e) => {
                warn!(peer = %peer, reason = e.reason(), error = %e, "Discarding envelope");
                pool.metrics.inc_rejected(e.reason());
            }
        }
    }

    debug!(peer = %peer, "Connection closed");
}

enum Line {
    Eof,
    Complete,
    /// Reached the cap without a newline; the rest of the line was skipped
    Oversized,
}

/// Read one line into `buf`, holding at most `max` bytes of it in memory
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let limit = max as u64;
    if (&mut *reader).take(limit).read_until(b'\n', buf).await? == 0 {
        return Ok(Line::Eof);
    }
    if buf.last() == Some(&b'\n') || buf.len() < max {
        return Ok(Line::Complete);
    }

    loop {
        buf.clear();
        let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
        if read == 0 || buf.last() == Some(&b'\n') {
            break;
        }
    }
    buf.clear();
    Ok(Line::Oversized)
}

/// Fixed set of dispatch workers draining one FIFO queue.
///
/// Envelopes leave the queue in the order readers submitted them, so a
/// connection's envelopes start dispatch in arrival order. Workers exit once
/// every reader and the accept loop have dropped their handle and the queue
/// is drained.
#[derive(Clone)]
struct WorkerPool {
    queue: mpsc::UnboundedSender<Envelope>,
    metrics: ScalerMetrics,
}

impl WorkerPool {
    fn start(router: Arc<MessageRouter>, size: usize) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..size.max(1) {
            let router = Arc::clone(&router);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(envelope) = next else {
                        break;
                    };
                    router.dispatch(envelope).await;
                }
                debug!(worker, "Dispatch worker stopped");
            });
        }

        Self {
            queue,
            metrics: ScalerMetrics::new(),
        }
    }

    /// Queue for dispatch; never waits on handlers
    fn submit(&self, envelope: Envelope) {
        if self.queue.send(envelope).is_err() {
            warn!("Dispatch workers gone, dropping envelope");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn lines(input: &[u8], max: usize) -> Vec<Result<String, &'static str>> {
        let mut reader = input;
        let mut buf = Vec::new();
        let mut out = Vec::new();
        loop {
            buf.clear();
            match read_line(&mut reader, &mut buf, max).await.unwrap() {
                Line::Eof => break,
                Line::Complete => out.push(Ok(String::from_utf8(buf.clone()).unwrap())),
                Line::Oversized => out.push(Err("oversized")),
            }
        }
        out
    }

    #[tokio::test]
    async fn test_read_line_skips_rest_of_oversized_line() {
        let input = b"short\n0123456789abcdefghij\nnext\n";
        assert_eq!(
            lines(input, 8).await,
            vec![
                Ok("short\n".to_string()),
                Err("oversized"),
                Ok("next\n".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_line_keeps_unterminated_tail() {
        assert_eq!(lines(b"tail", 8).await, vec![Ok("tail".to_string())]);
        assert_eq!(lines(b"0123456789", 8).await, vec![Err("oversized")]);
    }
}
