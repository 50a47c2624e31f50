//! Output pump
//!
//! Moves bytes from the child's output descriptors into the connection's
//! event loop. Each source gets a blocking reader task; all of them feed one
//! bounded channel so the loop sees output in read order per stream.

use std::io::Read;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::RelayRegistration;

/// Which channel stream a chunk belongs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Normal channel data
    Stdout,
    /// Extended data, type 1
    Stderr,
}

/// A block of child output
#[derive(Debug)]
pub struct RelayChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

/// What the pump yields
#[derive(Debug)]
pub enum PumpEvent {
    Chunk(RelayChunk),
    /// The source hit EOF or failed and is no longer monitored
    Closed(OutputStream),
}

/// Reader tasks for one session's output
pub struct OutputPump {
    rx: mpsc::Receiver<PumpEvent>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    open: usize,
}

impl OutputPump {
    /// Start monitoring the registered sources
    pub fn start(registration: RelayRegistration, buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let mut tasks = vec![spawn_reader(
            OutputStream::Stdout,
            registration.stdout,
            buffer_size,
            tx.clone(),
            cancel.clone(),
        )];
        if let Some(stderr) = registration.stderr {
            tasks.push(spawn_reader(
                OutputStream::Stderr,
                stderr,
                buffer_size,
                tx.clone(),
                cancel.clone(),
            ));
        }

        let open = tasks.len();
        Self {
            rx,
            cancel,
            tasks,
            open,
        }
    }

    /// Next output event, or `None` once every source has closed
    pub async fn next(&mut self) -> Option<PumpEvent> {
        if self.open == 0 {
            return None;
        }

        let event = self.rx.recv().await;
        match &event {
            Some(PumpEvent::Closed(_)) => self.open -= 1,
            Some(PumpEvent::Chunk(_)) => {}
            None => self.open = 0,
        }
        event
    }

    /// Whether every source has reported closed
    pub fn is_drained(&self) -> bool {
        self.open == 0
    }

    /// Stop monitoring all sources.
    ///
    /// Readers blocked in `read` notice on their next wake-up; nothing more
    /// is delivered after this returns.
    pub fn deregister(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        self.open = 0;
    }

    /// Deregister and detach the reader tasks.
    ///
    /// Returns how many readers were still running.
    pub fn shutdown(mut self) -> usize {
        self.deregister();
        let running = self.tasks.iter().filter(|task| !task.is_finished()).count();
        self.tasks.clear();
        running
    }
}

impl Drop for OutputPump {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_reader(
    stream: OutputStream,
    mut reader: Box<dyn Read + Send>,
    buffer_size: usize,
    tx: mpsc::Sender<PumpEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; buffer_size];

        loop {
            if cancel.is_cancelled() {
                tracing::trace!("{:?} reader cancelled", stream);
                return;
            }

            match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("{:?} reached EOF", stream);
                    break;
                }
                Ok(n) => {
                    let chunk = RelayChunk {
                        stream,
                        data: buf[..n].to_vec(),
                    };
                    if tx.blocking_send(PumpEvent::Chunk(chunk)).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO once the slave side is fully closed
                    tracing::debug!("{:?} closed: {}", stream, e);
                    break;
                }
            }
        }

        let _ = tx.blocking_send(PumpEvent::Closed(stream));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn registration(stdout: &[u8], stderr: Option<&[u8]>) -> RelayRegistration {
        RelayRegistration {
            pid: 0,
            stdout: Box::new(Cursor::new(stdout.to_vec())),
            stderr: stderr.map(|s| Box::new(Cursor::new(s.to_vec())) as Box<dyn Read + Send>),
        }
    }

    async fn collect(pump: &mut OutputPump) -> (Vec<u8>, Vec<u8>, Vec<OutputStream>) {
        let (mut out, mut err, mut closed) = (Vec::new(), Vec::new(), Vec::new());
        while let Some(event) = pump.next().await {
            match event {
                PumpEvent::Chunk(RelayChunk {
                    stream: OutputStream::Stdout,
                    data,
                }) => out.extend(data),
                PumpEvent::Chunk(RelayChunk {
                    stream: OutputStream::Stderr,
                    data,
                }) => err.extend(data),
                PumpEvent::Closed(stream) => closed.push(stream),
            }
        }
        (out, err, closed)
    }

    #[tokio::test]
    async fn test_bytes_arrive_in_order_within_buffer_bound() {
        let input: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut pump = OutputPump::start(registration(&input, None), 1024);

        let mut seen = Vec::new();
        while let Some(event) = pump.next().await {
            if let PumpEvent::Chunk(chunk) = event {
                assert!(chunk.data.len() <= 1024);
                assert_eq!(chunk.stream, OutputStream::Stdout);
                seen.extend(chunk.data);
            }
        }

        assert_eq!(seen, input);
        assert!(pump.is_drained());
    }

    #[tokio::test]
    async fn test_streams_are_kept_apart() {
        let mut pump = OutputPump::start(registration(b"out", Some(b"err")), 16);
        let (out, err, closed) = collect(&mut pump).await;

        assert_eq!(out, b"out");
        assert_eq!(err, b"err");
        assert_eq!(closed.len(), 2);
        assert!(closed.contains(&OutputStream::Stderr));
    }

    #[tokio::test]
    async fn test_deregister_stops_delivery() {
        let mut pump = OutputPump::start(registration(b"late output", None), 4);
        pump.deregister();

        assert!(pump.is_drained());
        assert!(pump.next().await.is_none());
        pump.shutdown();
    }
}
