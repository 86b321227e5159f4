// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Named Pipe Channels
//!
//! POSIX FIFOs back both the shared ingest channel and every agent's
//! dedicated outbound channel.
//!
//! Writers are opened non-blocking: opening a FIFO nobody reads fails with
//! `ENXIO` instead of hanging the broker. [`FifoChannel`] treats that as
//! "not yet connected" and retries the open on the next send, so an agent
//! whose companion starts late is picked up as soon as it opens its end.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::stat::Mode;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::channel::{AgentTransport, ChannelEndpoint, ChannelError, OutboundChannel};

const CONNECT_POLL: Duration = Duration::from_millis(25);

/// Creates a FIFO at `path`, or accepts an existing one.
pub fn ensure_fifo(path: &Path) -> Result<(), ChannelError> {
    match nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o666)) {
        Ok(()) => {
            debug!(path = %path.display(), "Created named pipe");
            Ok(())
        }
        Err(Errno::EEXIST) => {
            let metadata = std::fs::metadata(path).map_err(|e| ChannelError::CreateFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            if metadata.file_type().is_fifo() {
                Ok(())
            } else {
                Err(ChannelError::CreateFailed {
                    path: path.to_path_buf(),
                    reason: "path exists and is not a named pipe".to_string(),
                })
            }
        }
        Err(errno) => Err(ChannelError::CreateFailed {
            path: path.to_path_buf(),
            reason: errno.desc().to_string(),
        }),
    }
}

/// Opens the read end of the ingest channel, creating it if needed.
///
/// On Linux the FIFO is opened read-write so the broker itself counts as a
/// writer: the pipe never reports end-of-stream when the last companion
/// closes its end.
pub fn open_ingest(path: &Path) -> Result<pipe::Receiver, ChannelError> {
    ensure_fifo(path)?;

    let mut options = pipe::OpenOptions::new();
    #[cfg(target_os = "linux")]
    options.read_write(true);

    options
        .open_receiver(path)
        .map_err(|source| ChannelError::OpenFailed {
            channel: path.display().to_string(),
            source,
        })
}

enum WriterState {
    Idle,
    Open(OpenWriter),
    Closed,
}

struct OpenWriter {
    sender: pipe::Sender,
    /// Tail of a frame that was cut off by the write timeout. It goes out
    /// before any later frame so the reader never sees a torn line.
    unsent: Vec<u8>,
}

impl OpenWriter {
    fn new(sender: pipe::Sender) -> Self {
        Self {
            sender,
            unsent: Vec::new(),
        }
    }
}

/// Writes as much of `bytes` as the reader accepts before `deadline`.
/// Returns the number of bytes written.
async fn write_until(
    sender: &mut pipe::Sender,
    bytes: &[u8],
    deadline: Instant,
) -> std::io::Result<usize> {
    let mut written = 0;
    while written < bytes.len() {
        // `write` is cancel safe: a timed-out call has written nothing.
        match tokio::time::timeout_at(deadline, sender.write(&bytes[written..])).await {
            Ok(Ok(0)) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(Ok(n)) => written += n,
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        }
    }
    Ok(written)
}

/// Write end of one agent's named pipe.
///
/// The writer lives behind an async mutex: a frame is written completely
/// before the next `send` starts, and frames for different agents never
/// contend with each other.
///
/// A frame only partly accepted within the write timeout is not abandoned.
/// The writer stays open and the remainder is flushed ahead of the next
/// frame, so the reader never sees a truncated line.
pub struct FifoChannel {
    endpoint: ChannelEndpoint,
    write_timeout: Duration,
    writer: Mutex<WriterState>,
    connected: AtomicBool,
}

impl FifoChannel {
    pub fn new(endpoint: ChannelEndpoint, write_timeout: Duration) -> Self {
        Self {
            endpoint,
            write_timeout,
            writer: Mutex::new(WriterState::Idle),
            connected: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &ChannelEndpoint {
        &self.endpoint
    }

    fn open_sender(&self) -> Result<pipe::Sender, ChannelError> {
        pipe::OpenOptions::new()
            .open_sender(self.endpoint.path())
            .map_err(|source| {
                if source.raw_os_error() == Some(Errno::ENXIO as i32) {
                    ChannelError::NoReader(self.endpoint.name().to_string())
                } else {
                    ChannelError::OpenFailed {
                        channel: self.endpoint.name().to_string(),
                        source,
                    }
                }
            })
    }

    /// Waits up to `timeout` for a reader to appear, then gives up quietly.
    /// Returns whether the writer is open.
    pub async fn try_connect(&self, timeout: Duration) -> bool {
        let mut writer = self.writer.lock().await;
        if matches!(*writer, WriterState::Open(_)) {
            return true;
        }
        if matches!(*writer, WriterState::Closed) {
            return false;
        }

        let attempt = async {
            loop {
                match self.open_sender() {
                    Ok(sender) => return Some(sender),
                    Err(ChannelError::NoReader(_)) => tokio::time::sleep(CONNECT_POLL).await,
                    Err(e) => {
                        warn!(
                            channel = %self.endpoint.name(),
                            error = %e,
                            "Failed to open agent channel"
                        );
                        return None;
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Some(sender)) => {
                *writer = WriterState::Open(OpenWriter::new(sender));
                self.connected.store(true, Ordering::Release);
                debug!(channel = %self.endpoint.name(), "Agent channel connected");
                true
            }
            Ok(None) => false,
            Err(_) => {
                info!(
                    channel = %self.endpoint.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "No reader on agent channel yet; will retry on first delivery"
                );
                false
            }
        }
    }
}

#[async_trait]
impl OutboundChannel for FifoChannel {
    async fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;

        if matches!(*writer, WriterState::Closed) {
            return Err(ChannelError::Closed(self.endpoint.name().to_string()));
        }
        if matches!(*writer, WriterState::Idle) {
            let sender = self.open_sender()?;
            *writer = WriterState::Open(OpenWriter::new(sender));
            self.connected.store(true, Ordering::Release);
            debug!(channel = %self.endpoint.name(), "Agent channel reconnected");
        }

        let WriterState::Open(OpenWriter { sender, unsent }) = &mut *writer else {
            return Err(ChannelError::NotConnected(self.endpoint.name().to_string()));
        };

        let deadline = Instant::now() + self.write_timeout;
        let result = async {
            if !unsent.is_empty() {
                let flushed = write_until(sender, unsent, deadline).await?;
                unsent.drain(..flushed);
                if !unsent.is_empty() {
                    // Still backed up: this frame is dropped, not queued.
                    return Ok(false);
                }
            }

            let written = write_until(sender, frame, deadline).await?;
            if written < frame.len() {
                if written > 0 {
                    unsent.extend_from_slice(&frame[written..]);
                    debug!(
                        channel = %self.endpoint.name(),
                        pending = unsent.len(),
                        "Frame partly written; remainder goes out before the next one"
                    );
                }
                return Ok(false);
            }
            Ok::<_, std::io::Error>(true)
        }
        .await;

        match result {
            Ok(true) => Ok(()),
            Ok(false) => Err(ChannelError::WriteTimedOut {
                channel: self.endpoint.name().to_string(),
                timeout: self.write_timeout,
            }),
            Err(source) => {
                // EPIPE: the reader went away. Reopen lazily on the next send.
                *writer = WriterState::Idle;
                self.connected.store(false, Ordering::Release);
                Err(ChannelError::WriteFailed {
                    channel: self.endpoint.name().to_string(),
                    source,
                })
            }
        }
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        *writer = WriterState::Closed;
        self.connected.store(false, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Provisions agent channels as FIFOs under a common directory.
#[derive(Debug, Clone)]
pub struct FifoTransport {
    channel_dir: PathBuf,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl FifoTransport {
    pub fn new(
        channel_dir: impl Into<PathBuf>,
        connect_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            channel_dir: channel_dir.into(),
            connect_timeout,
            write_timeout,
        }
    }

    /// Absolute names are used as-is; anything else lives in the channel dir.
    pub fn resolve(&self, name: &str) -> PathBuf {
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.channel_dir.join(candidate)
        }
    }
}

#[async_trait]
impl AgentTransport for FifoTransport {
    async fn provision(&self, name: &str) -> Result<ChannelEndpoint, ChannelError> {
        let path = self.resolve(name);
        ensure_fifo(&path)?;
        Ok(ChannelEndpoint::new(name, path))
    }

    async fn connect(&self, endpoint: &ChannelEndpoint) -> Arc<dyn OutboundChannel> {
        let channel = FifoChannel::new(endpoint.clone(), self.write_timeout);
        channel.try_connect(self.connect_timeout).await;
        Arc::new(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[test]
    fn test_ensure_fifo_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("robot1");

        ensure_fifo(&path).unwrap();
        ensure_fifo(&path).unwrap();

        let file_type = std::fs::metadata(&path).unwrap().file_type();
        assert!(file_type.is_fifo());
    }

    #[test]
    fn test_ensure_fifo_rejects_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, b"not a pipe").unwrap();

        let err = ensure_fifo(&path).unwrap_err();
        assert!(matches!(err, ChannelError::CreateFailed { .. }));
    }

    #[test]
    fn test_resolve_channel_names() {
        let transport = FifoTransport::new("/var/run/proxcast", Duration::ZERO, Duration::ZERO);
        assert_eq!(
            transport.resolve("robot1"),
            PathBuf::from("/var/run/proxcast/robot1")
        );
        assert_eq!(transport.resolve("/tmp/robot1"), PathBuf::from("/tmp/robot1"));
    }

    #[tokio::test]
    async fn test_send_without_reader_is_reported_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FifoTransport::new(
            dir.path(),
            Duration::from_millis(50),
            Duration::from_millis(200),
        );

        let endpoint = transport.provision("robot2").await.unwrap();
        let channel = transport.connect(&endpoint).await;
        assert!(!channel.is_connected());

        let err = channel.send(b"{}\n").await.unwrap_err();
        assert!(matches!(err, ChannelError::NoReader(_)));

        let receiver = pipe::OpenOptions::new().open_receiver(endpoint.path()).unwrap();
        channel.send(b"{\"sender_id\":1}\n").await.unwrap();
        assert!(channel.is_connected());

        let mut lines = BufReader::new(receiver).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "{\"sender_id\":1}");
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FifoTransport::new(
            dir.path(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        let endpoint = transport.provision("robot3").await.unwrap();
        let receiver = pipe::OpenOptions::new().open_receiver(endpoint.path()).unwrap();

        let channel = transport.connect(&endpoint).await;
        assert!(channel.is_connected());
        channel.send(b"first\n").await.unwrap();
        channel.send(b"second\n").await.unwrap();

        let mut lines = BufReader::new(receiver).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "first");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "second");
    }

    #[tokio::test]
    async fn test_closed_channel_refuses_sends() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FifoTransport::new(
            dir.path(),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        let endpoint = transport.provision("robot4").await.unwrap();
        let channel = transport.connect(&endpoint).await;

        channel.close().await;
        assert!(matches!(channel.send(b"x\n").await, Err(ChannelError::Closed(_))));
    }

    #[tokio::test]
    async fn test_timed_out_frame_is_finished_before_the_next() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FifoTransport::new(
            dir.path(),
            Duration::from_millis(200),
            Duration::from_millis(100),
        );
        let endpoint = transport.provision("robot5").await.unwrap();
        let receiver = pipe::OpenOptions::new().open_receiver(endpoint.path()).unwrap();
        let channel = transport.connect(&endpoint).await;
        assert!(channel.is_connected());

        // Larger than the pipe buffer, and nobody is reading yet.
        let mut large = vec![b'a'; 200_000];
        large.push(b'\n');
        let err = channel.send(&large).await.unwrap_err();
        assert!(matches!(err, ChannelError::WriteTimedOut { .. }));
        assert!(channel.is_connected());

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(receiver).lines();
            let first = lines.next_line().await.unwrap().unwrap();
            let second = lines.next_line().await.unwrap().unwrap();
            (first, second)
        });
        channel.send(b"next\n").await.unwrap();

        let (first, second) = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.len(), 200_000);
        assert!(first.bytes().all(|b| b == b'a'));
        assert_eq!(second, "next");
    }

    #[tokio::test]
    async fn test_backed_up_channel_drops_new_frames_whole() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FifoTransport::new(
            dir.path(),
            Duration::from_millis(200),
            Duration::from_millis(50),
        );
        let endpoint = transport.provision("robot6").await.unwrap();
        let receiver = pipe::OpenOptions::new().open_receiver(endpoint.path()).unwrap();
        let channel = transport.connect(&endpoint).await;

        let mut large = vec![b'b'; 200_000];
        large.push(b'\n');
        assert!(channel.send(&large).await.is_err());
        // Reader still stalled: the tail stays queued and this frame is skipped.
        assert!(matches!(
            channel.send(b"skipped\n").await,
            Err(ChannelError::WriteTimedOut { .. })
        ));

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(receiver).lines();
            let first = lines.next_line().await.unwrap().unwrap();
            let second = lines.next_line().await.unwrap().unwrap();
            (first, second)
        });
        channel.send(b"after\n").await.unwrap();

        let (first, second) = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.len(), 200_000);
        assert_eq!(second, "after");
    }

    #[tokio::test]
    async fn test_ingest_reads_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest");
        let receiver = open_ingest(&path).unwrap();

        let mut sender = pipe::OpenOptions::new().open_sender(&path).unwrap();
        sender.write_all(b"hello\n").await.unwrap();
        drop(sender);

        let mut lines = BufReader::new(receiver).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "hello");
    }
}
