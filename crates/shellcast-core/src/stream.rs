// ABOUTME: Stream multiplexer - reads stdout and stderr concurrently in bounded chunks
// ABOUTME: Forwards each chunk tagged with origin and a per-origin sequence number

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default read size for one chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Recorded as the stream error when capture is stopped before end-of-stream.
pub const CAPTURE_ABANDONED: &str = "capture abandoned: pipe held open by a detached process";

/// Which output stream of the child a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Stdout,
    Stderr,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Stdout => "stdout",
            Origin::Stderr => "stderr",
        }
    }
}

/// One unit of captured output. `seq` starts at 0 and increases by one per
/// chunk of the same origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub origin: Origin,
    pub seq: u64,
    pub data: Vec<u8>,
}

/// Totals for one origin after its stream ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub bytes: u64,
    pub chunks: u64,
    /// Leading bytes kept in memory for post-processing (stdout only).
    pub retained: Vec<u8>,
    /// True when output went past the retention limit.
    pub retained_truncated: bool,
    /// Read error that ended capture early, if any.
    pub error: Option<String>,
}

/// Totals for both origins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub stdout: StreamStats,
    pub stderr: StreamStats,
}

impl CaptureSummary {
    pub fn stats(&self, origin: Origin) -> &StreamStats {
        match origin {
            Origin::Stdout => &self.stdout,
            Origin::Stderr => &self.stderr,
        }
    }

    /// False if either stream ended on a read error.
    pub fn is_complete(&self) -> bool {
        self.stdout.error.is_none() && self.stderr.error.is_none()
    }
}

/// Reads both output streams of a child without letting one stall the other.
#[derive(Debug, Clone)]
pub struct StreamMultiplexer {
    chunk_size: usize,
    retain_stdout: usize,
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl StreamMultiplexer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            retain_stdout: 0,
        }
    }

    /// Keep up to `limit` leading stdout bytes in the returned summary.
    pub fn retain_stdout(mut self, limit: usize) -> Self {
        self.retain_stdout = limit;
        self
    }

    /// Pump both streams to `tx` until each reaches end-of-stream or `stop` fires.
    ///
    /// Each origin gets its own task. A missing stream counts as zero bytes.
    /// If the receiver goes away the streams are still drained so the child
    /// never blocks on a full pipe. Once `stop` fires every pump returns what it
    /// has and drops its sender, so `tx`'s receiver always sees the end.
    pub async fn run<O, E>(
        &self,
        stdout: Option<O>,
        stderr: Option<E>,
        tx: mpsc::Sender<OutputChunk>,
        stop: CancellationToken,
    ) -> CaptureSummary
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let stdout_task = stdout.map(|reader| {
            tokio::spawn(pump(
                reader,
                Origin::Stdout,
                self.chunk_size,
                self.retain_stdout,
                tx.clone(),
                stop.clone(),
            ))
        });
        let stderr_task = stderr.map(|reader| {
            tokio::spawn(pump(
                reader,
                Origin::Stderr,
                self.chunk_size,
                0,
                tx.clone(),
                stop.clone(),
            ))
        });
        drop(tx);

        CaptureSummary {
            stdout: join_stats(stdout_task, Origin::Stdout).await,
            stderr: join_stats(stderr_task, Origin::Stderr).await,
        }
    }
}

async fn join_stats(
    task: Option<tokio::task::JoinHandle<StreamStats>>,
    origin: Origin,
) -> StreamStats {
    match task {
        Some(handle) => handle.await.unwrap_or_else(|e| {
            tracing::error!(origin = origin.as_str(), error = %e, "Stream reader task failed");
            StreamStats {
                error: Some(e.to_string()),
                ..StreamStats::default()
            }
        }),
        None => StreamStats::default(),
    }
}

async fn pump<R>(
    mut reader: R,
    origin: Origin,
    chunk_size: usize,
    retain_limit: usize,
    tx: mpsc::Sender<OutputChunk>,
    stop: CancellationToken,
) -> StreamStats
where
    R: AsyncRead + Unpin,
{
    let mut stats = StreamStats::default();
    let mut buf = vec![0u8; chunk_size];
    let mut pending: Vec<u8> = Vec::with_capacity(chunk_size + 4);
    let mut receiver_gone = false;

    loop {
        let read = tokio::select! {
            _ = stop.cancelled() => None,
            res = reader.read(&mut buf) => Some(res),
        };
        let n = match read {
            None => {
                tracing::debug!(origin = origin.as_str(), bytes = stats.bytes, "Capture stopped before end of stream");
                stats.error = Some(CAPTURE_ABANDONED.into());
                break;
            }
            Some(Ok(0)) => break,
            Some(Ok(n)) => n,
            Some(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Some(Err(e)) => {
                tracing::warn!(
                    origin = origin.as_str(),
                    bytes = stats.bytes,
                    error = %e,
                    "Output stream read failed, keeping partial output"
                );
                stats.error = Some(e.to_string());
                break;
            }
        };

        stats.bytes += n as u64;
        retain(&mut stats, &buf[..n], retain_limit);

        pending.extend_from_slice(&buf[..n]);
        let ready = utf8_boundary(&pending);
        if ready == 0 {
            continue;
        }
        let tail = pending.split_off(ready);
        let data = std::mem::replace(&mut pending, tail);
        emit(&tx, &stop, &mut stats, origin, data, &mut receiver_gone).await;
    }

    if !pending.is_empty() {
        emit(&tx, &stop, &mut stats, origin, pending, &mut receiver_gone).await;
    }

    tracing::debug!(
        origin = origin.as_str(),
        bytes = stats.bytes,
        chunks = stats.chunks,
        "Output stream finished"
    );
    stats
}

async fn emit(
    tx: &mpsc::Sender<OutputChunk>,
    stop: &CancellationToken,
    stats: &mut StreamStats,
    origin: Origin,
    data: Vec<u8>,
    receiver_gone: &mut bool,
) {
    let chunk = OutputChunk {
        origin,
        seq: stats.chunks,
        data,
    };
    stats.chunks += 1;

    if *receiver_gone {
        return;
    }
    // a stalled receiver must not hold the pump past a stop
    let sent = tokio::select! {
        _ = stop.cancelled() => false,
        res = tx.send(chunk) => res.is_ok(),
    };
    if !sent {
        tracing::debug!(origin = origin.as_str(), "Chunk receiver closed, draining without forwarding");
        *receiver_gone = true;
    }
}

fn retain(stats: &mut StreamStats, data: &[u8], limit: usize) {
    if limit == 0 {
        return;
    }
    let room = limit.saturating_sub(stats.retained.len());
    if data.len() > room {
        stats.retained_truncated = true;
    }
    stats.retained.extend_from_slice(&data[..data.len().min(room)]);
}

/// Number of leading bytes that can be emitted without splitting a UTF-8
/// sequence. Only an incomplete trailing sequence (at most 3 bytes) is held
/// back; bytes that are not UTF-8 at all pass through untouched.
fn utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() && bytes.len() - e.valid_up_to() < 4 => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, ReadBuf};

    fn collect(rx: &mut mpsc::Receiver<OutputChunk>) -> Vec<OutputChunk> {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.push(chunk);
        }
        out
    }

    async fn run_stdout(payload: Vec<u8>, chunk_size: usize) -> (CaptureSummary, Vec<OutputChunk>) {
        let (tx, mut rx) = mpsc::channel(100_000);
        let summary = StreamMultiplexer::new(chunk_size)
            .run(Some(Cursor::new(payload)), None::<Cursor<Vec<u8>>>, tx, CancellationToken::new())
            .await;
        (summary, collect(&mut rx))
    }

    #[tokio::test]
    async fn delivers_payloads_byte_exact_without_trailing_newline() {
        for size in [0usize, 1, 8191, 8192, 8193, 100_000, 300_000] {
            let payload: Vec<u8> = (0..size).map(|i| b'a' + (i % 26) as u8).collect();
            let (summary, chunks) = run_stdout(payload.clone(), 8192).await;

            let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
            assert_eq!(joined, payload, "payload of {size} bytes");
            assert_eq!(summary.stdout.bytes, size as u64);
            assert_eq!(summary.stdout.chunks, chunks.len() as u64);
            assert!(chunks.iter().all(|c| c.data.len() <= 8192));
        }
    }

    #[tokio::test]
    async fn sequence_numbers_have_no_gaps() {
        let (_, chunks) = run_stdout(vec![b'x'; 50_000], 1000).await;
        let seqs: Vec<u64> = chunks.iter().map(|c| c.seq).collect();
        let expected: Vec<u64> = (0..chunks.len() as u64).collect();
        assert_eq!(seqs, expected);
    }

    #[tokio::test]
    async fn multibyte_characters_are_not_split_across_chunks() {
        let text = "héllo wörld — ünïcode ✓ ".repeat(20);
        let (_, chunks) = run_stdout(text.clone().into_bytes(), 5).await;

        for chunk in &chunks {
            assert!(
                std::str::from_utf8(&chunk.data).is_ok(),
                "chunk {} is not valid UTF-8",
                chunk.seq
            );
        }
        let joined: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
        assert_eq!(joined, text.into_bytes());
    }

    #[tokio::test]
    async fn binary_output_passes_through() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let (summary, chunks) = run_stdout(payload.clone(), 512).await;
        let joined: Vec<u8> = chunks.into_iter().flat_map(|c| c.data).collect();
        assert_eq!(joined, payload);
        assert_eq!(summary.stdout.bytes, 10_000);
    }

    #[tokio::test]
    async fn silent_stderr_does_not_stall_stdout() {
        let (_stderr_writer, stderr_reader) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::channel(1024);
        let mux = StreamMultiplexer::new(1024);

        let run = tokio::spawn(async move {
            mux.run(
                Some(Cursor::new(vec![b'o'; 20_000])),
                Some(stderr_reader),
                tx,
                CancellationToken::new(),
            )
                .await
        });

        let mut received = 0usize;
        while received < 20_000 {
            let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("stdout chunk should arrive while stderr is silent")
                .expect("channel open");
            assert_eq!(chunk.origin, Origin::Stdout);
            received += chunk.data.len();
        }
        assert!(!run.is_finished());
        run.abort();
    }

    struct FailingReader {
        first: Option<Vec<u8>>,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.first.take() {
                Some(data) => {
                    buf.put_slice(&data);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(std::io::Error::other("pipe broke"))),
            }
        }
    }

    #[tokio::test]
    async fn read_error_keeps_partial_output() {
        let (tx, mut rx) = mpsc::channel(16);
        let summary = StreamMultiplexer::new(64)
            .run(
                Some(FailingReader {
                    first: Some(b"partial".to_vec()),
                }),
                None::<Cursor<Vec<u8>>>,
                tx,
                CancellationToken::new(),
            )
            .await;

        assert_eq!(summary.stdout.bytes, 7);
        assert_eq!(summary.stdout.error.as_deref(), Some("pipe broke"));
        assert!(!summary.is_complete());
        let chunks = collect(&mut rx);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, b"partial");
    }

    #[tokio::test]
    async fn drains_when_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let summary = StreamMultiplexer::new(100)
            .run(Some(Cursor::new(vec![1u8; 5000])), None::<Cursor<Vec<u8>>>, tx, CancellationToken::new())
            .await;
        assert_eq!(summary.stdout.bytes, 5000);
        assert_eq!(summary.stdout.chunks, 50);
    }

    #[tokio::test]
    async fn retention_is_bounded() {
        let (tx, _rx) = mpsc::channel(1000);
        let summary = StreamMultiplexer::new(100)
            .retain_stdout(250)
            .run(Some(Cursor::new(vec![b'r'; 1000])), None::<Cursor<Vec<u8>>>, tx, CancellationToken::new())
            .await;
        assert_eq!(summary.stdout.retained.len(), 250);
        assert!(summary.stdout.retained_truncated);
    }

    #[tokio::test]
    async fn stop_ends_capture_of_streams_that_never_close() {
        let (mut stdout_writer, stdout_reader) = tokio::io::duplex(64);
        let (_stderr_writer, stderr_reader) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::channel(16);
        let stop = CancellationToken::new();

        let run = tokio::spawn({
            let stop = stop.clone();
            async move {
                StreamMultiplexer::new(64)
                    .run(Some(stdout_reader), Some(stderr_reader), tx, stop)
                    .await
            }
        });

        stdout_writer.write_all(b"early").await.expect("write");
        let first = rx.recv().await.expect("first chunk");
        assert_eq!(first.data, b"early");

        stop.cancel();
        let summary = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("pumps stop once cancelled")
            .expect("join");
        assert_eq!(summary.stdout.bytes, 5);
        assert_eq!(summary.stdout.error.as_deref(), Some(CAPTURE_ABANDONED));
        assert_eq!(summary.stderr.error.as_deref(), Some(CAPTURE_ABANDONED));
        // every sender is gone, so the consumer sees the end
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn utf8_boundary_holds_back_only_incomplete_tail() {
        let euro = "€".as_bytes();
        assert_eq!(utf8_boundary(b"abc"), 3);
        assert_eq!(utf8_boundary(&[b'a', euro[0], euro[1]]), 1);
        assert_eq!(utf8_boundary(&[0xff, 0xfe, b'a']), 3);
        assert_eq!(utf8_boundary(&euro[..1]), 0);
    }
}
