//! Async pump that drains the child's stderr pipe through a [`Scanner`].
//!
//! The pump must keep reading for the whole life of the child: if the pipe
//! fills up, the child blocks on its next write to stderr. For that reason
//! failures on the forwarding side are logged and swallowed, never allowed to
//! stop the drain.

use crate::config::DetectorConfig;
use crate::scanner::{Scanner, Verdict};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read size for each chunk pulled from the pipe.
pub const CHUNK_SIZE: usize = 4096;

/// Everything the pump knows once the stream has ended.
#[derive(Debug)]
pub struct ScanOutcome<W> {
    pub verdict: Verdict,
    /// The sink, handed back so late releases keep their ordering.
    pub sink: W,
    pub bytes_read: u64,
    pub bytes_forwarded: u64,
}

/// Writes forwarded bytes, remembering whether the sink is still usable.
struct Forwarder<W> {
    sink: W,
    broken: bool,
    forwarded: u64,
}

impl<W: AsyncWrite + Unpin> Forwarder<W> {
    async fn forward(&mut self, bytes: &[u8]) {
        if bytes.is_empty() || self.broken {
            return;
        }
        match write_through(&mut self.sink, bytes).await {
            Ok(()) => self.forwarded += bytes.len() as u64,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "failed to forward child stderr, discarding further output"
                );
                self.broken = true;
            }
        }
    }
}

/// Write and flush, so forwarded stderr shows up as soon as the child wrote it.
pub async fn write_through<W: AsyncWrite + Unpin>(sink: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    sink.write_all(bytes).await?;
    sink.flush().await
}

/// Drain `reader` to end of stream, forwarding ordinary bytes to `sink`.
pub async fn pump<R, W>(mut reader: R, sink: W, detector: &DetectorConfig) -> ScanOutcome<W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut scanner = Scanner::new(detector);
    let mut forwarder = Forwarder {
        sink,
        broken: false,
        forwarded: 0,
    };
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut out = Vec::with_capacity(CHUNK_SIZE);
    let mut bytes_read = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read child stderr, treating as end of stream");
                break;
            }
        };
        bytes_read += n as u64;
        scanner.feed(&buf[..n], &mut out);
        forwarder.forward(&out).await;
        out.clear();
    }

    let verdict = scanner.finish(&mut out);
    forwarder.forward(&out).await;

    tracing::debug!(
        bytes_read,
        bytes_forwarded = forwarder.forwarded,
        verdict = verdict_name(&verdict),
        "child stderr closed"
    );

    ScanOutcome {
        verdict,
        sink: forwarder.sink,
        bytes_read,
        bytes_forwarded: forwarder.forwarded,
    }
}

fn verdict_name(verdict: &Verdict) -> &'static str {
    match verdict {
        Verdict::Clean => "clean",
        Verdict::Verified(_) => "verified",
        Verdict::Unconfirmed(_) => "unconfirmed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Feed `chunks` through a tiny duplex pipe so reads arrive piecemeal.
    async fn pump_chunks(chunks: Vec<Vec<u8>>, detector: DetectorConfig) -> ScanOutcome<Vec<u8>> {
        let (mut tx, rx) = tokio::io::duplex(7);
        let writer = tokio::spawn(async move {
            for chunk in chunks {
                tx.write_all(&chunk).await.unwrap();
            }
        });
        let outcome = pump(rx, Vec::new(), &detector).await;
        writer.await.unwrap();
        outcome
    }

    struct BrokenSink;

    impl AsyncWrite for BrokenSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "closed",
            )))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_pump_forwards_plain_output() {
        let input: &[u8] = b"line one\nline two\n";
        let outcome = pump(input, Vec::new(), &DetectorConfig::default()).await;
        assert_eq!(outcome.sink, b"line one\nline two\n");
        assert_eq!(outcome.verdict, Verdict::Clean);
        assert_eq!(outcome.bytes_read, 18);
        assert_eq!(outcome.bytes_forwarded, 18);
    }

    #[tokio::test]
    async fn test_pump_withholds_verified_report() {
        let detector = DetectorConfig {
            window: 32,
            ..Default::default()
        };
        let outcome = pump_chunks(
            vec![
                b"starting\nthr".to_vec(),
                b"ead 'main' panicked at src/lib.rs:1:1:\n".to_vec(),
                b"oops\n".to_vec(),
            ],
            detector,
        )
        .await;

        assert_eq!(outcome.sink, b"starting\n");
        assert_eq!(
            outcome.verdict,
            Verdict::Verified(b"thread 'main' panicked at src/lib.rs:1:1:\noops\n".to_vec())
        );
        assert_eq!(outcome.bytes_forwarded, 9);
    }

    #[tokio::test]
    async fn test_pump_releases_false_alarm() {
        let detector = DetectorConfig {
            window: 16,
            ..Default::default()
        };
        let text = b"spawned thread 'io-1' for uploads\n".to_vec();
        let outcome = pump_chunks(vec![text.clone()], detector).await;
        assert_eq!(outcome.sink, text);
        assert_eq!(outcome.verdict, Verdict::Clean);
    }

    #[tokio::test]
    async fn test_pump_keeps_draining_when_sink_fails() {
        let mut input = b"noise\n".repeat(2000);
        input.extend_from_slice(b"thread 'main' panicked at here\n");
        let outcome = pump(input.as_slice(), BrokenSink, &DetectorConfig::default()).await;

        assert_eq!(outcome.bytes_read, input.len() as u64);
        assert_eq!(outcome.bytes_forwarded, 0);
        assert!(matches!(outcome.verdict, Verdict::Unconfirmed(_)));
    }
}
