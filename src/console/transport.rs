use std::io::ErrorKind;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error, Diagnostic)]
pub enum TransportError {
    #[error("no {marker:?} on the console within {}s", .timeout.as_secs())]
    Timeout {
        marker: String,
        timeout: Duration,
        /// Output received since the last match.
        pending: String,
    },

    #[error("console stream closed")]
    #[diagnostic(help("the console process exited or the transport was closed externally"))]
    Closed { pending: String },

    #[error("failed to open console: {message}")]
    Open { message: String },

    #[error("console I/O failed")]
    Io(#[source] std::io::Error),
}

impl TransportError {
    fn from_io(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof => {
                TransportError::Closed {
                    pending: String::new(),
                }
            }
            _ => TransportError::Io(e),
        }
    }
}

/// Receives console output as it arrives, whether or not a marker matches.
pub trait OutputSink {
    fn append(&mut self, text: &str);
}

impl OutputSink for String {
    fn append(&mut self, text: &str) {
        self.push_str(text);
    }
}

impl<S: OutputSink> OutputSink for Option<S> {
    fn append(&mut self, text: &str) {
        if let Some(sink) = self {
            sink.append(text);
        }
    }
}

/// A bidirectional text stream to a machine's console.
///
/// Only one caller may drive a transport at a time; `&mut self` on every
/// method enforces that.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait ConsoleTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read until `marker` appears or `timeout` elapses. Returns everything
    /// received up to and including the marker; later output stays buffered
    /// for the next call.
    ///
    /// Output is handed to `sink` as it is read, so a slow phase shows up
    /// in the transcript before it matches or times out. Each byte reaches
    /// the sink once across calls.
    async fn read_until(
        &mut self,
        marker: &str,
        timeout: Duration,
        sink: &mut dyn OutputSink,
    ) -> Result<String, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;

    /// Send `line` followed by a newline.
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.write(&bytes).await
    }
}

/// Marker matching over any reader/writer pair (child stdio, pty, duplex pipe).
pub struct StreamTransport<R, W> {
    reader: R,
    writer: W,
    buffer: Vec<u8>,
    /// Prefix of `buffer` already handed to a sink.
    logged: usize,
    eof: bool,
    closed: bool,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            buffer: Vec::new(),
            logged: 0,
            eof: false,
            closed: false,
        }
    }

    fn pending(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    /// Hand unlogged output up to `end` to the sink. Unless `whole`, a
    /// multibyte character cut off by the read boundary waits for the rest.
    fn log_output(&mut self, end: usize, whole: bool, sink: &mut dyn OutputSink) {
        if end <= self.logged {
            return;
        }
        let unlogged = &self.buffer[self.logged..end];
        let take = if whole {
            unlogged.len()
        } else {
            complete_utf8_len(unlogged)
        };
        if take > 0 {
            sink.append(&String::from_utf8_lossy(&unlogged[..take]));
            self.logged += take;
        }
    }

    fn log_all(&mut self, sink: &mut dyn OutputSink) {
        self.log_output(self.buffer.len(), true, sink);
    }
}

/// Length of `bytes` minus a trailing incomplete UTF-8 sequence.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl<R, W> ConsoleTransport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed {
                pending: String::new(),
            });
        }
        self.writer
            .write_all(bytes)
            .await
            .map_err(TransportError::from_io)?;
        self.writer.flush().await.map_err(TransportError::from_io)
    }

    async fn read_until(
        &mut self,
        marker: &str,
        timeout: Duration,
        sink: &mut dyn OutputSink,
    ) -> Result<String, TransportError> {
        let deadline = Instant::now() + timeout;
        let needle = marker.as_bytes();
        let mut chunk = [0u8; READ_CHUNK];
        // Bytes before this offset were already searched, less the tail a
        // marker split across reads could start in.
        let mut search_from = 0;

        loop {
            if let Some(pos) = find(&self.buffer[search_from..], needle) {
                let end = search_from + pos + needle.len();
                self.log_output(end, true, sink);
                let matched: Vec<u8> = self.buffer.drain(..end).collect();
                self.logged -= end;
                return Ok(String::from_utf8_lossy(&matched).into_owned());
            }
            if self.eof || self.closed {
                self.log_all(sink);
                return Err(TransportError::Closed {
                    pending: self.pending(),
                });
            }

            match tokio::time::timeout_at(deadline, self.reader.read(&mut chunk)).await {
                Err(_) => {
                    self.log_all(sink);
                    return Err(TransportError::Timeout {
                        marker: marker.to_string(),
                        timeout,
                        pending: self.pending(),
                    });
                }
                Ok(Ok(0)) => self.eof = true,
                Ok(Ok(n)) => {
                    search_from = self
                        .buffer
                        .len()
                        .saturating_sub(needle.len().saturating_sub(1));
                    self.buffer.extend_from_slice(&chunk[..n]);
                    self.log_output(self.buffer.len(), false, sink);
                }
                Ok(Err(e)) => {
                    self.log_all(sink);
                    return Err(match TransportError::from_io(e) {
                        TransportError::Closed { .. } => TransportError::Closed {
                            pending: self.pending(),
                        },
                        other => other,
                    });
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) => match TransportError::from_io(e) {
                TransportError::Closed { .. } => Ok(()),
                other => Err(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};

    type Pipe = StreamTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pipe() -> (Pipe, DuplexStream) {
        let (ours, theirs) = duplex(1024);
        let (r, w) = split(ours);
        (StreamTransport::new(r, w), theirs)
    }

    #[tokio::test]
    async fn returns_text_through_marker_and_keeps_the_rest() {
        let (mut t, mut console) = pipe();
        console.write_all(b"booting...\nboot: rest").await.unwrap();

        let mut seen = String::new();
        let got = t
            .read_until("boot:", Duration::from_secs(1), &mut seen)
            .await
            .unwrap();
        assert_eq!(got, "booting...\nboot:");

        console.write_all(b" more\nlogin:").await.unwrap();
        let got = t
            .read_until("login:", Duration::from_secs(1), &mut seen)
            .await
            .unwrap();
        assert_eq!(got, " rest more\nlogin:");
        assert_eq!(seen, "booting...\nboot: rest more\nlogin:");
    }

    #[tokio::test]
    async fn marker_split_across_reads() {
        let (mut t, mut console) = pipe();
        let writer = tokio::spawn(async move {
            console.write_all(b"Loading vm").await.unwrap();
            tokio::task::yield_now().await;
            console.write_all(b"linuz\n").await.unwrap();
            console
        });
        let got = t
            .read_until("Loading vmlinuz", Duration::from_secs(5), &mut String::new())
            .await
            .unwrap();
        assert!(got.ends_with("Loading vmlinuz"));
        drop(writer.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_pending_output() {
        let (mut t, mut console) = pipe();
        console.write_all(b"partial output").await.unwrap();

        let start = Instant::now();
        let mut seen = String::new();
        let err = t
            .read_until("never", Duration::from_secs(30), &mut seen)
            .await
            .unwrap_err();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(31), "{elapsed:?}");
        match err {
            TransportError::Timeout {
                marker, pending, ..
            } => {
                assert_eq!(marker, "never");
                assert_eq!(pending, "partial output");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(seen, "partial output");
    }

    #[tokio::test(start_paused = true)]
    async fn output_reaches_sink_before_the_marker() {
        let (mut t, mut console) = pipe();
        console.write_all(b"Booting from DVD...\n").await.unwrap();

        let mut seen = String::new();
        let waiting = tokio::time::timeout(
            Duration::from_secs(1),
            t.read_until("Loading vmlinuz", Duration::from_secs(3600), &mut seen),
        )
        .await;
        assert!(waiting.is_err());
        assert_eq!(seen, "Booting from DVD...\n");
    }

    #[tokio::test]
    async fn marker_dribbled_one_byte_at_a_time() {
        let (mut t, mut console) = pipe();
        let writer = tokio::spawn(async move {
            for b in b"noise noise login: ".iter() {
                console.write_all(&[*b]).await.unwrap();
                tokio::task::yield_now().await;
            }
            console
        });
        let mut seen = String::new();
        let got = t
            .read_until("login:", Duration::from_secs(5), &mut seen)
            .await
            .unwrap();
        assert_eq!(got, "noise noise login:");
        drop(writer.await.unwrap());

        let rest = t
            .read_until(" ", Duration::from_secs(5), &mut seen)
            .await
            .unwrap();
        assert_eq!(rest, " ");
        assert_eq!(seen, "noise noise login: ");
    }

    #[tokio::test]
    async fn split_multibyte_character_is_logged_whole() {
        let (mut t, mut console) = pipe();
        // "é" is 0xC3 0xA9
        console.write_all(b"caf\xC3").await.unwrap();
        let mut seen = String::new();
        let _ = tokio::time::timeout(
            Duration::from_millis(50),
            t.read_until("$", Duration::from_secs(5), &mut seen),
        )
        .await;
        assert_eq!(seen, "caf");

        console.write_all(b"\xA9 $").await.unwrap();
        let got = t
            .read_until("$", Duration::from_secs(5), &mut seen)
            .await
            .unwrap();
        assert_eq!(got, "café $");
        assert_eq!(seen, "café $");
    }

    #[tokio::test]
    async fn peer_hangup_is_closed_not_timeout() {
        let (mut t, console) = pipe();
        drop(console);
        let err = t
            .read_until("boot:", Duration::from_secs(3600), &mut String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed { .. }));
    }

    #[tokio::test]
    async fn write_line_appends_newline() {
        let (mut t, mut console) = pipe();
        t.write_line("sudo ip link set enp2s1 up").await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = console.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"sudo ip link set enp2s1 up\n");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_writes() {
        let (mut t, _console) = pipe();
        t.close().await.unwrap();
        t.close().await.unwrap();
        assert!(matches!(
            t.write(b"x").await,
            Err(TransportError::Closed { .. })
        ));
    }
}
