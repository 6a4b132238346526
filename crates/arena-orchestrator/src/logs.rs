//! Child output forwarding
//!
//! Each child's stdout and stderr are read line by line by forwarder tasks and
//! pushed through a bounded channel to a collector that re-emits them through
//! `tracing` and keeps the last lines per child.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Lines retained per child
pub const LOG_CAPACITY: usize = 500;

/// Channel depth between forwarders and the collector
pub const LOG_CHANNEL_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub child: String,
    pub stream: LogStream,
    pub line: String,
}

/// Forwarding stopped early. The child is unaffected.
#[derive(Debug, Error)]
pub enum LogForwardError {
    #[error("Reading {stream} of {child} failed: {source}")]
    Read {
        child: String,
        stream: &'static str,
        source: std::io::Error,
    },

    #[error("Log collector for {child} is gone")]
    Closed { child: String },
}

/// Per-child ring buffers shared between the collector and readers
#[derive(Debug, Clone)]
pub struct LogSink {
    inner: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    capacity: usize,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(LOG_CAPACITY)
    }
}

impl LogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: &LogLine) {
        info!(
            target: "arena::child",
            child = %line.child,
            stream = line.stream.as_str(),
            "{}",
            line.line
        );
        let mut logs = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let buf = logs.entry(line.child.clone()).or_default();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(line.line.clone());
    }

    /// Retained lines for `child`, oldest first
    pub fn recent(&self, child: &str) -> Vec<String> {
        let logs = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        logs.get(child)
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Last `n` retained lines for `child`
    pub fn tail(&self, child: &str, n: usize) -> Vec<String> {
        let mut lines = self.recent(child);
        let skip = lines.len().saturating_sub(n);
        lines.drain(..skip);
        lines
    }

    /// Drain `rx` into the sink until every sender is dropped
    pub fn spawn_collector(&self, mut rx: mpsc::Receiver<LogLine>) -> JoinHandle<()> {
        let sink = self.clone();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                sink.push(&line);
            }
        })
    }
}

/// Forward every line of `reader` to the collector. Returns the number of lines forwarded.
pub async fn forward<R>(
    child: String,
    stream: LogStream,
    reader: R,
    tx: mpsc::Sender<LogLine>,
) -> Result<u64, LogForwardError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut count = 0;

    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| LogForwardError::Read {
                child: child.clone(),
                stream: stream.as_str(),
                source: e,
            })?;
        if n == 0 {
            return Ok(count);
        }
        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
        tx.send(LogLine {
            child: child.clone(),
            stream,
            line,
        })
        .await
        .map_err(|_| LogForwardError::Closed {
            child: child.clone(),
        })?;
        count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(child: &str, text: &str) -> LogLine {
        LogLine {
            child: child.into(),
            stream: LogStream::Stdout,
            line: text.into(),
        }
    }

    #[test]
    fn test_ring_buffer_keeps_newest() {
        let sink = LogSink::new(3);
        for i in 0..5 {
            sink.push(&line("sim", &format!("line {i}")));
        }
        sink.push(&line("trainer", "ready"));

        assert_eq!(sink.recent("sim"), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(sink.tail("sim", 1), vec!["line 4"]);
        assert_eq!(sink.recent("trainer"), vec!["ready"]);
        assert!(sink.recent("missing").is_empty());
    }

    #[tokio::test]
    async fn test_forward_into_collector() {
        let sink = LogSink::default();
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_DEPTH);
        let collector = sink.spawn_collector(rx);

        let input: &[u8] = b"first\r\nsecond\n\nlast without newline";
        let count = forward("sim".into(), LogStream::Stdout, input, tx)
            .await
            .unwrap();
        collector.await.unwrap();

        assert_eq!(count, 4);
        assert_eq!(
            sink.recent("sim"),
            vec!["first", "second", "", "last without newline"]
        );
    }

    #[tokio::test]
    async fn test_forward_reports_closed_collector() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let input: &[u8] = b"orphan\n";
        let err = forward("sim".into(), LogStream::Stderr, input, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, LogForwardError::Closed { .. }));
    }
}
