//! Log tailing
//!
//! Two followers, one per log file, push complete lines into a single
//! channel. Lines from one file keep their order; lines from different
//! files arrive in whatever order they were read.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::ReceiverStream, Stream};

use crate::supervisor::ProcessState;

/// Lines buffered between the followers and the consumer
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Live stream of lines from a set of log files
///
/// Dropping the tail stops its followers as well.
pub struct LogTail {
    lines_rx: mpsc::Receiver<String>,
    shutdown_tx: watch::Sender<bool>,
    followers: Vec<JoinHandle<()>>,
}

impl LogTail {
    /// Follow `paths` from their beginning, polling every `poll`
    ///
    /// Files that do not exist yet are picked up once they appear.
    pub fn follow(paths: &[PathBuf], poll: Duration) -> Self {
        let (lines_tx, lines_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let followers = paths
            .iter()
            .map(|path| {
                tokio::spawn(follow_file(
                    path.clone(),
                    lines_tx.clone(),
                    shutdown_rx.clone(),
                    poll,
                ))
            })
            .collect();

        Self {
            lines_rx,
            shutdown_tx,
            followers,
        }
    }

    /// Follow the stdout and stderr logs of a supervised process
    pub fn for_process(state: &ProcessState, poll: Duration) -> Self {
        Self::follow(&[state.stdout_path(), state.stderr_path()], poll)
    }

    /// Next line; `None` once cancelled or every follower has stopped
    ///
    /// Lines still queued when the tail is cancelled are discarded.
    pub async fn next_line(&mut self) -> Option<String> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let line = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|cancelled| *cancelled) => None,
            line = self.lines_rx.recv() => line,
        };

        if self.is_cancelled() {
            self.lines_rx.close();
            return None;
        }
        line
    }

    /// Stop both followers and the consumer; nothing is emitted afterwards
    pub fn cancel(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Adapt into a [`Stream`] of lines; dropping it stops the followers
    pub fn into_stream(self) -> LogStream {
        let LogTail {
            lines_rx,
            shutdown_tx,
            followers: _,
        } = self;
        LogStream {
            lines: ReceiverStream::new(lines_rx),
            _shutdown_tx: shutdown_tx,
        }
    }

    /// Hand the stream to a consumer task feeding a bounded buffer
    pub fn into_display(self, limit: usize) -> LogDisplay {
        let (text_tx, text_rx) = watch::channel(String::new());
        let LogTail {
            mut lines_rx,
            shutdown_tx,
            followers,
        } = self;

        let mut shutdown_rx = shutdown_tx.subscribe();
        let consumer = tokio::spawn(async move {
            let mut buffer = LogBuffer::new(limit);
            loop {
                let line = tokio::select! {
                    biased;
                    _ = shutdown_rx.wait_for(|cancelled| *cancelled) => break,
                    line = lines_rx.recv() => match line {
                        Some(line) => line,
                        None => break,
                    },
                };
                if *shutdown_rx.borrow() {
                    break;
                }

                buffer.push_line(&line);
                if text_tx.send(buffer.text().to_string()).is_err() {
                    break;
                }
            }
        });

        LogDisplay {
            text_rx,
            shutdown_tx,
            followers,
            consumer,
        }
    }
}

/// Lines of a [`LogTail`] as a stream
pub struct LogStream {
    lines: ReceiverStream<String>,
    _shutdown_tx: watch::Sender<bool>,
}

impl Stream for LogStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        Pin::new(&mut self.lines).poll_next(cx)
    }
}

/// Text sink that drops history once it grows past a limit
///
/// Before a line is appended, a buffer longer than `limit` bytes is
/// cleared. Its length therefore never exceeds `limit` plus the longest
/// line plus one.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    text: String,
    limit: usize,
}

impl LogBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        if self.text.len() > self.limit {
            self.text.clear();
        }
        self.text.push_str(line);
        self.text.push('\n');
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Consumer side of a [`LogTail`]: the latest buffer contents
pub struct LogDisplay {
    text_rx: watch::Receiver<String>,
    shutdown_tx: watch::Sender<bool>,
    followers: Vec<JoinHandle<()>>,
    consumer: JoinHandle<()>,
}

impl LogDisplay {
    /// Current buffer contents
    pub fn text(&self) -> String {
        self.text_rx.borrow().clone()
    }

    /// Wait for the buffer to change; false once the stream has ended
    pub async fn changed(&mut self) -> bool {
        self.text_rx.changed().await.is_ok()
    }

    pub fn cancel(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Cancel and wait for every task to finish
    pub async fn close(self) {
        self.cancel();
        for follower in self.followers {
            let _ = follower.await;
        }
        let _ = self.consumer.await;
    }
}

/// Poll one file for appended data until cancelled
async fn follow_file(
    path: PathBuf,
    lines_tx: mpsc::Sender<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    poll: Duration,
) {
    let mut position: u64 = 0;
    let mut pending: Vec<u8> = Vec::new();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match read_appended(&path, &mut position, &mut pending).await {
            Ok(lines) => {
                for line in lines {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                    tokio::select! {
                        sent = lines_tx.send(line) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                        _ = shutdown_rx.changed() => return,
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::debug!("Reading {:?} failed: {}", path, e),
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = lines_tx.closed() => break,
            _ = tokio::time::sleep(poll) => {}
        }
    }

    tracing::debug!("Stopped following {:?}", path);
}

/// Read whatever was appended since `position`, returning complete lines
///
/// A file shorter than `position` was truncated or replaced and is read
/// again from the start. Carriage returns split lines too, so progress
/// output rewritten in place arrives as separate lines.
async fn read_appended(
    path: &Path,
    position: &mut u64,
    pending: &mut Vec<u8>,
) -> std::io::Result<Vec<String>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();

    if len < *position {
        tracing::debug!("{:?} shrank, rereading from start", path);
        *position = 0;
        pending.clear();
    }
    if len == *position {
        return Ok(Vec::new());
    }

    file.seek(SeekFrom::Start(*position)).await?;
    let mut chunk = Vec::with_capacity((len - *position) as usize);
    let read = file.read_to_end(&mut chunk).await?;
    *position += read as u64;
    pending.extend_from_slice(&chunk);

    let mut lines = Vec::new();
    while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
        let raw: Vec<u8> = pending.drain(..=newline).collect();
        let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
        if line.contains('\r') {
            lines.extend(
                line.split('\r')
                    .filter(|part| !part.is_empty())
                    .map(str::to_string),
            );
        } else {
            lines.push(line.into_owned());
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const POLL: Duration = Duration::from_millis(10);

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    async fn collect(tail: &mut LogTail, count: usize) -> Vec<String> {
        let mut lines = Vec::new();
        while lines.len() < count {
            let line = tokio::time::timeout(Duration::from_secs(5), tail.next_line())
                .await
                .expect("timed out waiting for log line")
                .expect("tail ended early");
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_interleaves_both_files() {
        let dir = TempDir::new().unwrap();
        let state = ProcessState::new(dir.path());
        let mut tail = LogTail::for_process(&state, POLL);

        append(&state.stdout_path(), "out 1\nout 2\n");
        append(&state.stderr_path(), "err 1\n");
        append(&state.stdout_path(), "out 3\n");
        append(&state.stderr_path(), "err 2\n");

        let lines = collect(&mut tail, 5).await;
        let outs: Vec<&String> = lines.iter().filter(|l| l.starts_with("out")).collect();
        let errs: Vec<&String> = lines.iter().filter(|l| l.starts_with("err")).collect();
        assert_eq!(outs, vec!["out 1", "out 2", "out 3"]);
        assert_eq!(errs, vec!["err 1", "err 2"]);

        // Nothing is emitted twice
        let extra = tokio::time::timeout(Duration::from_millis(100), tail.next_line()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_reads_existing_content_and_waits_for_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stdout");
        append(&path, "already there\npartial");

        let mut tail = LogTail::follow(&[path.clone()], POLL);
        assert_eq!(collect(&mut tail, 1).await, vec!["already there"]);

        let early = tokio::time::timeout(Duration::from_millis(100), tail.next_line()).await;
        assert!(early.is_err());

        append(&path, " line\r\n");
        assert_eq!(collect(&mut tail, 1).await, vec!["partial line"]);
    }

    #[tokio::test]
    async fn test_truncated_file_is_reread() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stdout");
        append(&path, "first run line\n");

        let mut tail = LogTail::follow(&[path.clone()], POLL);
        assert_eq!(collect(&mut tail, 1).await, vec!["first run line"]);

        std::fs::write(&path, "new\n").unwrap();
        assert_eq!(collect(&mut tail, 1).await, vec!["new"]);
    }

    #[tokio::test]
    async fn test_cancel_stops_emission() {
        let dir = TempDir::new().unwrap();
        let state = ProcessState::new(dir.path());
        let mut tail = LogTail::for_process(&state, POLL);

        append(&state.stdout_path(), "before\n");
        assert_eq!(collect(&mut tail, 1).await, vec!["before"]);

        tail.cancel();
        assert!(tail.is_cancelled());
        append(&state.stdout_path(), "after\n");
        append(&state.stderr_path(), "after\n");

        let end = tokio::time::timeout(Duration::from_secs(5), tail.next_line())
            .await
            .expect("followers did not stop");
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_cancel_discards_queued_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stdout");
        let text: String = (0..10).map(|i| format!("line {}\n", i)).collect();
        append(&path, &text);

        let mut tail = LogTail::follow(&[path], POLL);
        assert_eq!(collect(&mut tail, 1).await, vec!["line 0"]);

        // Give the follower time to queue the rest
        tokio::time::sleep(Duration::from_millis(100)).await;
        tail.cancel();

        assert_eq!(tail.next_line().await, None);
        assert_eq!(tail.next_line().await, None);
    }

    #[tokio::test]
    async fn test_carriage_returns_split_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stderr");
        append(&path, "progress 10%\rprogress 20%\r\ndone\n\n");

        let mut tail = LogTail::follow(&[path], POLL);
        let lines = collect(&mut tail, 4).await;
        assert_eq!(lines, vec!["progress 10%", "progress 20%", "done", ""]);
        assert!(lines.iter().all(|l| !l.contains('\r')));
    }

    #[tokio::test]
    async fn test_display_ignores_lines_after_cancel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stdout");
        let mut display = LogTail::follow(&[path.clone()], POLL).into_display(1000);

        append(&path, "before\n");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !display.text().contains("before") {
            assert!(tokio::time::Instant::now() < deadline, "display never updated");
            let _ = tokio::time::timeout(Duration::from_millis(200), display.changed()).await;
        }

        display.cancel();
        append(&path, "after\n");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(display.text(), "before\n");
        display.close().await;
    }

    #[tokio::test]
    async fn test_stream_yields_lines() {
        use tokio_stream::StreamExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stderr");
        append(&path, "one\ntwo\n");

        let mut stream = LogTail::follow(&[path], POLL).into_stream();
        let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("one"));
        assert_eq!(second.as_deref(), Some("two"));
    }

    #[test]
    fn test_buffer_clears_past_limit() {
        let mut buffer = LogBuffer::new(50);
        let mut longest = 0;
        for i in 0..200 {
            let line = format!("line number {}", i);
            longest = longest.max(line.len());
            buffer.push_line(&line);
            assert!(buffer.len() <= 50 + longest + 1, "buffer grew to {}", buffer.len());
        }
        assert!(buffer.text().ends_with("line number 199\n"));
        assert!(!buffer.text().contains("line number 0\n"));
    }

    #[test]
    fn test_buffer_keeps_history_below_limit() {
        let mut buffer = LogBuffer::new(1000);
        assert!(buffer.is_empty());
        buffer.push_line("a");
        buffer.push_line("b");
        assert_eq!(buffer.text(), "a\nb\n");
    }

    #[tokio::test]
    async fn test_display_tracks_latest_lines() {
        let dir = TempDir::new().unwrap();
        let state = ProcessState::new(dir.path());
        let mut display = LogTail::for_process(&state, POLL).into_display(1000);

        let long_line = "x".repeat(1200);
        append(&state.stdout_path(), &format!("{}\n", long_line));
        append(&state.stdout_path(), "after threshold\n");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !display.text().contains("after threshold") {
            assert!(tokio::time::Instant::now() < deadline, "display never updated");
            let _ = tokio::time::timeout(Duration::from_millis(200), display.changed()).await;
        }

        let text = display.text();
        assert_eq!(text, "after threshold\n");
        assert!(text.len() <= 1000 + 1200 + 1);
        display.close().await;
    }
}
