use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use orion_error::StructError;
use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lazy_config::ConnectorConfig;
use lazy_core::RawRecord;

use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::{Counter, MetricKey, MetricsRegistry};

use super::Source;

const RESCAN_INTERVAL: Duration = Duration::from_secs(60);
const RETRY_PAUSE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// FileKey — identity of a tailed file
// ---------------------------------------------------------------------------

/// Files are identified by `(inode, device)`, never by name: rotation moves
/// names between inodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub inode: u64,
    pub device: u64,
}

impl FileKey {
    fn of(meta: &std::fs::Metadata) -> Self {
        Self {
            inode: meta.ino(),
            device: meta.dev(),
        }
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.device)
    }
}

impl FromStr for FileKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (inode, device) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("bad file key {s:?}"))?;
        Ok(Self {
            inode: inode.parse()?,
            device: device.parse()?,
        })
    }
}

// ---------------------------------------------------------------------------
// FileSource — multi-file tailer with rotation detection and checkpoints
// ---------------------------------------------------------------------------

/// Follows every file matching the configured path pattern, emitting
/// newline-terminated records. One tailing task exists per `(inode, device)`
/// at any time; a 60 s rescan (plus explicit refresh signals from tailers
/// that detect rotation) picks up new files and reaps rotated-away ones.
///
/// Offsets are checkpointed to `{StatusDir}/.{Name}lazystatus` on stop and
/// consulted on start, so a restart resumes where the previous run left off.
pub struct FileSource {
    cancel: CancellationToken,
    state: Arc<Mutex<TailState>>,
    rescan_task: Mutex<Option<JoinHandle<()>>>,
    status_path: PathBuf,
    metrics: Arc<MetricsRegistry>,
    metric_keys: Vec<MetricKey>,
}

struct TailState {
    files: HashMap<FileKey, TailHandle>,
    /// Offsets loaded from the checkpoint file; consumed (and removed) the
    /// first time the matching key appears.
    saved: HashMap<FileKey, u64>,
}

struct TailHandle {
    path: PathBuf,
    offset: Arc<AtomicU64>,
    /// Set by the tailer once it observes that its path now points at a
    /// different inode (or no file at all). Reaped on the next rescan.
    rotated: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ScanConfig {
    pattern: PathBuf,
    name_regex: Option<Regex>,
    read_all: bool,
    tx: mpsc::Sender<RawRecord>,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
    lines_total: Counter,
    files_tracked: Counter,
}

impl FileSource {
    pub async fn start(
        config: &ConnectorConfig,
        task_name: &str,
        task_id: &str,
        tx: mpsc::Sender<RawRecord>,
        metrics: Arc<MetricsRegistry>,
    ) -> RuntimeResult<Self> {
        let pattern = config.string_param("Files", "");
        if pattern.is_empty() {
            return Err(StructError::from(RuntimeReason::Construction)
                .with_detail("file source requires a Files pattern"));
        }
        let pattern = PathBuf::from(pattern);
        let name_regex = pattern
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| Regex::new(n).ok());

        let checkpoint_name = config.string_param("Name", task_name);
        let status_dir = config.string_param("StatusDir", "/tmp");
        let status_path = Path::new(&status_dir).join(format!(".{checkpoint_name}lazystatus"));
        let saved = load_checkpoint(&status_path).await;
        if !saved.is_empty() {
            lz_info!(src, task = %task_id, entries = saved.len(), "loaded tail offsets");
        }

        let labels = [("task", task_id)];
        let lines_total = metrics.counter("lazy_source_file_lines_total", &labels);
        let files_tracked = metrics.gauge("lazy_source_file_tracked", &labels);
        let metric_keys = vec![
            MetricKey::new("lazy_source_file_lines_total", &labels),
            MetricKey::new("lazy_source_file_tracked", &labels),
        ];

        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(TailState {
            files: HashMap::new(),
            saved,
        }));
        let scan = ScanConfig {
            pattern,
            name_regex,
            read_all: config.bool_param("ReadAll"),
            tx,
            refresh: Arc::new(Notify::new()),
            cancel: cancel.clone(),
            lines_total,
            files_tracked,
        };

        let rescan_task = tokio::spawn(run_rescan(scan, Arc::clone(&state)));

        Ok(Self {
            cancel,
            state,
            rescan_task: Mutex::new(Some(rescan_task)),
            status_path,
            metrics,
            metric_keys,
        })
    }
}

#[async_trait]
impl Source for FileSource {
    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.rescan_task.lock().await.take() {
            let _ = task.await;
        }

        let mut state = self.state.lock().await;
        let mut offsets: Vec<(FileKey, u64)> = Vec::with_capacity(state.files.len());
        for (key, handle) in state.files.drain() {
            handle.cancel.cancel();
            let _ = handle.task.await;
            offsets.push((key, handle.offset.load(Ordering::Acquire)));
        }

        if let Err(e) = write_checkpoint(&self.status_path, &offsets).await {
            lz_warn!(src, path = %self.status_path.display(), error = %e, "checkpoint write failed");
        }
        self.metrics.unregister(&self.metric_keys);
    }
}

// ---------------------------------------------------------------------------
// Rescan loop
// ---------------------------------------------------------------------------

async fn run_rescan(scan: ScanConfig, state: Arc<Mutex<TailState>>) {
    loop {
        rescan_once(&scan, &state).await;
        tokio::select! {
            _ = scan.cancel.cancelled() => break,
            _ = scan.refresh.notified() => {}
            _ = tokio::time::sleep(RESCAN_INTERVAL) => {}
        }
    }
}

async fn rescan_once(scan: &ScanConfig, state: &Arc<Mutex<TailState>>) {
    let matches = enumerate_matches(&scan.pattern, scan.name_regex.as_ref()).await;

    let mut state = state.lock().await;
    // A rescan racing with stop must not launch tailers after the tokens
    // are cancelled; recheck under the lock.
    if scan.cancel.is_cancelled() {
        return;
    }

    let mut live_keys = Vec::with_capacity(matches.len());
    for path in matches {
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            continue;
        };
        let key = FileKey::of(&meta);
        live_keys.push(key);

        if let Some(handle) = state.files.get_mut(&key) {
            if handle.path != path {
                lz_debug!(src, key = %key, new = %path.display(), "tracked file renamed");
                handle.path = path;
            }
            continue;
        }

        let offset = Arc::new(AtomicU64::new(state.saved.remove(&key).unwrap_or(0)));
        let rotated = Arc::new(AtomicBool::new(false));
        let tail_cancel = scan.cancel.child_token();
        let tailer = Tailer {
            path: path.clone(),
            key,
            offset: Arc::clone(&offset),
            rotated: Arc::clone(&rotated),
            read_all: scan.read_all,
            tx: scan.tx.clone(),
            refresh: Arc::clone(&scan.refresh),
            cancel: tail_cancel.clone(),
            lines_total: Arc::clone(&scan.lines_total),
        };
        lz_info!(src, key = %key, path = %path.display(), "start tailing");
        let task = tokio::spawn(tailer.run());
        state.files.insert(
            key,
            TailHandle {
                path,
                offset,
                rotated,
                cancel: tail_cancel,
                task,
            },
        );
    }

    // Reap tailers whose file is gone from the listing and which already
    // reached EOF on the rotated-away inode.
    let reap: Vec<FileKey> = state
        .files
        .iter()
        .filter(|(key, handle)| {
            !live_keys.contains(key) && handle.rotated.load(Ordering::Acquire)
        })
        .map(|(key, _)| *key)
        .collect();
    for key in reap {
        if let Some(handle) = state.files.remove(&key) {
            lz_info!(src, key = %key, "reaping rotated tailer");
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
    }

    scan.files_tracked
        .store(state.files.len() as u64, Ordering::Relaxed);
}

/// List files matching the pattern: the literal path when it exists, plus
/// every entry of the parent directory whose name matches the final
/// component as a regex.
async fn enumerate_matches(pattern: &Path, name_regex: Option<&Regex>) -> Vec<PathBuf> {
    let mut matches = Vec::new();
    if tokio::fs::metadata(pattern).await.is_ok() {
        matches.push(pattern.to_path_buf());
    }

    let Some(regex) = name_regex else {
        return matches;
    };
    let parent = match pattern.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if let Ok(mut entries) = tokio::fs::read_dir(&parent).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if regex.is_match(name) {
                let path = entry.path();
                if !matches.contains(&path) {
                    matches.push(path);
                }
            }
        }
    }
    matches
}

// ---------------------------------------------------------------------------
// Per-file tail loop
// ---------------------------------------------------------------------------

struct Tailer {
    path: PathBuf,
    key: FileKey,
    offset: Arc<AtomicU64>,
    rotated: Arc<AtomicBool>,
    read_all: bool,
    tx: mpsc::Sender<RawRecord>,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
    lines_total: Counter,
}

impl Tailer {
    async fn run(self) {
        let mut pos = self.offset.load(Ordering::Acquire);
        let mut file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) => {
                lz_warn!(src, path = %self.path.display(), error = %e, "open failed");
                return;
            }
        };
        // First sight of this file with no saved offset: start at the end
        // unless ReadAll asks for history.
        if !self.read_all && pos == 0 {
            match file.seek(SeekFrom::End(0)).await {
                Ok(end) => pos = end,
                Err(e) => lz_warn!(src, path = %self.path.display(), error = %e, "seek failed"),
            }
        } else if pos > 0
            && let Err(e) = file.seek(SeekFrom::Start(pos)).await
        {
            lz_warn!(src, path = %self.path.display(), error = %e, "seek failed");
            return;
        }
        self.offset.store(pos, Ordering::Release);

        let mut reader = BufReader::new(file);
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let mut line = Vec::new();
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return,
                read = reader.read_until(b'\n', &mut line) => read,
            };

            match read {
                Ok(0) => {
                    // Clean EOF: probe the path for rotation or truncation.
                    match self.probe_eof(pos).await {
                        ProbeOutcome::Continue => {}
                        ProbeOutcome::Reset(new_reader) => {
                            reader = new_reader;
                            pos = 0;
                            self.offset.store(0, Ordering::Release);
                        }
                        ProbeOutcome::Stopped => return,
                    }
                }
                Ok(n) if line.ends_with(b"\n") => {
                    let post = pos + n as u64;
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        sent = self.tx.send(RawRecord::new(line)) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                    pos = post;
                    self.offset.store(post, Ordering::Release);
                    self.lines_total.fetch_add(1, Ordering::Relaxed);
                }
                Ok(_) => {
                    // Partial line at EOF: rewind and wait for the newline.
                    let mut file = reader.into_inner();
                    if file.seek(SeekFrom::Start(pos)).await.is_err() {
                        return;
                    }
                    reader = BufReader::new(file);
                    if !self.pause().await {
                        return;
                    }
                }
                Err(e) => {
                    lz_warn!(src, key = %self.key, error = %e, "read error");
                    if !self.pause().await {
                        return;
                    }
                }
            }
        }
    }

    async fn probe_eof(&self, pos: u64) -> ProbeOutcome {
        match tokio::fs::metadata(&self.path).await {
            Err(_) => {
                // Renamed away with no replacement yet. Keep draining the
                // open descriptor; flag for reaping.
                self.flag_rotation();
            }
            Ok(meta) => {
                let current = FileKey::of(&meta);
                if current != self.key {
                    // A new file took over the path.
                    self.flag_rotation();
                } else if meta.len() < pos {
                    // Truncated in place: rebind at the start.
                    lz_info!(src, key = %self.key, "file truncated, resetting offset");
                    match File::open(&self.path).await {
                        Ok(file) => return ProbeOutcome::Reset(BufReader::new(file)),
                        Err(e) => {
                            lz_warn!(src, key = %self.key, error = %e, "reopen after truncate failed");
                        }
                    }
                }
            }
        }
        if self.pause().await {
            ProbeOutcome::Continue
        } else {
            ProbeOutcome::Stopped
        }
    }

    fn flag_rotation(&self) {
        if !self.rotated.swap(true, Ordering::AcqRel) {
            lz_info!(src, key = %self.key, path = %self.path.display(), "rotation detected");
            self.refresh.notify_one();
        }
    }

    /// Sleep the retry window; false when cancelled.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(RETRY_PAUSE) => true,
        }
    }
}

enum ProbeOutcome {
    Continue,
    Reset(BufReader<File>),
    Stopped,
}

// ---------------------------------------------------------------------------
// Checkpoint file
// ---------------------------------------------------------------------------

async fn load_checkpoint(path: &Path) -> HashMap<FileKey, u64> {
    let mut saved = HashMap::new();
    let Ok(body) = tokio::fs::read_to_string(path).await else {
        return saved;
    };
    for line in body.lines() {
        let Some((key, offset)) = line.split_once(' ') else {
            continue;
        };
        if let (Ok(key), Ok(offset)) = (key.parse::<FileKey>(), offset.parse::<u64>()) {
            saved.insert(key, offset);
        }
    }
    saved
}

async fn write_checkpoint(path: &Path, offsets: &[(FileKey, u64)]) -> std::io::Result<()> {
    let mut body = String::new();
    for (key, offset) in offsets {
        body.push_str(&format!("{key} {offset}\n"));
    }
    tokio::fs::write(path, body).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::time::Duration;
    use tokio::time::timeout;

    fn source_config(files: &str, read_all: bool, name: &str, status_dir: &str) -> ConnectorConfig {
        serde_json::from_value(serde_json::json!({
            "Type": "file",
            "Files": files,
            "ReadAll": if read_all { "true" } else { "false" },
            "Name": name,
            "StatusDir": status_dir,
        }))
        .unwrap()
    }

    async fn recv_line(rx: &mut mpsc::Receiver<RawRecord>, within: Duration) -> Option<Vec<u8>> {
        timeout(within, rx.recv()).await.ok().flatten().map(|r| r.msg)
    }

    async fn start_source(
        dir: &tempfile::TempDir,
        file: &str,
        read_all: bool,
        name: &str,
    ) -> (FileSource, mpsc::Receiver<RawRecord>) {
        let (tx, rx) = mpsc::channel(64);
        let metrics = Arc::new(MetricsRegistry::new());
        let config = source_config(
            &dir.path().join(file).display().to_string(),
            read_all,
            name,
            &dir.path().display().to_string(),
        );
        let source = FileSource::start(&config, name, &format!("{name}#0"), tx, metrics)
            .await
            .unwrap();
        (source, rx)
    }

    #[tokio::test]
    async fn reads_existing_lines_with_read_all() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foo.log"), b"A\nB\n").unwrap();

        let (source, mut rx) = start_source(&dir, "foo.log", true, "t1").await;
        assert_eq!(recv_line(&mut rx, Duration::from_secs(5)).await.unwrap(), b"A\n");
        assert_eq!(recv_line(&mut rx, Duration::from_secs(5)).await.unwrap(), b"B\n");
        source.stop().await;
    }

    #[tokio::test]
    async fn partial_line_held_until_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.log");
        std::fs::write(&path, b"incomplete").unwrap();

        let (source, mut rx) = start_source(&dir, "part.log", true, "t2").await;
        assert!(recv_line(&mut rx, Duration::from_secs(2)).await.is_none());

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b" now\n").unwrap();
        assert_eq!(
            recv_line(&mut rx, Duration::from_secs(5)).await.unwrap(),
            b"incomplete now\n"
        );
        source.stop().await;
    }

    #[tokio::test]
    async fn rotation_is_followed_within_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rot.log");
        std::fs::write(&path, b"A\nB\n").unwrap();

        let (source, mut rx) = start_source(&dir, "rot.log", true, "t3").await;
        assert_eq!(recv_line(&mut rx, Duration::from_secs(5)).await.unwrap(), b"A\n");
        assert_eq!(recv_line(&mut rx, Duration::from_secs(5)).await.unwrap(), b"B\n");

        // Rename away and recreate: the tailer flags rotation on its next
        // EOF probe and the triggered rescan picks up the new inode.
        std::fs::rename(&path, dir.path().join("rot.log.1")).unwrap();
        std::fs::write(&path, b"C\n").unwrap();
        assert_eq!(
            recv_line(&mut rx, Duration::from_secs(10)).await.unwrap(),
            b"C\n"
        );
        source.stop().await;
    }

    #[tokio::test]
    async fn truncation_resets_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.log");
        std::fs::write(&path, b"a long first line\nanother one\n").unwrap();

        let (source, mut rx) = start_source(&dir, "trunc.log", true, "t4").await;
        assert!(recv_line(&mut rx, Duration::from_secs(5)).await.is_some());
        assert!(recv_line(&mut rx, Duration::from_secs(5)).await.is_some());

        // Truncate in place (same inode, smaller size).
        std::fs::write(&path, b"n\n").unwrap();
        assert_eq!(
            recv_line(&mut rx, Duration::from_secs(10)).await.unwrap(),
            b"n\n"
        );
        source.stop().await;
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_resumes_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ck.log");
        std::fs::write(&path, b"one\ntwo\n").unwrap();

        let (source, mut rx) = start_source(&dir, "ck.log", true, "t5").await;
        assert_eq!(recv_line(&mut rx, Duration::from_secs(5)).await.unwrap(), b"one\n");
        assert_eq!(recv_line(&mut rx, Duration::from_secs(5)).await.unwrap(), b"two\n");
        source.stop().await;

        // Checkpoint exists and records the delivered offset.
        let meta = std::fs::metadata(&path).unwrap();
        let key = FileKey::of(&meta);
        let status = std::fs::read_to_string(dir.path().join(".t5lazystatus")).unwrap();
        assert!(status.contains(&format!("{key} 8")), "status: {status:?}");

        // Restart with the same Name: only fresh data flows.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"three\n").unwrap();
        let (source, mut rx) = start_source(&dir, "ck.log", true, "t5").await;
        assert_eq!(
            recv_line(&mut rx, Duration::from_secs(5)).await.unwrap(),
            b"three\n"
        );
        source.stop().await;
    }

    #[tokio::test]
    async fn regex_pattern_matches_multiple_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app-a.log"), b"from-a\n").unwrap();
        std::fs::write(dir.path().join("app-b.log"), b"from-b\n").unwrap();
        std::fs::write(dir.path().join("other.txt"), b"nope\n").unwrap();

        let (source, mut rx) = start_source(&dir, "app-.*\\.log", true, "t6").await;
        let mut lines = Vec::new();
        for _ in 0..2 {
            lines.push(recv_line(&mut rx, Duration::from_secs(5)).await.unwrap());
        }
        lines.sort();
        assert_eq!(lines, vec![b"from-a\n".to_vec(), b"from-b\n".to_vec()]);
        assert!(recv_line(&mut rx, Duration::from_secs(1)).await.is_none());
        source.stop().await;
    }

    #[tokio::test]
    async fn read_all_false_skips_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skip.log");
        std::fs::write(&path, b"old\n").unwrap();

        let (source, mut rx) = start_source(&dir, "skip.log", false, "t7").await;
        assert!(recv_line(&mut rx, Duration::from_secs(2)).await.is_none());

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"new\n").unwrap();
        assert_eq!(
            recv_line(&mut rx, Duration::from_secs(5)).await.unwrap(),
            b"new\n"
        );
        source.stop().await;
    }
}
