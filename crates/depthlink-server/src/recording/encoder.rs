//! Encoder processes
//!
//! The recorder talks to `ffmpeg` through [`EncoderBackend`]. One chunk is one
//! process: images are piped to its stdin and a graceful stop writes `q` and
//! closes the pipe. A process that does not exit within the stop timeout is
//! killed.

use async_trait::async_trait;
use bytes::Bytes;
use depthlink_protocol::StreamKind;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{EncoderStatus, RecordingError, Result};

/// A running encoder: its input pipe and a handle on the process
pub struct EncoderProcess {
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    pub child: Box<dyn ChildProcess>,
}

#[async_trait]
pub trait ChildProcess: Send {
    /// Wait for exit, returning the exit code if there is one
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    async fn kill(&mut self) -> std::io::Result<()>;
}

#[async_trait]
impl ChildProcess for tokio::process::Child {
    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(tokio::process::Child::wait(self).await?.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        tokio::process::Child::kill(self).await
    }
}

#[async_trait]
pub trait EncoderBackend: Send + Sync + 'static {
    /// Start an encoder that turns piped images into the video at `output`
    async fn spawn(&self, kind: StreamKind, output: &Path) -> Result<EncoderProcess>;

    async fn probe_duration(&self, path: &Path) -> Result<Duration>;

    /// Retime `input` by multiplying every presentation timestamp by `factor`
    async fn rescale(&self, input: &Path, output: &Path, factor: f64) -> Result<()>;

    /// Losslessly join the videos named in an ffmpeg concat list
    async fn concat(&self, file_list: &Path, output: &Path) -> Result<()>;
}

/// `ffmpeg` / `ffprobe` invoked as child processes
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg: String,
    ffprobe: String,
    framerate: u32,
    crf: u32,
}

impl FfmpegBackend {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            framerate: 8,
            crf: 25,
        }
    }

    fn input_codec(kind: StreamKind) -> &'static str {
        match kind {
            StreamKind::Color => "mjpeg",
            StreamKind::Depth => "png",
        }
    }

    fn encode_args(&self, kind: StreamKind, output: &Path) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-y".into(),
            "-r".into(),
            self.framerate.to_string(),
            "-f".into(),
            "image2pipe".into(),
            "-vcodec".into(),
            Self::input_codec(kind).into(),
            "-i".into(),
            "-".into(),
            "-vcodec".into(),
            "libx264".into(),
            "-crf".into(),
            self.crf.to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            // Quarter size, rounded to even dimensions for yuv420p
            "-vf".into(),
            "scale=trunc(iw/8)*2:trunc(ih/8)*2,setsar=1:1".into(),
            output.to_string_lossy().into_owned(),
        ]
    }

    /// Run a one-shot command to completion, logging stderr on failure
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        tracing::debug!("Running {} {:?}", program, args);
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            for line in stderr.lines() {
                tracing::debug!("{}: {}", program, line);
            }
            return Err(RecordingError::Encoder(format!(
                "{} exited with {}",
                program, output.status
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl EncoderBackend for FfmpegBackend {
    async fn spawn(&self, kind: StreamKind, output: &Path) -> Result<EncoderProcess> {
        let args = self.encode_args(kind, output);
        tracing::info!("Starting {} encoder: {}", kind, output.display());

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecordingError::Encoder("encoder stdin unavailable".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("ffmpeg[{}]: {}", name, line);
                }
            });
        }

        Ok(EncoderProcess {
            input: Box::new(stdin),
            child: Box::new(child),
        })
    }

    async fn probe_duration(&self, path: &Path) -> Result<Duration> {
        let args = vec![
            "-v".to_string(),
            "error".into(),
            "-show_entries".into(),
            "format=duration".into(),
            "-of".into(),
            "default=noprint_wrappers=1:nokey=1".into(),
            path.to_string_lossy().into_owned(),
        ];
        let stdout = self.run(&self.ffprobe, &args).await?;
        let seconds: f64 = stdout
            .trim()
            .parse()
            .map_err(|_| RecordingError::Probe(format!("duration '{}'", stdout.trim())))?;

        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(RecordingError::Probe(format!("duration {}", seconds)));
        }
        Ok(Duration::from_secs_f64(seconds))
    }

    async fn rescale(&self, input: &Path, output: &Path, factor: f64) -> Result<()> {
        let args = vec![
            "-hide_banner".to_string(),
            "-y".into(),
            "-i".into(),
            input.to_string_lossy().into_owned(),
            "-filter:v".into(),
            format!("setpts={:.6}*PTS", factor),
            "-an".into(),
            output.to_string_lossy().into_owned(),
        ];
        self.run(&self.ffmpeg, &args).await?;
        Ok(())
    }

    async fn concat(&self, file_list: &Path, output: &Path) -> Result<()> {
        let args = vec![
            "-hide_banner".to_string(),
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            file_list.to_string_lossy().into_owned(),
            "-c".into(),
            "copy".into(),
            output.to_string_lossy().into_owned(),
        ];
        self.run(&self.ffmpeg, &args).await?;
        Ok(())
    }
}

/// Status of every chunk encoded by this process, shared with the chunk
/// processor so it can skip chunks that are still being written
#[derive(Clone, Default)]
pub struct ChunkTracker {
    inner: Arc<Mutex<HashMap<PathBuf, (StreamKind, EncoderStatus)>>>,
}

impl ChunkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<PathBuf, (StreamKind, EncoderStatus)>) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn set(&self, path: &Path, kind: StreamKind, status: EncoderStatus) {
        self.with(|map| {
            map.insert(path.to_path_buf(), (kind, status));
        });
    }

    pub fn status(&self, path: &Path) -> Option<EncoderStatus> {
        self.with(|map| map.get(path).map(|(_, status)| *status))
    }

    /// A chunk is active until its encoder has exited
    pub fn is_active(&self, path: &Path) -> bool {
        matches!(self.status(path), Some(s) if s != EncoderStatus::Ended)
    }

    pub fn count(&self, kind: StreamKind, status: EncoderStatus) -> usize {
        self.with(|map| map.values().filter(|entry| **entry == (kind, status)).count())
    }

    /// Drop the entry of a chunk whose encoder has ended. Live chunks stay.
    pub fn forget_ended(&self, path: &Path) -> bool {
        self.with(|map| match map.get(path) {
            Some((_, EncoderStatus::Ended)) => map.remove(path).is_some(),
            _ => false,
        })
    }

    pub fn len(&self) -> usize {
        self.with(|map| map.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live encoder for one chunk of one stream
pub struct ChunkEncoder {
    kind: StreamKind,
    path: PathBuf,
    status: EncoderStatus,
    input: Option<mpsc::Sender<Bytes>>,
    tracker: ChunkTracker,
}

impl ChunkEncoder {
    /// Drive `process` from a writer task. `on_exit` runs once the process
    /// has exited or been killed.
    pub fn start<F>(
        process: EncoderProcess,
        kind: StreamKind,
        path: PathBuf,
        queue: usize,
        stop_timeout: Duration,
        tracker: ChunkTracker,
        on_exit: F,
    ) -> Self
    where
        F: FnOnce(Option<i32>) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue.max(1));
        tracker.set(&path, kind, EncoderStatus::Started);

        let task_tracker = tracker.clone();
        let task_path = path.clone();
        tokio::spawn(async move {
            let code = drive(process, rx, stop_timeout, &task_path).await;
            task_tracker.set(&task_path, kind, EncoderStatus::Ended);
            tracing::debug!("Encoder for {} ended with {:?}", task_path.display(), code);
            on_exit(code);
        });

        Self {
            kind,
            path,
            status: EncoderStatus::Started,
            input: Some(tx),
            tracker,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> EncoderStatus {
        self.status
    }

    /// Queue a frame. Frames are dropped unless the encoder is started and
    /// its queue has room.
    pub fn push(&self, frame: Bytes) -> bool {
        if self.status != EncoderStatus::Started {
            return false;
        }
        let Some(input) = &self.input else {
            return false;
        };
        match input.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Encoder queue full, dropping {} frame", self.kind);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Request a graceful stop behind any queued frames
    pub fn stop(&mut self) {
        if self.status == EncoderStatus::Started {
            self.input = None;
            self.status = EncoderStatus::Ending;
            self.tracker.set(&self.path, self.kind, EncoderStatus::Ending);
        }
    }
}

async fn drive(
    process: EncoderProcess,
    mut frames: mpsc::Receiver<Bytes>,
    stop_timeout: Duration,
    path: &Path,
) -> Option<i32> {
    let EncoderProcess {
        mut input,
        mut child,
    } = process;

    let mut input_open = true;
    while let Some(frame) = frames.recv().await {
        if let Err(e) = input.write_all(&frame).await {
            tracing::warn!("Encoder for {} stopped reading: {}", path.display(), e);
            input_open = false;
            break;
        }
    }

    if input_open {
        if let Err(e) = input.write_all(b"q").await {
            tracing::debug!("Failed to send quit to {}: {}", path.display(), e);
        }
        let _ = input.shutdown().await;
    }
    drop(input);

    match tokio::time::timeout(stop_timeout, child.wait()).await {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            tracing::warn!("Failed to wait for encoder {}: {}", path.display(), e);
            None
        }
        Err(_) => {
            tracing::warn!(
                "Encoder for {} did not exit within {:?}, killing",
                path.display(),
                stop_timeout
            );
            if let Err(e) = child.kill().await {
                tracing::error!("Failed to kill encoder {}: {}", path.display(), e);
            }
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::task::JoinHandle;

    /// Encoder that writes everything it receives straight to the output file
    pub struct FakeBackend {
        pub probed: Duration,
        pub concat_lists: Mutex<Vec<String>>,
        pub rescales: Mutex<Vec<(PathBuf, f64)>>,
    }

    impl FakeBackend {
        pub fn new(probed: Duration) -> Self {
            Self {
                probed,
                concat_lists: Mutex::new(Vec::new()),
                rescales: Mutex::new(Vec::new()),
            }
        }
    }

    pub struct FakeChild {
        pub(crate) task: Option<JoinHandle<()>>,
    }

    #[async_trait]
    impl ChildProcess for FakeChild {
        async fn wait(&mut self) -> std::io::Result<Option<i32>> {
            if let Some(task) = self.task.take() {
                let _ = task.await;
            }
            Ok(Some(0))
        }

        async fn kill(&mut self) -> std::io::Result<()> {
            if let Some(task) = self.task.take() {
                task.abort();
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EncoderBackend for FakeBackend {
        async fn spawn(&self, _kind: StreamKind, output: &Path) -> Result<EncoderProcess> {
            let (writer, mut reader) = tokio::io::duplex(64 * 1024);
            let output = output.to_path_buf();
            let task = tokio::spawn(async move {
                let mut data = Vec::new();
                let _ = reader.read_to_end(&mut data).await;
                let _ = tokio::fs::write(&output, data).await;
            });
            Ok(EncoderProcess {
                input: Box::new(writer),
                child: Box::new(FakeChild { task: Some(task) }),
            })
        }

        async fn probe_duration(&self, _path: &Path) -> Result<Duration> {
            Ok(self.probed)
        }

        async fn rescale(&self, input: &Path, output: &Path, factor: f64) -> Result<()> {
            tokio::fs::copy(input, output).await?;
            self.rescales
                .lock()
                .unwrap()
                .push((output.to_path_buf(), factor));
            Ok(())
        }

        async fn concat(&self, file_list: &Path, output: &Path) -> Result<()> {
            let list = tokio::fs::read_to_string(file_list).await?;
            let mut joined = Vec::new();
            for line in list.lines() {
                let path = line
                    .trim()
                    .strip_prefix("file '")
                    .and_then(|l| l.strip_suffix('\''))
                    .ok_or_else(|| RecordingError::Encoder(format!("bad list line {}", line)))?;
                joined.extend(tokio::fs::read(path).await?);
            }
            tokio::fs::write(output, joined).await?;
            self.concat_lists.lock().unwrap().push(list);
            Ok(())
        }
    }
}
