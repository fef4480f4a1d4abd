use bytes::Bytes;
use chrono::Utc;
use depthlink_media::Mat4;
use depthlink_protocol::StreamKind;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use super::encoder::{ChunkEncoder, ChunkTracker, EncoderBackend};
use super::ledger::Ledger;
use super::naming::{self, ChunkName, DeviceLayout};
use super::processor::ChunkProcessor;
use super::{EncoderStatus, RecordingConfig};

/// Commands handled by the recorder task
#[derive(Debug)]
pub enum RecorderCommand {
    Frame {
        device_id: String,
        color: Option<Bytes>,
        depth: Option<Bytes>,
        pose: Option<Mat4>,
    },
    Rollover {
        device_id: String,
    },
    Respawn {
        device_id: String,
    },
    EncoderExited {
        device_id: String,
        kind: StreamKind,
        path: PathBuf,
        code: Option<i32>,
    },
}

/// Cheap handle on the recorder task
#[derive(Clone)]
pub struct RecorderHandle {
    commands: mpsc::UnboundedSender<RecorderCommand>,
    session_id: Arc<str>,
    tracker: ChunkTracker,
    processor: Arc<ChunkProcessor>,
}

impl RecorderHandle {
    /// Start the recorder task and the periodic chunk processor
    pub fn spawn(
        config: RecordingConfig,
        ledger: Arc<Ledger>,
        backend: Arc<dyn EncoderBackend>,
    ) -> Self {
        let session_id = naming::generate_session_id();
        let tracker = ChunkTracker::new();
        let processor = Arc::new(ChunkProcessor::new(
            config.output_path.clone(),
            config.segment_length,
            session_id.clone(),
            backend.clone(),
            ledger.clone(),
            tracker.clone(),
        ));
        processor.clone().spawn_periodic(config.normalize_interval);

        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Recorder {
            config,
            session_id: session_id.clone(),
            ledger,
            backend,
            tracker: tracker.clone(),
            processor: processor.clone(),
            commands: tx.clone(),
            devices: HashMap::new(),
            last_timestamp: 0,
        };
        tokio::spawn(recorder.run(rx));

        tracing::info!("Recording session {} started", session_id);

        Self {
            commands: tx,
            session_id: session_id.into(),
            tracker,
            processor,
        }
    }

    /// Feed one frame of a device. Any part may be absent.
    pub fn on_frame(
        &self,
        device_id: &str,
        color: Option<Bytes>,
        depth: Option<Bytes>,
        pose: Option<Mat4>,
    ) {
        let command = RecorderCommand::Frame {
            device_id: device_id.to_string(),
            color,
            depth,
            pose,
        };
        if self.commands.send(command).is_err() {
            tracing::warn!("Recorder task is gone, dropping frame");
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn tracker(&self) -> &ChunkTracker {
        &self.tracker
    }

    pub fn processor(&self) -> &Arc<ChunkProcessor> {
        &self.processor
    }
}

#[derive(Serialize)]
struct PoseRecord<'a> {
    timestamp: i64,
    pose: &'a [f32],
}

struct DeviceState {
    layout: DeviceLayout,
    encoders: HashMap<StreamKind, ChunkEncoder>,
    pose_log: Option<tokio::fs::File>,
    rollover: JoinHandle<()>,
    last_frame: Instant,
}

impl Drop for DeviceState {
    fn drop(&mut self) {
        self.rollover.abort();
    }
}

struct Recorder {
    config: RecordingConfig,
    session_id: String,
    ledger: Arc<Ledger>,
    backend: Arc<dyn EncoderBackend>,
    tracker: ChunkTracker,
    processor: Arc<ChunkProcessor>,
    commands: mpsc::UnboundedSender<RecorderCommand>,
    devices: HashMap<String, DeviceState>,
    /// Chunk timestamps are strictly increasing so names never collide
    last_timestamp: u64,
}

impl Recorder {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RecorderCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                RecorderCommand::Frame {
                    device_id,
                    color,
                    depth,
                    pose,
                } => self.on_frame(device_id, color, depth, pose).await,
                RecorderCommand::Rollover { device_id } => self.rollover(&device_id),
                RecorderCommand::Respawn { device_id } => self.respawn(&device_id).await,
                RecorderCommand::EncoderExited {
                    device_id,
                    kind,
                    path,
                    code,
                } => self.encoder_exited(&device_id, kind, path, code).await,
            }
        }
    }

    async fn on_frame(
        &mut self,
        device_id: String,
        color: Option<Bytes>,
        depth: Option<Bytes>,
        pose: Option<Mat4>,
    ) {
        if !naming::is_safe_component(&device_id) {
            tracing::warn!("Refusing to record device with id {:?}", device_id);
            return;
        }

        if !self.devices.contains_key(&device_id) {
            match self.register_device(&device_id).await {
                Ok(state) => {
                    self.devices.insert(device_id.clone(), state);
                }
                Err(e) => {
                    tracing::error!("Failed to start recording device {}: {}", device_id, e);
                    return;
                }
            }
        }
        let Some(state) = self.devices.get_mut(&device_id) else {
            return;
        };
        state.last_frame = Instant::now();

        for (kind, frame) in [(StreamKind::Color, color), (StreamKind::Depth, depth)] {
            if let (Some(frame), Some(encoder)) = (frame, state.encoders.get(&kind)) {
                encoder.push(frame);
            }
        }

        if let (Some(pose), Some(log)) = (pose, state.pose_log.as_mut()) {
            let record = PoseRecord {
                timestamp: Utc::now().timestamp_millis(),
                pose: &pose,
            };
            let mut line = match serde_json::to_vec(&record) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("Failed to serialize pose: {}", e);
                    return;
                }
            };
            line.push(b'\n');
            let written = match log.write_all(&line).await {
                Ok(()) => log.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                tracing::warn!("Failed to append pose for device {}: {}", device_id, e);
            }
        }
    }

    /// Directories first, then ledger entry, encoders and rollover timer
    async fn register_device(&mut self, device_id: &str) -> super::Result<DeviceState> {
        let layout = DeviceLayout::new(&self.config.output_path, device_id);
        layout.create_all().await?;

        let session_id = self.session_id.clone();
        self.ledger
            .update(|info| {
                info.session_mut(device_id, &session_id);
            })
            .await?;

        let pose_log = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(layout.pose_log(&self.session_id))
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!("Pose log unavailable for device {}: {}", device_id, e);
                None
            }
        };

        let encoders = self.start_encoders(device_id, &layout).await;

        let segment = self.config.segment_length;
        let commands = self.commands.clone();
        let id = device_id.to_string();
        let rollover = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + segment, segment);
            loop {
                ticker.tick().await;
                let command = RecorderCommand::Rollover {
                    device_id: id.clone(),
                };
                if commands.send(command).is_err() {
                    break;
                }
            }
        });

        tracing::info!("Recording device {} into {}", device_id, layout.root().display());

        Ok(DeviceState {
            layout,
            encoders,
            pose_log,
            rollover,
            last_frame: Instant::now(),
        })
    }

    async fn start_encoders(
        &mut self,
        device_id: &str,
        layout: &DeviceLayout,
    ) -> HashMap<StreamKind, ChunkEncoder> {
        let mut encoders = HashMap::new();
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp = timestamp;
        let name = ChunkName::new(self.session_id.clone(), timestamp);

        for kind in StreamKind::ALL {
            let path = layout.unprocessed(kind).join(name.file_name());
            self.tracker.set(&path, kind, EncoderStatus::NotStarted);

            let process = match self.backend.spawn(kind, &path).await {
                Ok(process) => process,
                Err(e) => {
                    tracing::error!("Failed to start {} encoder for {}: {}", kind, device_id, e);
                    self.tracker.set(&path, kind, EncoderStatus::Ended);
                    continue;
                }
            };

            let commands = self.commands.clone();
            let exit_device = device_id.to_string();
            let exit_path = path.clone();
            let encoder = ChunkEncoder::start(
                process,
                kind,
                path,
                self.config.encoder_queue,
                self.config.stop_timeout,
                self.tracker.clone(),
                move |code| {
                    let _ = commands.send(RecorderCommand::EncoderExited {
                        device_id: exit_device,
                        kind,
                        path: exit_path,
                        code,
                    });
                },
            );
            encoders.insert(kind, encoder);
        }

        encoders
    }

    fn rollover(&mut self, device_id: &str) {
        let Some(state) = self.devices.get_mut(device_id) else {
            return;
        };
        for encoder in state.encoders.values_mut() {
            encoder.stop();
        }

        if state.last_frame.elapsed() >= self.config.idle_timeout {
            // Dropping the state aborts its rollover ticker
            tracing::info!("Device {} went idle, stopping its recording", device_id);
            self.devices.remove(device_id);
            return;
        }
        tracing::debug!("Rolling over chunks of device {}", device_id);

        let commands = self.commands.clone();
        let grace = self.config.rollover_grace;
        let id = device_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = commands.send(RecorderCommand::Respawn { device_id: id });
        });
    }

    async fn respawn(&mut self, device_id: &str) {
        let Some(layout) = self.devices.get(device_id).map(|s| s.layout.clone()) else {
            return;
        };
        let encoders = self.start_encoders(device_id, &layout).await;
        if let Some(state) = self.devices.get_mut(device_id) {
            state.encoders = encoders;
        }
    }

    async fn encoder_exited(
        &mut self,
        device_id: &str,
        kind: StreamKind,
        path: PathBuf,
        code: Option<i32>,
    ) {
        tracing::info!(
            "{} chunk {} of device {} finished (exit {:?})",
            kind,
            path.display(),
            device_id,
            code
        );

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let session_id = self.session_id.clone();
            let chunk = path.to_string_lossy().into_owned();
            let result = self
                .ledger
                .update(|info| {
                    info.session_mut(device_id, &session_id)
                        .chunks_mut(kind)
                        .push(chunk);
                })
                .await;
            if let Err(e) = result {
                tracing::warn!("Failed to record chunk in ledger: {}", e);
            }
        } else {
            tracing::warn!("Encoder exited without writing {}", path.display());
        }

        let processor = self.processor.clone();
        tokio::spawn(async move {
            processor.run_pass().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::encoder::testing::FakeBackend;
    use crate::recording::encoder::EncoderProcess;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(output: &Path) -> RecordingConfig {
        RecordingConfig {
            output_path: output.to_path_buf(),
            ..Default::default()
        }
    }

    /// Checks the device layout exists whenever an encoder is spawned
    struct LayoutCheckingBackend {
        inner: FakeBackend,
        output: PathBuf,
        layout_missing: AtomicBool,
    }

    #[async_trait]
    impl EncoderBackend for LayoutCheckingBackend {
        async fn spawn(&self, kind: StreamKind, output: &Path) -> crate::recording::Result<EncoderProcess> {
            let layout = DeviceLayout::new(&self.output, "42");
            if !layout.directories().iter().all(|d| d.is_dir()) {
                self.layout_missing.store(true, Ordering::SeqCst);
            }
            self.inner.spawn(kind, output).await
        }

        async fn probe_duration(&self, path: &Path) -> crate::recording::Result<Duration> {
            self.inner.probe_duration(path).await
        }

        async fn rescale(&self, input: &Path, output: &Path, factor: f64) -> crate::recording::Result<()> {
            self.inner.rescale(input, output, factor).await
        }

        async fn concat(&self, file_list: &Path, output: &Path) -> crate::recording::Result<()> {
            self.inner.concat(file_list, output).await
        }
    }

    /// Counts encoder processes
    struct CountingBackend {
        inner: FakeBackend,
        spawned: AtomicUsize,
    }

    #[async_trait]
    impl EncoderBackend for CountingBackend {
        async fn spawn(&self, kind: StreamKind, output: &Path) -> crate::recording::Result<EncoderProcess> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            self.inner.spawn(kind, output).await
        }

        async fn probe_duration(&self, path: &Path) -> crate::recording::Result<Duration> {
            self.inner.probe_duration(path).await
        }

        async fn rescale(&self, input: &Path, output: &Path, factor: f64) -> crate::recording::Result<()> {
            self.inner.rescale(input, output, factor).await
        }

        async fn concat(&self, file_list: &Path, output: &Path) -> crate::recording::Result<()> {
            self.inner.concat(file_list, output).await
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_first_frame_creates_layout_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::load(dir.path().join("videoInfo.json")).await);
        let backend = Arc::new(LayoutCheckingBackend {
            inner: FakeBackend::new(Duration::from_secs(15)),
            output: dir.path().to_path_buf(),
            layout_missing: AtomicBool::new(false),
        });
        let recorder = RecorderHandle::spawn(config(dir.path()), ledger.clone(), backend.clone());

        let pose = depthlink_media::IDENTITY;
        recorder.on_frame(
            "42",
            Some(Bytes::from_static(b"\xff\xd8jpeg")),
            Some(Bytes::from_static(b"\x89PNGpng")),
            Some(pose),
        );

        let tracker = recorder.tracker().clone();
        wait_until(|| {
            tracker.count(StreamKind::Color, EncoderStatus::Started) == 1
                && tracker.count(StreamKind::Depth, EncoderStatus::Started) == 1
        })
        .await;
        assert!(!backend.layout_missing.load(Ordering::SeqCst));

        let layout = DeviceLayout::new(dir.path(), "42");
        let pose_log = layout.pose_log(recorder.session_id());
        let mut contents = String::new();
        for _ in 0..200 {
            contents = tokio::fs::read_to_string(&pose_log).await.unwrap_or_default();
            if !contents.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(record["pose"].as_array().unwrap().len(), 16);

        let info = ledger.snapshot().await;
        assert!(info.session("42", recorder.session_id()).is_some());
    }

    #[tokio::test]
    async fn test_unsafe_device_id_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::load(dir.path().join("videoInfo.json")).await);
        let backend = Arc::new(FakeBackend::new(Duration::from_secs(15)));
        let recorder = RecorderHandle::spawn(config(dir.path()), ledger.clone(), backend);

        recorder.on_frame("../escape", Some(Bytes::from_static(b"\xff\xd8")), None, None);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!dir.path().parent().unwrap().join("escape").exists());
        assert!(ledger.snapshot().await.devices.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollover_yields_ended_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::load(dir.path().join("videoInfo.json")).await);
        let backend = Arc::new(FakeBackend::new(Duration::from_secs(15)));
        let recorder = RecorderHandle::spawn(config(dir.path()), ledger.clone(), backend);
        let tracker = recorder.tracker().clone();

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(40_000) {
            recorder.on_frame(
                "7",
                Some(Bytes::from_static(b"\xff\xd8color")),
                Some(Bytes::from_static(b"\x89PNGdepth")),
                None,
            );
            tokio::time::sleep(Duration::from_millis(125)).await;
        }

        let recorded = |info: &depthlink_protocol::VideoInfo, kind| {
            info.session("7", recorder.session_id())
                .map_or(0, |s| s.chunks(kind).len())
        };
        for _ in 0..100 {
            let info = ledger.snapshot().await;
            if recorded(&info, StreamKind::Color) >= 2 && recorded(&info, StreamKind::Depth) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let info = ledger.snapshot().await;
        assert!(recorded(&info, StreamKind::Color) >= 2);
        assert!(recorded(&info, StreamKind::Depth) >= 2);
        // A live pair is still recording
        assert_eq!(tracker.count(StreamKind::Color, EncoderStatus::Started), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_device_stops_spawning_encoders() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::load(dir.path().join("videoInfo.json")).await);
        let backend = Arc::new(CountingBackend {
            inner: FakeBackend::new(Duration::from_secs(15)),
            spawned: AtomicUsize::new(0),
        });
        let config = RecordingConfig {
            idle_timeout: Duration::from_secs(20),
            ..config(dir.path())
        };
        let recorder = RecorderHandle::spawn(config, ledger, backend.clone());
        let tracker = recorder.tracker().clone();

        recorder.on_frame("9", Some(Bytes::from_static(b"\xff\xd8color")), None, None);

        // One rollover at 15s, retired at 30s
        tokio::time::sleep(Duration::from_secs(35)).await;
        let spawned = backend.spawned.load(Ordering::SeqCst);
        assert_eq!(spawned, 4);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.spawned.load(Ordering::SeqCst), spawned);
        assert_eq!(tracker.count(StreamKind::Color, EncoderStatus::Started), 0);
        assert_eq!(tracker.count(StreamKind::Depth, EncoderStatus::Started), 0);

        // A returning device is recorded again
        recorder.on_frame("9", Some(Bytes::from_static(b"\xff\xd8color")), None, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.spawned.load(Ordering::SeqCst), spawned + 2);
    }
}
