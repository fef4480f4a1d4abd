use depthlink_protocol::StreamKind;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::encoder::{ChunkTracker, EncoderBackend};
use super::ledger::Ledger;
use super::naming::{self, ChunkName, DeviceLayout};
use super::Result;

/// What one processing pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub normalized: usize,
    pub concatenated: usize,
}

/// Background normalization and session concatenation of finished chunks.
///
/// Both steps are idempotent and derive their work from the filesystem, so a
/// pass can run at any time. Passes are serialized.
pub struct ChunkProcessor {
    output_path: PathBuf,
    segment_length: Duration,
    session_id: String,
    backend: Arc<dyn EncoderBackend>,
    ledger: Arc<Ledger>,
    tracker: ChunkTracker,
    pass_lock: Mutex<()>,
}

impl ChunkProcessor {
    pub fn new(
        output_path: PathBuf,
        segment_length: Duration,
        session_id: String,
        backend: Arc<dyn EncoderBackend>,
        ledger: Arc<Ledger>,
        tracker: ChunkTracker,
    ) -> Self {
        Self {
            output_path,
            segment_length,
            session_id,
            backend,
            ledger,
            tracker,
            pass_lock: Mutex::new(()),
        }
    }

    /// Run a pass immediately and then every `every`
    pub fn spawn_periodic(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                self.run_pass().await;
            }
        })
    }

    pub async fn run_pass(&self) -> PassReport {
        let _guard = self.pass_lock.lock().await;
        let mut report = PassReport::default();

        let devices = match self.device_ids().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!(
                    "Cannot list recordings in {}: {}",
                    self.output_path.display(),
                    e
                );
                return report;
            }
        };

        for device_id in devices {
            let layout = DeviceLayout::new(&self.output_path, &device_id);
            report.normalized += self.normalize_device(&layout).await;
            report.concatenated += self.concatenate_device(&device_id, &layout).await;
        }

        if report != PassReport::default() {
            tracing::info!(
                "Processing pass normalized {} and concatenated {} videos",
                report.normalized,
                report.concatenated
            );
        }
        report
    }

    async fn device_ids(&self) -> Result<Vec<String>> {
        let mut devices = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.output_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(devices),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if naming::is_safe_component(name) {
                    devices.push(name.to_string());
                }
            }
        }
        devices.sort();
        Ok(devices)
    }

    /// Rescale finished chunks of one device to the nominal segment length
    async fn normalize_device(&self, layout: &DeviceLayout) -> usize {
        let mut normalized = 0;

        for kind in StreamKind::ALL {
            let processed_dir = layout.processed(kind);
            let processed: HashSet<u64> = list_chunks(&processed_dir)
                .await
                .into_iter()
                .map(|(name, _)| name.timestamp)
                .collect();

            for (name, path) in list_chunks(&layout.unprocessed(kind)).await {
                if self.tracker.is_active(&path) {
                    continue;
                }
                if !processed.contains(&name.timestamp) {
                    match self.normalize_chunk(&path, &processed_dir, &name).await {
                        Ok(()) => normalized += 1,
                        Err(e) => {
                            tracing::warn!("Failed to normalize {}: {}", path.display(), e);
                            continue;
                        }
                    }
                }
                self.tracker.forget_ended(&path);
            }
        }

        normalized
    }

    async fn normalize_chunk(&self, path: &Path, processed_dir: &Path, name: &ChunkName) -> Result<()> {
        let probed = self.backend.probe_duration(path).await?;
        let factor = self.segment_length.as_secs_f64() / probed.as_secs_f64();

        // Written under a name the chunk pattern rejects, then moved into place
        let target = processed_dir.join(name.file_name());
        let partial = processed_dir.join(format!("partial_{}", name.file_name()));
        tracing::debug!(
            "Rescaling {} ({:?}) by {:.3}",
            path.display(),
            probed,
            factor
        );
        self.backend.rescale(path, &partial, factor).await?;
        tokio::fs::rename(&partial, &target).await?;
        Ok(())
    }

    /// Join the processed chunks of every finished, unresolved session
    async fn concatenate_device(&self, device_id: &str, layout: &DeviceLayout) -> usize {
        if let Err(e) = self.ledger.prune().await {
            tracing::warn!("Failed to prune ledger: {}", e);
        }
        let ledger = self.ledger.snapshot().await;
        let mut concatenated = 0;

        for kind in StreamKind::ALL {
            for (session_id, chunks) in group_by_session(list_chunks(&layout.processed(kind)).await) {
                if session_id == self.session_id {
                    continue;
                }
                if let Some(session) = ledger.session(device_id, &session_id) {
                    if session.is_resolved() || session.final_video(kind).is_some() {
                        continue;
                    }
                }

                match self
                    .concatenate_session(device_id, &session_id, kind, layout, &chunks)
                    .await
                {
                    Ok(true) => concatenated += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(
                        "Failed to concatenate {} session {} of device {}: {}",
                        kind,
                        session_id,
                        device_id,
                        e
                    ),
                }
            }
        }

        concatenated
    }

    async fn concatenate_session(
        &self,
        device_id: &str,
        session_id: &str,
        kind: StreamKind,
        layout: &DeviceLayout,
        chunks: &[PathBuf],
    ) -> Result<bool> {
        let videos_dir = layout.session_videos(kind);
        tokio::fs::create_dir_all(&videos_dir).await?;

        let list_path = videos_dir.join(format!("filelist_{}.txt", session_id));
        tokio::fs::write(&list_path, file_list(chunks)).await?;

        let output = videos_dir.join(naming::session_video_name(device_id, session_id));
        self.backend.concat(&list_path, &output).await?;

        // The encoder's exit status is not trusted, only the file
        if !tokio::fs::try_exists(&output).await? {
            return Ok(false);
        }

        let output = output.to_string_lossy().into_owned();
        let chunk_paths: Vec<String> = chunks
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        self.ledger
            .update(|info| {
                let session = info.session_mut(device_id, session_id);
                *session.chunks_mut(kind) = chunk_paths;
                session.set_final_video(kind, Some(output.clone()));
            })
            .await?;

        tracing::info!(
            "Concatenated {} {} chunks of session {} into {}",
            chunks.len(),
            kind,
            session_id,
            output
        );
        Ok(true)
    }
}

/// Chunk files in `dir`, sorted by session and timestamp
pub async fn list_chunks(dir: &Path) -> Vec<(ChunkName, PathBuf)> {
    let mut chunks = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return chunks;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if let Some(name) = ChunkName::from_path(&path) {
            chunks.push((name, path));
        }
    }
    chunks.sort();
    chunks
}

/// Group chunk paths by session id, each group ordered by timestamp
pub fn group_by_session(chunks: Vec<(ChunkName, PathBuf)>) -> BTreeMap<String, Vec<PathBuf>> {
    let mut sessions: BTreeMap<String, Vec<(u64, PathBuf)>> = BTreeMap::new();
    for (name, path) in chunks {
        sessions
            .entry(name.session_id)
            .or_default()
            .push((name.timestamp, path));
    }
    sessions
        .into_iter()
        .map(|(session, mut chunks)| {
            chunks.sort_by_key(|(ts, _)| *ts);
            (session, chunks.into_iter().map(|(_, p)| p).collect())
        })
        .collect()
}

/// ffmpeg concat demuxer input listing `chunks` in order
pub fn file_list(chunks: &[PathBuf]) -> String {
    chunks
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}
