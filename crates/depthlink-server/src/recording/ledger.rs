use depthlink_protocol::{StreamKind, VideoInfo};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::Result;

/// Persistent `videoInfo.json` ledger.
///
/// The whole file is rewritten after every change. Paths that no longer exist
/// on disk are pruned before the ledger is used for merge decisions.
pub struct Ledger {
    path: PathBuf,
    info: Mutex<VideoInfo>,
}

impl Ledger {
    /// Load the ledger, starting empty if the file is missing or unreadable
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let info = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!("Ignoring corrupt ledger {}: {}", path.display(), e);
                    VideoInfo::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VideoInfo::default(),
            Err(e) => {
                tracing::warn!("Failed to read ledger {}: {}", path.display(), e);
                VideoInfo::default()
            }
        };

        Self {
            path,
            info: Mutex::new(info),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> VideoInfo {
        self.info.lock().await.clone()
    }

    /// Apply a change and persist the result
    pub async fn update<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut VideoInfo) -> R,
    {
        let mut info = self.info.lock().await;
        let result = f(&mut info);
        self.write(&info).await?;
        Ok(result)
    }

    /// Drop every chunk and final video path that is missing on disk.
    /// Returns the number of removed references.
    pub async fn prune(&self) -> Result<usize> {
        let mut info = self.info.lock().await;
        let mut removed = 0;

        for device in info.devices.values_mut() {
            for session in device.sessions.values_mut() {
                for kind in StreamKind::ALL {
                    let chunks = session.chunks_mut(kind);
                    let before = chunks.len();
                    chunks.retain(|p| Path::new(p).exists());
                    removed += before - chunks.len();

                    if let Some(path) = session.final_video(kind) {
                        if !Path::new(path).exists() {
                            tracing::info!("Pruning missing session video {}", path);
                            session.set_final_video(kind, None);
                            removed += 1;
                        }
                    }
                }
            }
        }

        if removed > 0 {
            self.write(&info).await?;
        }
        Ok(removed)
    }

    async fn write(&self, info: &VideoInfo) -> Result<()> {
        let json = serde_json::to_vec_pretty(info)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::load(dir.path().join("videoInfo.json")).await;
        assert!(ledger.snapshot().await.devices.is_empty());
    }

    #[tokio::test]
    async fn test_update_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("videoInfo.json");

        let ledger = Ledger::load(&path).await;
        ledger
            .update(|info| {
                info.session_mut("7", "abcd1234");
            })
            .await
            .unwrap();
        assert!(!dir.path().join("videoInfo.json.tmp").exists());

        let reloaded = Ledger::load(&path).await;
        assert!(reloaded.snapshot().await.session("7", "abcd1234").is_some());
    }

    #[tokio::test]
    async fn test_prune_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept.mp4");
        std::fs::write(&kept, b"x").unwrap();
        let kept = kept.to_string_lossy().into_owned();
        let gone = dir.path().join("gone.mp4").to_string_lossy().into_owned();

        let ledger = Ledger::load(dir.path().join("videoInfo.json")).await;
        ledger
            .update(|info| {
                let session = info.session_mut("7", "abcd1234");
                session.color_chunks = vec![kept.clone(), gone.clone()];
                session.set_final_video(StreamKind::Color, Some(kept.clone()));
                session.set_final_video(StreamKind::Depth, Some(gone.clone()));
            })
            .await
            .unwrap();

        assert_eq!(ledger.prune().await.unwrap(), 2);

        let info = ledger.snapshot().await;
        let session = info.session("7", "abcd1234").unwrap();
        assert_eq!(session.color_chunks, vec![kept.clone()]);
        assert_eq!(session.final_video(StreamKind::Color), Some(kept.as_str()));
        assert_eq!(session.final_video(StreamKind::Depth), None);
        assert!(!session.is_resolved());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("videoInfo.json");
        std::fs::write(&path, b"{not json").unwrap();
        let ledger = Ledger::load(&path).await;
        assert!(ledger.snapshot().await.devices.is_empty());
    }
}
