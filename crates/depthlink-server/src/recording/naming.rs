//! On-disk naming of chunks, session videos and device directories

use depthlink_protocol::StreamKind;
use rand::Rng;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const SESSION_ID_LEN: usize = 8;

pub const UNPROCESSED_CHUNKS: &str = "unprocessed_chunks";
pub const PROCESSED_CHUNKS: &str = "processed_chunks";
pub const SESSION_VIDEOS: &str = "session_videos";
pub const POSES: &str = "poses";

pub const LEDGER_FILE: &str = "videoInfo.json";

static RE_CHUNK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^chunk_([A-Za-z0-9]{8})_(\d+)\.mp4$").unwrap());

/// Random 8-character alphanumeric id, generated once per process run
pub fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

/// Parsed `chunk_<sessionId>_<unixMillis>.mp4`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkName {
    pub session_id: String,
    pub timestamp: u64,
}

impl ChunkName {
    pub fn new(session_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp,
        }
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = RE_CHUNK.captures(file_name)?;
        Some(Self {
            session_id: caps[1].to_string(),
            timestamp: caps[2].parse().ok()?,
        })
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        Self::parse(path.file_name()?.to_str()?)
    }

    pub fn file_name(&self) -> String {
        format!("chunk_{}_{}.mp4", self.session_id, self.timestamp)
    }
}

pub fn session_video_name(device_id: &str, session_id: &str) -> String {
    format!("device_{}_session_{}.mp4", device_id, session_id)
}

/// Directory layout of one recorded device under the output path
#[derive(Debug, Clone)]
pub struct DeviceLayout {
    root: PathBuf,
}

impl DeviceLayout {
    pub fn new(output_path: &Path, device_id: &str) -> Self {
        Self {
            root: output_path.join(device_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn unprocessed(&self, kind: StreamKind) -> PathBuf {
        self.root.join(UNPROCESSED_CHUNKS).join(kind.as_str())
    }

    pub fn processed(&self, kind: StreamKind) -> PathBuf {
        self.root.join(PROCESSED_CHUNKS).join(kind.as_str())
    }

    pub fn session_videos(&self, kind: StreamKind) -> PathBuf {
        self.root.join(SESSION_VIDEOS).join(kind.as_str())
    }

    pub fn poses(&self) -> PathBuf {
        self.root.join(POSES)
    }

    pub fn pose_log(&self, session_id: &str) -> PathBuf {
        self.poses().join(format!("poses_{}.jsonl", session_id))
    }

    /// Every directory a device needs, stage directories first
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::with_capacity(7);
        for kind in StreamKind::ALL {
            dirs.push(self.unprocessed(kind));
            dirs.push(self.processed(kind));
            dirs.push(self.session_videos(kind));
        }
        dirs.push(self.poses());
        dirs
    }

    pub async fn create_all(&self) -> std::io::Result<()> {
        for dir in self.directories() {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }
}

/// Device ids become directory names; anything that could escape is refused
pub fn is_safe_component(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !id.contains("..")
        && !id.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_shape() {
        let id = generate_session_id();
        assert_eq!(id.len(), SESSION_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_session_id());
    }

    #[test]
    fn test_chunk_name() {
        let name = ChunkName::new("aB3dE6gH", 1_700_000_000_123);
        assert_eq!(name.file_name(), "chunk_aB3dE6gH_1700000000123.mp4");
        assert_eq!(ChunkName::parse(&name.file_name()), Some(name));

        assert!(ChunkName::parse("chunk_short_1.mp4").is_none());
        assert!(ChunkName::parse("chunk_aB3dE6gH_.mp4").is_none());
        assert!(ChunkName::parse("chunk_aB3dE6gH_12.mp4.part").is_none());
        assert!(ChunkName::parse("device_x_session_aB3dE6gH.mp4").is_none());
    }

    #[test]
    fn test_chunks_order_by_timestamp_within_session() {
        let mut names = vec![
            ChunkName::new("aaaaaaaa", 30),
            ChunkName::new("aaaaaaaa", 5),
            ChunkName::new("aaaaaaaa", 200),
        ];
        names.sort();
        let ts: Vec<u64> = names.iter().map(|n| n.timestamp).collect();
        assert_eq!(ts, vec![5, 30, 200]);
    }

    #[test]
    fn test_device_layout() {
        let layout = DeviceLayout::new(Path::new("/out"), "12");
        assert_eq!(
            layout.unprocessed(StreamKind::Depth),
            PathBuf::from("/out/12/unprocessed_chunks/depth")
        );
        assert_eq!(
            layout.pose_log("abcd1234"),
            PathBuf::from("/out/12/poses/poses_abcd1234.jsonl")
        );
        assert_eq!(layout.directories().len(), 7);
        assert_eq!(
            session_video_name("12", "abcd1234"),
            "device_12_session_abcd1234.mp4"
        );
    }

    #[test]
    fn test_safe_component() {
        assert!(is_safe_component("device-7"));
        assert!(is_safe_component("x.mp4"));
        assert!(!is_safe_component(""));
        assert!(!is_safe_component(".."));
        assert!(!is_safe_component("a/b"));
        assert!(!is_safe_component("..\\secret"));
    }
}
