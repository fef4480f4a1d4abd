use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One of the two recorded video streams of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Color,
    Depth,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Color, StreamKind::Depth];

    /// Directory name used under every chunk stage
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Color => "color",
            StreamKind::Depth => "depth",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All chunks recorded for one device under one session id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecordingSession {
    pub device_id: String,
    pub session_id: String,
    #[serde(default)]
    pub color_chunks: Vec<String>,
    #[serde(default)]
    pub depth_chunks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_color_video_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_depth_video_path: Option<String>,
}

impl DeviceRecordingSession {
    pub fn new(device_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// A session is immutable once both concatenated videos exist
    pub fn is_resolved(&self) -> bool {
        self.final_color_video_path.is_some() && self.final_depth_video_path.is_some()
    }

    pub fn chunks(&self, kind: StreamKind) -> &[String] {
        match kind {
            StreamKind::Color => &self.color_chunks,
            StreamKind::Depth => &self.depth_chunks,
        }
    }

    pub fn chunks_mut(&mut self, kind: StreamKind) -> &mut Vec<String> {
        match kind {
            StreamKind::Color => &mut self.color_chunks,
            StreamKind::Depth => &mut self.depth_chunks,
        }
    }

    pub fn final_video(&self, kind: StreamKind) -> Option<&str> {
        match kind {
            StreamKind::Color => self.final_color_video_path.as_deref(),
            StreamKind::Depth => self.final_depth_video_path.as_deref(),
        }
    }

    pub fn set_final_video(&mut self, kind: StreamKind, path: Option<String>) {
        match kind {
            StreamKind::Color => self.final_color_video_path = path,
            StreamKind::Depth => self.final_depth_video_path = path,
        }
    }
}

/// Recording metadata of a single device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecordings {
    #[serde(default)]
    pub sessions: BTreeMap<String, DeviceRecordingSession>,
}

/// Persistent ledger, keyed by device id.
///
/// Serialized as `videoInfo.json` and served verbatim by `GET /videoInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoInfo {
    pub devices: BTreeMap<String, DeviceRecordings>,
}

impl VideoInfo {
    pub fn contains_device(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn session(&self, device_id: &str, session_id: &str) -> Option<&DeviceRecordingSession> {
        self.devices.get(device_id)?.sessions.get(session_id)
    }

    pub fn session_mut(&mut self, device_id: &str, session_id: &str) -> &mut DeviceRecordingSession {
        self.devices
            .entry(device_id.to_string())
            .or_default()
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| DeviceRecordingSession::new(device_id, session_id))
    }

    /// Every concatenated video path recorded in the ledger
    pub fn final_videos(&self) -> impl Iterator<Item = &str> {
        self.devices
            .values()
            .flat_map(|d| d.sessions.values())
            .flat_map(|s| StreamKind::ALL.into_iter().filter_map(move |k| s.final_video(k)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_resolution() {
        let mut session = DeviceRecordingSession::new("dev", "abcd1234");
        assert!(!session.is_resolved());

        session.set_final_video(StreamKind::Color, Some("/tmp/c.mp4".into()));
        assert!(!session.is_resolved());

        session.set_final_video(StreamKind::Depth, Some("/tmp/d.mp4".into()));
        assert!(session.is_resolved());
        assert_eq!(session.final_video(StreamKind::Depth), Some("/tmp/d.mp4"));
    }

    #[test]
    fn test_ledger_json_shape() {
        let mut info = VideoInfo::default();
        info.session_mut("dev", "abcd1234")
            .chunks_mut(StreamKind::Color)
            .push("chunk_abcd1234_1.mp4".into());

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(
            value["dev"]["sessions"]["abcd1234"]["colorChunks"][0],
            "chunk_abcd1234_1.mp4"
        );
        assert!(value["dev"]["sessions"]["abcd1234"]
            .get("finalColorVideoPath")
            .is_none());

        let parsed: VideoInfo = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, info);
        assert!(parsed.contains_device("dev"));
    }

    #[test]
    fn test_final_videos_iterates_all_devices() {
        let mut info = VideoInfo::default();
        info.session_mut("a", "s1")
            .set_final_video(StreamKind::Color, Some("a.mp4".into()));
        info.session_mut("b", "s2")
            .set_final_video(StreamKind::Depth, Some("b.mp4".into()));

        let mut videos: Vec<&str> = info.final_videos().collect();
        videos.sort();
        assert_eq!(videos, vec!["a.mp4", "b.mp4"]);
    }
}
