use crate::error::{AppError, Result};
use crate::recording::naming::is_safe_component;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use depthlink_protocol::VideoInfo;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Largest slice served per range request
pub const CHUNK_SIZE: u64 = 1_000_000;

/// A single `bytes=<start>-[<end>]` range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn parse(value: &str) -> Option<Self> {
        let ranges = value.trim().strip_prefix("bytes=")?;
        if ranges.contains(',') {
            return None;
        }
        let (start, end) = ranges.split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end = match end.trim() {
            "" => None,
            end => Some(end.parse::<u64>().ok()?),
        };
        if end.is_some_and(|end| end < start) {
            return None;
        }
        Some(Self { start, end })
    }

    /// Inclusive byte span to serve from a file of `size` bytes
    pub fn resolve(&self, size: u64) -> Result<(u64, u64)> {
        if self.start >= size {
            return Err(AppError::RangeNotSatisfiable { size });
        }
        let end = (self.start + CHUNK_SIZE - 1)
            .min(self.end.unwrap_or(u64::MAX))
            .min(size - 1);
        Ok((self.start, end))
    }
}

pub async fn video_info(State(state): State<AppState>) -> Json<VideoInfo> {
    if let Err(e) = state.ledger.prune().await {
        tracing::warn!("Failed to prune ledger: {}", e);
    }
    Json(state.ledger.snapshot().await)
}

pub async fn get_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let range = headers
        .get(header::RANGE)
        .ok_or_else(|| AppError::BadRequest("Range header required".to_string()))?
        .to_str()
        .map_err(|_| AppError::BadRequest("Malformed Range header".to_string()))?;
    let range = ByteRange::parse(range)
        .ok_or_else(|| AppError::BadRequest(format!("Malformed Range header: {}", range)))?;

    if !is_safe_component(&id) {
        return Err(AppError::NotFound(format!("Video {} not found", id)));
    }
    let path = resolve_video(&state, &id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Video {} not found", id)))?;

    let mut file = tokio::fs::File::open(&path).await?;
    let size = file.metadata().await?.len();
    let (start, end) = range.resolve(size)?;

    let mut body = vec![0u8; (end - start + 1) as usize];
    file.seek(SeekFrom::Start(start)).await?;
    file.read_exact(&mut body).await?;

    tracing::debug!("Serving {} bytes {}-{}/{}", id, start, end, size);

    Ok((
        StatusCode::PARTIAL_CONTENT,
        [
            (header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, size)),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (header::CONTENT_LENGTH, body.len().to_string()),
            (header::CONTENT_TYPE, "video/mp4".to_string()),
        ],
        body,
    )
        .into_response())
}

/// Look under the output path first, then among the ledger's session videos
async fn resolve_video(state: &AppState, id: &str) -> Option<PathBuf> {
    let direct = state.config.output_path.join(id);
    if tokio::fs::metadata(&direct)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
    {
        return Some(direct);
    }

    let ledger = state.ledger.snapshot().await;
    ledger
        .final_videos()
        .map(PathBuf::from)
        .find(|p| p.file_name().and_then(|n| n.to_str()) == Some(id) && p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(
            ByteRange::parse("bytes=0-"),
            Some(ByteRange { start: 0, end: None })
        );
        assert_eq!(
            ByteRange::parse("bytes=32324-40000"),
            Some(ByteRange {
                start: 32324,
                end: Some(40000)
            })
        );
        assert_eq!(ByteRange::parse("bytes=-500"), None);
        assert_eq!(ByteRange::parse("bytes=10-5"), None);
        assert_eq!(ByteRange::parse("bytes=0-1,5-9"), None);
        assert_eq!(ByteRange::parse("items=0-"), None);
        assert_eq!(ByteRange::parse("bytes=abc-"), None);
    }

    #[test]
    fn test_resolve_caps_at_chunk_size() {
        let range = ByteRange { start: 0, end: None };
        assert_eq!(range.resolve(2_000_000).unwrap(), (0, 999_999));
        assert_eq!(range.resolve(10).unwrap(), (0, 9));

        let range = ByteRange {
            start: 1_500_000,
            end: None,
        };
        assert_eq!(range.resolve(2_000_000).unwrap(), (1_500_000, 1_999_999));

        let range = ByteRange {
            start: 100,
            end: Some(199),
        };
        assert_eq!(range.resolve(2_000_000).unwrap(), (100, 199));
    }

    #[test]
    fn test_resolve_past_end() {
        let range = ByteRange {
            start: 10,
            end: None,
        };
        assert!(matches!(
            range.resolve(10),
            Err(AppError::RangeNotSatisfiable { size: 10 })
        ));
    }
}
