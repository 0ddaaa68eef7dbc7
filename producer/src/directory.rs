use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use stream_gate_common::frame::Frame;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::pacing::Pacer;
use crate::{decode_image, FrameSource, SourceError};

/// Reads every image whose file name matches a wildcard pattern such as
/// `captures/*.jpg`, in name order, then ends.
///
/// `*` matches any run of characters and `?` a single character. Only the
/// file name may contain wildcards; the directory part is taken literally.
pub struct DirectorySource {
    pattern: String,
    files: VecDeque<PathBuf>,
    pacer: Pacer,
    seq: u64,
}

impl DirectorySource {
    pub fn open(pattern: &str, fps: f64) -> Result<Self, SourceError> {
        let path = Path::new(pattern);
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_pattern = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SourceError::Open(format!("{pattern:?} has no file name pattern")))?;

        let entries = std::fs::read_dir(&dir)
            .map_err(|e| SourceError::Open(format!("cannot list {}: {e}", dir.display())))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|name| wildcard_match(file_pattern, name))
            })
            .collect();
        files.sort();

        if files.is_empty() {
            warn!(pattern, "no files found matching pattern");
        } else {
            debug!(pattern, count = files.len(), "found files matching pattern");
        }

        Ok(Self {
            pattern: pattern.to_string(),
            files: files.into(),
            pacer: Pacer::new(fps),
            seq: 0,
        })
    }

    /// Files not yet read.
    pub fn remaining(&self) -> usize {
        self.files.len()
    }
}

#[async_trait]
impl FrameSource for DirectorySource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.files.is_empty() {
            return Ok(None);
        }
        let captured_at = self.pacer.wait().await;

        // The file leaves the queue only once read, so a dropped call
        // resumes with the same file.
        let Some(path) = self.files.front().cloned() else {
            return Ok(None);
        };
        let started = Instant::now();
        let read = tokio::fs::read(&path).await;
        self.files.pop_front();
        let bytes = read.map_err(|e| SourceError::Decode(format!("{}: {e}", path.display())))?;
        let image = decode_image(&bytes)?;

        let seq = self.seq;
        self.seq += 1;
        debug!(
            path = path.display().to_string(),
            seq,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "read image file"
        );
        Ok(Some(Frame::new(image, captured_at, Some(seq))))
    }

    fn name(&self) -> &str {
        &self.pattern
    }
}

/// Shell-style wildcard match supporting `*` and `?`.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0usize, 0usize);
    // Position of the last `*` seen, and the name index it was tried against.
    let mut backtrack: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ni));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ni = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::encoded_image;
    use image::ImageFormat;
    use std::time::Duration;

    #[test]
    fn wildcard_patterns() {
        assert!(wildcard_match("*.jpg", "a.jpg"));
        assert!(wildcard_match("*.jpg", ".jpg"));
        assert!(!wildcard_match("*.jpg", "a.png"));
        assert!(wildcard_match("frame_??.png", "frame_01.png"));
        assert!(!wildcard_match("frame_??.png", "frame_1.png"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("a*b*c", "aXXbYYc"));
        assert!(!wildcard_match("a*b*c", "aXXbYY"));
        assert!(wildcard_match("exact.png", "exact.png"));
    }

    #[tokio::test]
    async fn reads_matching_files_in_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.png"), encoded_image(8, 6, 20, ImageFormat::Png))
            .unwrap();
        std::fs::write(dir.path().join("a.png"), encoded_image(4, 3, 10, ImageFormat::Png))
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignore me").unwrap();

        let pattern = dir.path().join("*.png");
        let mut source = DirectorySource::open(pattern.to_str().unwrap(), 0.0).unwrap();
        assert_eq!(source.remaining(), 2);

        let first = source.next_frame().await.unwrap().unwrap();
        assert_eq!((first.width(), first.height()), (4, 3));
        assert_eq!(first.seq, Some(0));

        let second = source.next_frame().await.unwrap().unwrap();
        assert_eq!((second.width(), second.height()), (8, 6));
        assert_eq!(second.seq, Some(1));
        assert!(second.captured_at >= first.captured_at);

        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_image_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        std::fs::write(dir.path().join("good.jpg"), encoded_image(4, 4, 0, ImageFormat::Jpeg))
            .unwrap();

        let pattern = dir.path().join("*.jpg");
        let mut source = DirectorySource::open(pattern.to_str().unwrap(), 0.0).unwrap();

        let err = source.next_frame().await.unwrap_err();
        assert!(err.is_transient());
        assert!(source.next_frame().await.unwrap().is_some());
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[test]
    fn missing_directory_fails_to_open() {
        let result = DirectorySource::open("/definitely/not/here/*.jpg", 0.0);
        assert!(matches!(result, Err(SourceError::Open(_))));
    }

    #[tokio::test]
    async fn paced_frames_are_a_full_period_apart() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..8 {
            // Alternate large and tiny files so reads take uneven time
            let side = if i % 2 == 0 { 400 } else { 4 };
            std::fs::write(
                dir.path().join(format!("f{i}.png")),
                encoded_image(side, side, 0, ImageFormat::Png),
            )
            .unwrap();
        }

        let pattern = dir.path().join("*.png");
        let mut source = DirectorySource::open(pattern.to_str().unwrap(), 25.0).unwrap();
        let period = Duration::try_from_secs_f64(1.0 / 25.0).unwrap();

        let mut last: Option<Duration> = None;
        while let Some(frame) = source.next_frame().await.unwrap() {
            if let Some(prev) = last {
                assert!(frame.captured_at - prev >= period);
            }
            last = Some(frame.captured_at);
        }
        assert_eq!(source.remaining(), 0);
    }
}
