//! Recorded clips stored as a directory of numbered still images.

use blinkgate_core::{Frame, FrameSource, FrameSourceError};
use std::path::{Path, PathBuf};
use std::time::Duration;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Replays the images in a directory in file-name order.
///
/// Frame `i` is stamped `i / fps` seconds. Recorded, so the consumer paces it
/// and no frame is ever dropped.
pub struct ImageSequenceSource {
    dir: PathBuf,
    fps: f64,
    files: Vec<PathBuf>,
    next: usize,
    started: bool,
}

impl ImageSequenceSource {
    pub fn new(dir: impl Into<PathBuf>, fps: f64) -> Self {
        Self {
            dir: dir.into(),
            fps,
            files: Vec::new(),
            next: 0,
            started: false,
        }
    }

    fn timestamp(&self, index: usize) -> Duration {
        Duration::from_secs_f64(index as f64 / self.fps)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ImageSequenceSource {
    fn start(&mut self) -> Result<(), FrameSourceError> {
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(FrameSourceError::Start(format!("invalid frame rate {}", self.fps)));
        }

        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| FrameSourceError::Start(format!("{}: {e}", self.dir.display())))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(FrameSourceError::Start(format!(
                "no images in {}",
                self.dir.display()
            )));
        }

        tracing::debug!(dir = %self.dir.display(), frames = files.len(), fps = self.fps, "image sequence opened");
        self.files = files;
        self.next = 0;
        self.started = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
        if !self.started {
            return Ok(None);
        }
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        let image = image::open(path)
            .map_err(|e| FrameSourceError::Read(format!("{}: {e}", path.display())))?
            .to_rgb8();

        let index = self.next;
        self.next += 1;
        Ok(Some(Frame::new(self.timestamp(index), index as u32, image)))
    }

    fn stop(&mut self) {
        if self.started {
            tracing::debug!(dir = %self.dir.display(), read = self.next, "image sequence closed");
        }
        self.started = false;
        self.files.clear();
    }

    fn is_live(&self) -> bool {
        false
    }
}
