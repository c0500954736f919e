use std::fs;
use std::io;
use std::path::Path;

use common::JobKey;
use tracing::trace;

/// Minimum segments available to consider a stream active.
pub const HLS_MINIMUM_SEGMENTS: usize = 2;
const SEGMENT_EXTENSION: &str = "ts";

/// Reports whether a job's output is ready to be consumed.
pub trait ActivityProbe: Send + Sync {
    fn is_active(&self, key: &JobKey, work_dir: &Path) -> bool;
}

/// Counts finished media segments in the job's work directory.
#[derive(Debug, Clone)]
pub struct SegmentProbe {
    min_segments: usize,
    extension: String,
}

impl Default for SegmentProbe {
    fn default() -> Self {
        SegmentProbe::new(HLS_MINIMUM_SEGMENTS)
    }
}

impl SegmentProbe {
    pub fn new(min_segments: usize) -> Self {
        SegmentProbe {
            min_segments,
            extension: SEGMENT_EXTENSION.to_string(),
        }
    }

    pub fn with_extension<S: Into<String>>(mut self, extension: S) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn min_segments(&self) -> usize {
        self.min_segments
    }

    pub fn count_segments(&self, dir: &Path) -> io::Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(self.extension.as_str()) {
                count += 1;
            }
        }
        Ok(count)
    }
}

impl ActivityProbe for SegmentProbe {
    fn is_active(&self, key: &JobKey, work_dir: &Path) -> bool {
        match self.count_segments(work_dir) {
            Ok(n) => {
                trace!(job = %key, segments = n, "counted segments");
                n >= self.min_segments
            }
            Err(e) => {
                trace!(job = %key, error = %e, "could not read work directory");
                false
            }
        }
    }
}
