//! Output sinks for converted frames.
//!
//! A sink accepts one full BGRA payload per frame. The framebuffer-style
//! sink rewinds to the start of the device before every write so each frame
//! overwrites the previous one; the file sink does the same through
//! truncation, keeping only the latest frame on disk.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use fbcast_core::Frame;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open sink {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("sink write failed: {0}")]
    Io(#[from] io::Error),

    /// The sink accepted fewer bytes than one full frame. Writing a partial
    /// frame leaves the display in an undefined state, so this is fatal.
    #[error("sink wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

pub trait FrameSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), SinkError>;
}

/// Raw byte-oriented device sink, e.g. `/dev/fb0`. Every frame is written
/// from offset zero.
#[derive(Debug)]
pub struct FramebufferSink {
    file: File,
}

impl FramebufferSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .write(true)
            .open(path.as_ref())
            .map_err(|source| SinkError::Open {
                path: path.as_ref().display().to_string(),
                source,
            })?;
        Ok(Self { file })
    }
}

impl FrameSink for FramebufferSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.file.seek(SeekFrom::Start(0))?;
        let written = self.file.write(&frame.data)?;
        if written != frame.data.len() {
            return Err(SinkError::ShortWrite {
                written,
                expected: frame.data.len(),
            });
        }
        self.file.flush()?;
        Ok(())
    }
}

/// Regular-file sink holding the most recent frame only.
pub struct FileSink {
    file: File,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let file = File::create(path.as_ref()).map_err(|source| SinkError::Open {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Ok(Self { file })
    }
}

impl FrameSink for FileSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        let written = self.file.write(&frame.data)?;
        if written != frame.data.len() {
            return Err(SinkError::ShortWrite {
                written,
                expected: frame.data.len(),
            });
        }
        self.file.flush()?;
        Ok(())
    }
}

/// Buffering sink for tests: records every payload it receives.
#[derive(Debug, Default)]
pub struct VecSink {
    pub frames: Vec<Vec<u8>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameSink for VecSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.frames.push(frame.data.to_vec());
        Ok(())
    }
}
