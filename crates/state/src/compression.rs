//! Compression of key-group snapshot streams.

use std::io::{Read, Write};

use crate::config::ExecutionConfig;

/// Wraps key-group output and input streams. Selected once per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCompressionDecorator {
    Uncompressed,
    /// Snappy framing format.
    Snappy,
}

impl StreamCompressionDecorator {
    pub fn for_config(config: &ExecutionConfig) -> Self {
        if config.use_snapshot_compression {
            StreamCompressionDecorator::Snappy
        } else {
            StreamCompressionDecorator::Uncompressed
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, StreamCompressionDecorator::Snappy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamCompressionDecorator::Uncompressed => "none",
            StreamCompressionDecorator::Snappy => "snappy",
        }
    }

    /// Wrap `out`. The returned writer must be flushed before it is dropped.
    pub fn decorate_output<'a>(&self, out: &'a mut dyn Write) -> Box<dyn Write + 'a> {
        match self {
            StreamCompressionDecorator::Uncompressed => Box::new(out),
            StreamCompressionDecorator::Snappy => Box::new(snap::write::FrameEncoder::new(out)),
        }
    }

    pub fn decorate_input<'a>(&self, input: &'a mut dyn Read) -> Box<dyn Read + 'a> {
        match self {
            StreamCompressionDecorator::Uncompressed => Box::new(input),
            StreamCompressionDecorator::Snappy => Box::new(snap::read::FrameDecoder::new(input)),
        }
    }
}

impl std::fmt::Display for StreamCompressionDecorator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
