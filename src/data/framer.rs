// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reassembly of separator-delimited messages from chunks.

use tracing::{debug, warn};

/// Upper bound for a buffered partial message.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Splits a byte stream into messages on a separator sequence.
pub struct FrameSplitter {
    buffer: Vec<u8>,
    separator: Vec<u8>,
    max_frame: usize,
}

impl FrameSplitter {
    /// Create a splitter. An empty separator falls back to `\n`.
    pub fn new(separator: &str) -> Self {
        let separator = if separator.is_empty() {
            b"\n".to_vec()
        } else {
            separator.as_bytes().to_vec()
        };

        Self {
            buffer: Vec::with_capacity(4096),
            separator,
            max_frame: MAX_FRAME_SIZE,
        }
    }

    #[cfg(test)]
    fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame.max(1);
        self
    }

    /// Feed a chunk and return every message it completes.
    ///
    /// Separators are stripped and empty messages are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = find(&self.buffer, &self.separator) {
            let frame: Vec<u8> = self.buffer.drain(..pos).collect();
            self.buffer.drain(..self.separator.len());
            if !frame.is_empty() {
                frames.push(frame);
            }
        }

        if self.buffer.len() > self.max_frame {
            warn!(
                "No separator within {} bytes, emitting partial message",
                self.max_frame
            );
            frames.push(std::mem::take(&mut self.buffer));
        }

        if !frames.is_empty() {
            debug!("Framed {} message(s), {} bytes pending", frames.len(), self.buffer.len());
        }
        frames
    }

    /// Take whatever is buffered as a final message.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Bytes waiting for a separator.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
