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

//! In-memory history of decoded records.

use chrono::{DateTime, Local};
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use tracing::info;

use crate::data::{Decoded, DecodedRecord};
use crate::error::ExportError;

/// Default number of records kept.
pub const DEFAULT_CAPACITY: usize = 100;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Fixed-capacity, oldest-first record buffer.
///
/// Sequence numbers start at 1 and are never reused, even after `clear`.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    records: VecDeque<DecodedRecord>,
    capacity: usize,
    counter: u64,
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
            counter: 0,
        }
    }

    /// Append a decoded chunk, evicting the oldest record when full.
    pub fn append(
        &mut self,
        received_at: DateTime<Local>,
        raw_bytes: Vec<u8>,
        decoded: Decoded,
    ) -> DecodedRecord {
        self.counter += 1;
        let record = DecodedRecord {
            sequence_number: self.counter,
            received_at,
            fields: decoded.fields,
            raw_bytes,
            decode_error: decoded.decode_error,
        };

        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record.clone());
        record
    }

    /// The newest `count` records (all when `None`), oldest first.
    pub fn query(&self, count: Option<usize>) -> Vec<DecodedRecord> {
        let count = count.unwrap_or(self.records.len()).min(self.records.len());
        self.records
            .iter()
            .skip(self.records.len() - count)
            .cloned()
            .collect()
    }

    /// Drop all records. The sequence counter keeps running.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sorted union of field names across buffered records.
    pub fn field_names(&self) -> Vec<String> {
        self.records
            .iter()
            .flat_map(|r| r.fields.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Write the buffer as CSV. Returns the number of rows written.
    pub fn export_csv(&self, path: &Path) -> Result<usize, ExportError> {
        if self.records.is_empty() {
            return Err(ExportError::Empty);
        }

        let io_error = |message: String| ExportError::Io {
            path: path.to_path_buf(),
            message,
        };

        let names = self.field_names();
        let mut writer = csv::Writer::from_path(path).map_err(|e| io_error(e.to_string()))?;

        let mut header = vec!["timestamp".to_string(), "message_number".to_string()];
        header.extend(names.iter().cloned());
        writer
            .write_record(&header)
            .map_err(|e| io_error(e.to_string()))?;

        for record in &self.records {
            let mut row = vec![
                record.received_at.format(TIMESTAMP_FORMAT).to_string(),
                record.sequence_number.to_string(),
            ];
            row.extend(names.iter().map(|name| {
                record
                    .fields
                    .get(name)
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            }));
            writer
                .write_record(&row)
                .map_err(|e| io_error(e.to_string()))?;
        }
        writer.flush().map_err(|e| io_error(e.to_string()))?;

        info!("Exported {} records to {:?}", self.records.len(), path);
        Ok(self.records.len())
    }
}
