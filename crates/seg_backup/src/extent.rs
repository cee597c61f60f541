//! Byte extents inside a segment data stream and the serve arithmetic.

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Table identifier as recorded by the backup relay.
pub type TableId = u32;

/// Contiguous byte range `[start, end)` of one table inside a segment stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub table_id: TableId,
    pub start: u64,
    pub end: u64,
}

impl Extent {
    pub fn new(table_id: TableId, start: u64, end: u64) -> Self {
        Self {
            table_id,
            start,
            end,
        }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// How many bytes to drop and then copy to serve one extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServePlan {
    pub discard: u64,
    pub copy: u64,
}

impl ServePlan {
    /// Plan serving `extent` from a source currently positioned at `position`.
    ///
    /// Sources are never rewound, so an extent that starts before `position`
    /// cannot be served.
    pub fn new(position: u64, extent: &Extent) -> Result<Self, StreamError> {
        if extent.start < position {
            return Err(StreamError::ExtentBehindPosition {
                table_id: extent.table_id,
                start: extent.start,
                position,
            });
        }
        Ok(Self {
            discard: extent.start - position,
            copy: extent.len(),
        })
    }

    /// Total bytes taken from the source by this plan.
    pub fn consumed(&self) -> u64 {
        self.discard + self.copy
    }
}
