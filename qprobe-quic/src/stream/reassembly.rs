//! # Stream Data Reassembly
//!
//! Frames can arrive out of order, overlap and repeat. The buffer keeps the
//! bytes between the read offset and the highest offset seen, plus the list
//! of byte ranges inside that window that have not arrived yet ("gaps").
//!
//! ```text
//! read_offset            max_read_received
//!      |                         |
//!      [ data | gap | data | gap | data ]
//! ```
//!
//! Whenever the gap closest to the read offset is filled, the contiguous
//! run in front of the next gap (or up to `max_read_received`) is handed out
//! and the read offset advances.
//!
//! ## Final Offset
//!
//! The first FIN fixes the final offset. A later FIN at another offset, or
//! data beyond the final offset, is reported as a [`FinalOffsetAnomaly`]
//! and the offending bytes are ignored.
//!
//! ## Window
//!
//! A buffer may be bounded: frames ending more than `window` bytes past the
//! read offset are rejected whole, before any memory is reserved for them.

#![forbid(unsafe_code)]

use bytes::{Bytes, BytesMut};
use core::ops::Range;

// ============================================================================
// Gap List
// ============================================================================

/// Sorted, non-overlapping list of half-open byte ranges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gaps {
    ranges: Vec<Range<u64>>,
}

impl Gaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a range, merging it with any range it touches
    pub fn add(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for r in self.ranges.drain(..) {
            if r.end < merged.start {
                out.push(r);
            } else if merged.end < r.start {
                if !placed {
                    out.push(merged.clone());
                    placed = true;
                }
                out.push(r);
            } else {
                merged = merged.start.min(r.start)..merged.end.max(r.end);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.ranges = out;
    }

    /// Remove `range` from the list, shrinking or splitting what it overlaps
    pub fn fill(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if r.end <= range.start || range.end <= r.start {
                out.push(r);
                continue;
            }
            if r.start < range.start {
                out.push(r.start..range.start);
            }
            if range.end < r.end {
                out.push(range.end..r.end);
            }
        }
        self.ranges = out;
    }

    /// Number of bytes of `range` that are still missing
    pub fn missing_in(&self, range: &Range<u64>) -> u64 {
        self.ranges
            .iter()
            .map(|r| {
                let start = r.start.max(range.start);
                let end = r.end.min(range.end);
                end.saturating_sub(start)
            })
            .sum()
    }

    pub fn first(&self) -> Option<&Range<u64>> {
        self.ranges.first()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<u64>> {
        self.ranges.iter()
    }
}

// ============================================================================
// Reassembly Buffer
// ============================================================================

/// FIN-related inconsistency in received data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalOffsetAnomaly {
    /// A FIN at a different offset than the first one
    Conflicting { first: u64, conflicting: u64 },
    /// Data (or an earlier FIN) beyond the final offset
    DataPast { final_offset: u64, end: u64 },
}

/// What one insertion changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Insertion {
    /// Bytes that became contiguous, starting at the previous read offset
    pub delivered: Option<Bytes>,
    /// The frame carried data but nothing new
    pub duplicate: bool,
    /// The read side just reached the final offset
    pub finished: bool,
    pub anomaly: Option<FinalOffsetAnomaly>,
    /// The frame ended past this offset (read offset + window) and was
    /// ignored
    pub window_exceeded: Option<u64>,
}

/// In-order delivery of possibly overlapping byte ranges
#[derive(Debug, Clone, Default)]
pub struct ReassemblyBuffer {
    read_offset: u64,
    max_read_received: u64,
    /// Bytes `[read_offset, max_read_received)`, zeroed where gaps remain
    pending: BytesMut,
    gaps: Gaps,
    final_offset: Option<u64>,
    finished: bool,
    /// Bytes accepted ahead of the read offset; unbounded when unset
    window: Option<u64>,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that rejects data more than `window` bytes ahead of the read
    /// offset
    pub fn with_window(window: u64) -> Self {
        Self {
            window: Some(window),
            ..Self::default()
        }
    }

    pub fn window(&self) -> Option<u64> {
        self.window
    }

    /// Next byte offset to be delivered
    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// Highest offset received so far
    pub fn max_read_received(&self) -> u64 {
        self.max_read_received
    }

    pub fn final_offset(&self) -> Option<u64> {
        self.final_offset
    }

    /// Every byte up to the final offset has been delivered
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn gaps(&self) -> &Gaps {
        &self.gaps
    }

    /// Insert the bytes `data` found at `offset`
    pub fn insert(&mut self, offset: u64, data: &[u8], fin: bool) -> Insertion {
        let mut end = offset.saturating_add(data.len() as u64);
        let mut insertion = Insertion::default();

        if let Some(window) = self.window {
            let limit = self.read_offset.saturating_add(window);
            if end > limit {
                insertion.window_exceeded = Some(limit);
                return insertion;
            }
        }

        if fin {
            match self.final_offset {
                Some(first) if first != end => {
                    insertion.anomaly = Some(FinalOffsetAnomaly::Conflicting {
                        first,
                        conflicting: end,
                    });
                }
                Some(_) => {}
                None if end < self.max_read_received => {
                    insertion.anomaly = Some(FinalOffsetAnomaly::DataPast {
                        final_offset: end,
                        end: self.max_read_received,
                    });
                }
                None => self.final_offset = Some(end),
            }
        }
        if let Some(final_offset) = self.final_offset {
            if end > final_offset {
                insertion
                    .anomaly
                    .get_or_insert(FinalOffsetAnomaly::DataPast { final_offset, end });
                end = final_offset;
            }
        }

        let start = offset.max(self.read_offset);
        if start < end {
            let fresh = self.gaps.missing_in(&(start..end))
                + end.saturating_sub(start.max(self.max_read_received));
            insertion.duplicate = fresh == 0;

            if end > self.max_read_received {
                if start > self.max_read_received {
                    self.gaps.add(self.max_read_received..start);
                } else {
                    self.gaps.fill(start..self.max_read_received);
                }
                self.pending.resize((end - self.read_offset) as usize, 0);
                self.max_read_received = end;
            } else {
                self.gaps.fill(start..end);
            }
            let src = &data[(start - offset) as usize..(end - offset) as usize];
            let at = (start - self.read_offset) as usize;
            self.pending[at..at + src.len()].copy_from_slice(src);
        } else if !data.is_empty() {
            insertion.duplicate = true;
        }

        let contiguous_end = self
            .gaps
            .first()
            .map(|g| g.start)
            .unwrap_or(self.max_read_received);
        if contiguous_end > self.read_offset {
            let n = (contiguous_end - self.read_offset) as usize;
            insertion.delivered = Some(self.pending.split_to(n).freeze());
            self.read_offset = contiguous_end;
        }

        if !self.finished && self.final_offset == Some(self.read_offset) {
            self.finished = true;
            insertion.finished = true;
        }
        insertion
    }
}
