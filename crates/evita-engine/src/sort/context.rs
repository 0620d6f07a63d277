//! State threaded through a sorter chain.
//!
//! Each stage sees the keys no earlier stage resolved plus the output window
//! *relative to its own output*. A stage that resolved `n` keys of which
//! `skipped` fell before the window and `read` landed inside it hands the
//! next stage a window shifted by those two counts.

use roaring::RoaringBitmap;

#[derive(Debug, Clone, PartialEq)]
pub struct SortingContext {
    /// Keys no stage resolved yet.
    pub non_sorted_keys: RoaringBitmap,
    /// Window start relative to the remaining stages' output.
    pub recomputed_start_index: usize,
    /// Window end (exclusive) relative to the remaining stages' output.
    pub recomputed_end_index: usize,
    /// Next write position in the output buffer.
    pub peak: usize,
}

impl SortingContext {
    pub fn new(keys: RoaringBitmap, start: usize, end: usize) -> Self {
        Self {
            non_sorted_keys: keys,
            recomputed_start_index: start,
            recomputed_end_index: end.max(start),
            peak: 0,
        }
    }

    /// Number of keys still wanted in the output.
    pub fn remaining_window(&self) -> usize {
        self.recomputed_end_index - self.recomputed_start_index
    }

    pub fn is_window_filled(&self) -> bool {
        self.recomputed_start_index >= self.recomputed_end_index
    }

    /// The context after a stage resolved `skipped + read + …` keys.
    pub fn create_result_context(&self, remaining: RoaringBitmap, read: usize, skipped: usize) -> Self {
        let start = self.recomputed_start_index.saturating_sub(skipped);
        let end = self
            .recomputed_end_index
            .saturating_sub(skipped)
            .saturating_sub(read)
            .max(start);
        Self {
            non_sorted_keys: remaining,
            recomputed_start_index: start,
            recomputed_end_index: end,
            peak: self.peak + read,
        }
    }
}

/// Writes one stage's resolved keys into the window of the output buffer.
pub(crate) struct WindowWriter<'a, 'b> {
    start: usize,
    end: usize,
    position: usize,
    peak: usize,
    read: usize,
    skipped: usize,
    out: &'a mut [u32],
    on_skipped: &'b mut dyn FnMut(u32),
}

impl<'a, 'b> WindowWriter<'a, 'b> {
    pub(crate) fn new(ctx: &SortingContext, out: &'a mut [u32], on_skipped: &'b mut dyn FnMut(u32)) -> Self {
        Self {
            start: ctx.recomputed_start_index,
            end: ctx.recomputed_end_index,
            position: 0,
            peak: ctx.peak,
            read: 0,
            skipped: 0,
            out,
            on_skipped,
        }
    }

    /// Emit the next resolved key in this stage's order.
    pub(crate) fn push(&mut self, key: u32) {
        if self.position < self.start {
            self.skipped += 1;
            (self.on_skipped)(key);
        } else if self.position < self.end && self.peak + self.read < self.out.len() {
            self.out[self.peak + self.read] = key;
            self.read += 1;
        }
        self.position += 1;
    }

    /// Whether further keys can no longer reach the output.
    pub(crate) fn is_past_window(&self) -> bool {
        self.position >= self.end || self.peak + self.read >= self.out.len()
    }

    /// `(read, skipped)`
    pub(crate) fn finish(self) -> (usize, usize) {
        (self.read, self.skipped)
    }
}
