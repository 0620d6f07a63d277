//! Pagination with conditional gaps.
//!
//! A page normally holds `page_size` records. A [`ConditionalGap`] reserves
//! `size` of those slots (for a banner, an ad, …) on every page its
//! expression matches, which shifts the offsets of all later pages. The
//! slicer therefore walks pages from the first one, accumulating the offset,
//! until it knows both the requested window and the last page number.
//! Once no gap can match any further page the rest is plain division.
//!
//! Results are memoized per `(page_number, page_size, total_count)`. The memo
//! holds at most [`MEMO_CAPACITY`] windows and starts over once full.

use std::sync::Arc;

use ahash::RandomState;
use dashmap::DashMap;
use evita_common::PageExpression;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalGap {
    size: u64,
    expression: PageExpression,
    last_page: Option<u64>,
}

impl ConditionalGap {
    pub fn new(size: u64, expression: &str) -> Result<Self> {
        let expression = PageExpression::parse(expression)?;
        let last_page = expression.last_matching_page();
        Ok(Self {
            size,
            expression,
            last_page,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn expression(&self) -> &PageExpression {
        &self.expression
    }

    fn may_match_from(&self, page: u64) -> bool {
        self.last_page.map_or(true, |last| last >= page)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffsetAndLimit {
    pub offset: u64,
    pub limit: u64,
    pub page_number: u64,
    pub last_page_number: u64,
    pub total_count: u64,
}

type SliceKey = (u64, u64, u64);

/// Windows a slicer remembers before its memo is cleared.
pub const MEMO_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
pub struct PageSlicer {
    gaps: Vec<ConditionalGap>,
    memo: DashMap<SliceKey, Arc<OffsetAndLimit>, RandomState>,
}

impl PageSlicer {
    pub fn new(gaps: Vec<ConditionalGap>) -> Self {
        Self {
            gaps,
            memo: DashMap::default(),
        }
    }

    pub fn gaps(&self) -> &[ConditionalGap] {
        &self.gaps
    }

    /// Window of page `page_number` (1-based) over `total_count` records.
    ///
    /// A page past the end degrades to the first page.
    pub fn calculate_offset_and_limit(
        &self,
        page_number: u64,
        page_size: u64,
        total_count: u64,
    ) -> Result<Arc<OffsetAndLimit>> {
        if page_number == 0 || page_size == 0 {
            return Err(EngineError::configuration(format!(
                "page number and page size must be positive, got page {page_number} of size {page_size}"
            )));
        }
        let key = (page_number, page_size, total_count);
        if let Some(hit) = self.memo.get(&key) {
            return Ok(Arc::clone(hit.value()));
        }
        let computed = Arc::new(self.walk(page_number, page_size, total_count));
        if self.memo.len() >= MEMO_CAPACITY {
            self.memo.clear();
        }
        Ok(Arc::clone(self.memo.entry(key).or_insert(computed).value()))
    }

    /// Number of memoized windows.
    pub fn memoized(&self) -> usize {
        self.memo.len()
    }

    /// Slots left on `page` once every matching gap took its share; a page
    /// always keeps at least one slot.
    fn capacity(&self, active: &[&ConditionalGap], page: u64, page_size: u64) -> u64 {
        let reserved: u64 = active
            .iter()
            .filter(|gap| gap.expression.matches(page))
            .map(|gap| gap.size)
            .sum();
        page_size.saturating_sub(reserved).max(1)
    }

    fn walk(&self, requested: u64, page_size: u64, total: u64) -> OffsetAndLimit {
        let mut active: Vec<&ConditionalGap> = self.gaps.iter().collect();
        let mut offset = 0u64;
        let mut page = 1u64;
        let mut window: Option<(u64, u64)> = None;
        let mut first_limit = None;

        let last_page = loop {
            active.retain(|gap| gap.may_match_from(page));
            if active.is_empty() {
                let remaining = total.saturating_sub(offset);
                if window.is_none() {
                    let skipped = (requested - page).saturating_mul(page_size);
                    window = Some((offset.saturating_add(skipped), page_size));
                }
                first_limit.get_or_insert(page_size);
                break (page - 1).saturating_add(remaining.div_ceil(page_size).max(1));
            }

            let capacity = self.capacity(&active, page, page_size);
            first_limit.get_or_insert(capacity);
            if page == requested {
                window = Some((offset, capacity));
            }
            if offset.saturating_add(capacity) >= total {
                break page;
            }
            offset += capacity;
            page += 1;
        };

        let first_limit = first_limit.unwrap_or(page_size);
        match window {
            Some((offset, limit)) if offset < total || requested == 1 => OffsetAndLimit {
                offset,
                limit,
                page_number: requested,
                last_page_number: last_page,
                total_count: total,
            },
            _ => {
                tracing::trace!(
                    page_number = requested,
                    last_page_number = last_page,
                    "requested page is out of range, returning the first page"
                );
                OffsetAndLimit {
                    offset: 0,
                    limit: first_limit,
                    page_number: 1,
                    last_page_number: last_page,
                    total_count: total,
                }
            }
        }
    }
}
