//! Window
//!
//! Geometry of a scrolled list of fixed-height rows: which rows intersect
//! the viewport (plus overscan on both sides), and how tall the spacers
//! standing in for the skipped rows are. Units are whatever the caller
//! uses for heights and offsets; the terminal viewer uses rows.

use std::ops::Range;

pub const DEFAULT_OVERSCAN: usize = 10;
/// Distance from the bottom within which an update keeps following the tail.
pub const DEFAULT_BOTTOM_PROXIMITY: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Scroll offset from the top of the content.
    pub offset: f64,
    pub height: f64,
    pub row_height: f64,
    /// Extra rows materialized above and below the visible ones.
    pub overscan: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VisibleRange {
    pub start: usize,
    pub end: usize,
    pub top_spacer: f64,
    pub bottom_spacer: f64,
}

impl VisibleRange {
    pub fn rows(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Rows `[floor(offset/rh) - overscan, start + ceil(height/rh) + 2*overscan)`
/// clamped to `[0, total]`.
pub fn visible_range(total: usize, viewport: &Viewport) -> VisibleRange {
    let rh = viewport.row_height;
    if total == 0 || rh.is_nan() || rh <= 0.0 {
        return VisibleRange::default();
    }
    let first = (viewport.offset.max(0.0) / rh).floor() as usize;
    let start = first.saturating_sub(viewport.overscan).min(total);
    let shown = (viewport.height.max(0.0) / rh).ceil() as usize;
    let end = start
        .saturating_add(shown)
        .saturating_add(viewport.overscan.saturating_mul(2))
        .min(total);
    VisibleRange {
        start,
        end,
        top_spacer: start as f64 * rh,
        bottom_spacer: (total - end) as f64 * rh,
    }
}

/// Scroll position that follows the tail of growing content while the user
/// stays near the bottom.
#[derive(Debug, Clone)]
pub struct ScrollAnchor {
    offset: f64,
    viewport_height: f64,
    row_height: f64,
    proximity: f64,
    total_rows: usize,
    new_below: bool,
}

impl ScrollAnchor {
    pub fn new(viewport_height: f64, row_height: f64, proximity: f64) -> Self {
        Self {
            offset: 0.0,
            viewport_height: viewport_height.max(0.0),
            row_height: row_height.max(f64::MIN_POSITIVE),
            proximity,
            total_rows: 0,
            new_below: false,
        }
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn viewport(&self, overscan: usize) -> Viewport {
        Viewport {
            offset: self.offset,
            height: self.viewport_height,
            row_height: self.row_height,
            overscan,
        }
    }

    pub fn set_viewport_height(&mut self, height: f64) {
        let following = self.near_bottom();
        self.viewport_height = height.max(0.0);
        if following {
            self.offset = self.max_offset();
        } else {
            self.offset = self.offset.min(self.max_offset());
        }
    }

    fn max_offset(&self) -> f64 {
        (self.total_rows as f64 * self.row_height - self.viewport_height).max(0.0)
    }

    pub fn near_bottom(&self) -> bool {
        self.max_offset() - self.offset <= self.proximity
    }

    pub fn scroll_by(&mut self, delta: f64) {
        self.offset = (self.offset + delta).clamp(0.0, self.max_offset());
        if self.near_bottom() {
            self.new_below = false;
        }
    }

    pub fn scroll_to_top(&mut self) {
        self.scroll_by(f64::NEG_INFINITY);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.offset = self.max_offset();
        self.new_below = false;
    }

    /// Content now has `total_rows` rows. Re-anchors to the bottom if the
    /// position was near it before the update, otherwise keeps the position
    /// and flags new rows below.
    pub fn apply_update(&mut self, total_rows: usize) {
        let following = self.near_bottom();
        let grew = total_rows > self.total_rows;
        self.total_rows = total_rows;
        if following {
            self.scroll_to_bottom();
        } else {
            self.offset = self.offset.min(self.max_offset());
            if grew {
                self.new_below = true;
            }
        }
    }

    pub fn has_new_below(&self) -> bool {
        self.new_below
    }
}

impl Default for ScrollAnchor {
    fn default() -> Self {
        Self::new(0.0, 1.0, DEFAULT_BOTTOM_PROXIMITY)
    }
}
