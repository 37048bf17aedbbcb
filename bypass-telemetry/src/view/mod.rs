//! View
//! What a screen of records is made of: the filtered, sorted rows of one
//! history and the window of them that is on screen.

mod pipeline;
mod window;

pub use self::pipeline::{LogView, Refresh, VisibleRows};
pub use self::window::{
    visible_range, ScrollAnchor, Viewport, VisibleRange, DEFAULT_BOTTOM_PROXIMITY,
    DEFAULT_OVERSCAN,
};
