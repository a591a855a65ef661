//! Viewport to chunk subscription tracking for clients.
//!
//! A client follows every chunk whose area intersects its viewport, clamped
//! to the canvas, and subscribes to each chunk at most once.

use std::collections::HashSet;

use crate::room::ChunkCoord;

/// Visible region in canvas pixels. May extend past the canvas edges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewportTracker {
    width: u32,
    height: u32,
    chunk_size: u32,
    subscribed: HashSet<ChunkCoord>,
}

impl ViewportTracker {
    /// Tracker for a canvas of `width`×`height` pixels split into
    /// `chunk_size` chunks, as announced by the `init` message.
    pub fn new(width: u32, height: u32, chunk_size: u32) -> Self {
        Self {
            width,
            height,
            chunk_size: chunk_size.max(1),
            subscribed: HashSet::new(),
        }
    }

    /// Every chunk intersecting `viewport`, in row-major order.
    pub fn visible_chunks(&self, viewport: &Viewport) -> Vec<ChunkCoord> {
        let Some((x0, x1)) = chunk_span(viewport.x, viewport.width, self.width, self.chunk_size)
        else {
            return Vec::new();
        };
        let Some((y0, y1)) = chunk_span(viewport.y, viewport.height, self.height, self.chunk_size)
        else {
            return Vec::new();
        };
        (y0..y1)
            .flat_map(|cy| (x0..x1).map(move |cx| ChunkCoord::new(cx, cy)))
            .collect()
    }

    /// Chunks that became visible and have not been subscribed yet. They are
    /// marked subscribed.
    pub fn update(&mut self, viewport: &Viewport) -> Vec<ChunkCoord> {
        self.visible_chunks(viewport)
            .into_iter()
            .filter(|coord| self.subscribed.insert(*coord))
            .collect()
    }

    pub fn is_subscribed(&self, coord: ChunkCoord) -> bool {
        self.subscribed.contains(&coord)
    }

    pub fn subscribed_count(&self) -> usize {
        self.subscribed.len()
    }
}

/// Half-open chunk index range covered by `[start, start + len)` on an axis
/// of `extent` pixels.
fn chunk_span(start: f64, len: f64, extent: u32, chunk_size: u32) -> Option<(u32, u32)> {
    if !start.is_finite() || !len.is_finite() || len <= 0.0 {
        return None;
    }
    let lo = start.max(0.0);
    let hi = (start + len).min(extent as f64);
    if lo >= hi {
        return None;
    }
    let size = chunk_size as f64;
    let first = (lo / size).floor() as u32;
    let last = (hi / size).ceil() as u32;
    Some((first, last.min(extent.div_ceil(chunk_size))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords(list: &[(u32, u32)]) -> Vec<ChunkCoord> {
        list.iter().map(|&(cx, cy)| ChunkCoord::new(cx, cy)).collect()
    }

    #[test]
    fn test_viewport_inside_one_chunk() {
        let tracker = ViewportTracker::new(256, 256, 64);
        assert_eq!(
            tracker.visible_chunks(&Viewport::new(10.0, 10.0, 20.0, 20.0)),
            coords(&[(0, 0)])
        );
    }

    #[test]
    fn test_partial_chunks_at_edges_are_included() {
        let tracker = ViewportTracker::new(256, 256, 64);
        assert_eq!(
            tracker.visible_chunks(&Viewport::new(60.0, 0.0, 10.0, 65.0)),
            coords(&[(0, 0), (1, 0), (0, 1), (1, 1)])
        );
    }

    #[test]
    fn test_exact_boundary_does_not_spill() {
        let tracker = ViewportTracker::new(256, 256, 64);
        assert_eq!(
            tracker.visible_chunks(&Viewport::new(0.0, 0.0, 64.0, 64.0)),
            coords(&[(0, 0)])
        );
    }

    #[test]
    fn test_viewport_is_clamped_to_canvas() {
        let tracker = ViewportTracker::new(128, 128, 64);
        let all = tracker.visible_chunks(&Viewport::new(-500.0, -500.0, 5000.0, 5000.0));
        assert_eq!(all, coords(&[(0, 0), (1, 0), (0, 1), (1, 1)]));
        assert!(tracker
            .visible_chunks(&Viewport::new(300.0, 0.0, 50.0, 50.0))
            .is_empty());
        assert!(tracker
            .visible_chunks(&Viewport::new(0.0, 0.0, 0.0, 50.0))
            .is_empty());
    }

    #[test]
    fn test_update_subscribes_each_chunk_once() {
        let mut tracker = ViewportTracker::new(256, 256, 64);
        let first = tracker.update(&Viewport::new(0.0, 0.0, 100.0, 50.0));
        assert_eq!(first, coords(&[(0, 0), (1, 0)]));

        // Panning right only adds the newly visible column.
        let second = tracker.update(&Viewport::new(50.0, 0.0, 100.0, 50.0));
        assert_eq!(second, coords(&[(2, 0)]));
        assert!(tracker.update(&Viewport::new(0.0, 0.0, 150.0, 50.0)).is_empty());
        assert_eq!(tracker.subscribed_count(), 3);
        assert!(tracker.is_subscribed(ChunkCoord::new(2, 0)));
    }
}
