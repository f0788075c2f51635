//! Collision/layout guard for the reserved core area.
//!
//! The core block sits at a fixed rectangle. Every other block must stay
//! outside that rectangle grown by a margin; a block dropped inside is snapped
//! to the closest free edge instead of being rejected.

use crate::{Point, Rect};

/// Fixed rectangle of the core block.
pub const CORE_RECT: Rect = Rect {
    x: 0.0,
    y: 0.0,
    width: 480.0,
    height: 320.0,
};

/// Clearance kept around the core rectangle.
pub const CORE_MARGIN: f64 = 48.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoreZone {
    pub rect: Rect,
    pub margin: f64,
}

impl Default for CoreZone {
    fn default() -> Self {
        Self {
            rect: CORE_RECT,
            margin: CORE_MARGIN,
        }
    }
}

impl CoreZone {
    pub fn new(rect: Rect, margin: f64) -> Self {
        Self { rect, margin }
    }

    /// The area no other block may overlap.
    pub fn reserved(&self) -> Rect {
        self.rect.inflate(self.margin)
    }

    pub fn is_clear(&self, candidate: &Rect) -> bool {
        !candidate.overlaps(&self.reserved())
    }

    /// Placement for `candidate`: its own origin when clear, otherwise the
    /// nearest edge-snapped origin. Ties resolve left, right, above, below.
    pub fn resolve(&self, candidate: Rect) -> Point {
        if self.is_clear(&candidate) {
            return Point::new(candidate.x, candidate.y);
        }

        let zone = self.reserved();
        let options = [
            Point::new(zone.x - candidate.width, candidate.y),
            Point::new(zone.max_x(), candidate.y),
            Point::new(candidate.x, zone.y - candidate.height),
            Point::new(candidate.x, zone.max_y()),
        ];

        let mut best = options[0];
        let mut best_dist = f64::INFINITY;
        for option in options {
            let dist = (option.x - candidate.x).abs() + (option.y - candidate.y).abs();
            if dist < best_dist {
                best = option;
                best_dist = dist;
            }
        }
        best
    }

    /// Convenience wrapper returning the corrected rectangle.
    pub fn place(&self, candidate: Rect) -> Rect {
        candidate.with_origin(self.resolve(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_block_untouched() {
        let zone = CoreZone::default();
        let candidate = Rect::new(800.0, 0.0, 200.0, 120.0);
        assert_eq!(zone.resolve(candidate), Point::new(800.0, 0.0));
    }

    #[test]
    fn test_block_at_core_center_is_moved_out() {
        let zone = CoreZone::default();
        let center = zone.rect.center();
        let candidate = Rect::new(center.x - 50.0, center.y - 30.0, 100.0, 60.0);

        let placed = zone.place(candidate);
        assert!(!placed.overlaps(&zone.reserved()));
        assert!(zone.is_clear(&placed));
    }

    #[test]
    fn test_snaps_to_nearest_edge() {
        let zone = CoreZone::default();
        // Slightly inside the right edge of the reserved area.
        let reserved = zone.reserved();
        let candidate = Rect::new(reserved.max_x() - 10.0, 100.0, 50.0, 50.0);
        let origin = zone.resolve(candidate);
        assert_eq!(origin, Point::new(reserved.max_x(), 100.0));
    }

    #[test]
    fn test_snaps_above_when_closest() {
        let zone = CoreZone::default();
        let reserved = zone.reserved();
        let candidate = Rect::new(200.0, reserved.y - 40.0, 60.0, 50.0);
        let origin = zone.resolve(candidate);
        assert_eq!(origin, Point::new(200.0, reserved.y - 50.0));
    }

    #[test]
    fn test_touching_edge_is_clear() {
        let zone = CoreZone::default();
        let reserved = zone.reserved();
        let candidate = Rect::new(reserved.max_x(), reserved.y, 10.0, 10.0);
        assert!(zone.is_clear(&candidate));
        assert_eq!(zone.resolve(candidate), Point::new(candidate.x, candidate.y));
    }

    #[test]
    fn test_custom_zone() {
        let zone = CoreZone::new(Rect::new(-100.0, -100.0, 200.0, 200.0), 0.0);
        let placed = zone.place(Rect::new(-10.0, -10.0, 20.0, 20.0));
        assert!(zone.is_clear(&placed));
    }
}
