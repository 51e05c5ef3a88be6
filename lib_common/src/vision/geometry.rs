//! Axis-aligned rectangle overlap.

/// Axis-aligned rectangle in pixel space. `(x1, y1)` is the top-left corner
/// and `(x2, y2)` the bottom-right one; inverted rectangles have zero area.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Rect {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f64 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// Same rectangle moved by `(dx, dy)`.
    pub fn translate(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }
}

/// Intersection area over union area of two rectangles, in `[0, 1]`.
///
/// Returns `0.0` whenever the union is empty, so disjoint, degenerate and
/// zero-area inputs never divide by zero.
pub fn iou(a: &Rect, b: &Rect) -> f64 {
    let overlap = Rect::new(a.x1.max(b.x1), a.y1.max(b.y1), a.x2.min(b.x2), a.y2.min(b.y2));
    let inter = overlap.area();
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64, side: f64) -> Rect {
        Rect::new(x, y, x + side, y + side)
    }

    #[test]
    fn identical_boxes_score_one() {
        let a = square(3.0, 4.0, 10.0);
        assert_eq!(iou(&a, &a), 1.0);
    }

    #[test]
    fn disjoint_boxes_score_zero() {
        let a = square(0.0, 0.0, 10.0);
        let b = square(20.0, 20.0, 5.0);
        assert_eq!(iou(&a, &b), 0.0);
        // Touching edges share no area either.
        let c = square(10.0, 0.0, 10.0);
        assert_eq!(iou(&a, &c), 0.0);
    }

    #[test]
    fn overlap_is_symmetric() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(5.0, 2.0, 17.0, 9.0);
        assert_eq!(iou(&a, &b), iou(&b, &a));
    }

    #[test]
    fn half_shifted_squares() {
        let a = square(0.0, 0.0, 10.0);
        let b = square(5.0, 0.0, 10.0);
        // 50 shared over 150 covered.
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn translating_both_boxes_keeps_the_score() {
        let a = Rect::new(1.0, 1.0, 8.0, 6.0);
        let b = Rect::new(4.0, 3.0, 12.0, 9.0);
        let before = iou(&a, &b);
        let after = iou(&a.translate(250.0, -40.0), &b.translate(250.0, -40.0));
        assert!((before - after).abs() < 1e-12);
    }

    #[test]
    fn zero_area_boxes_score_zero() {
        let point = Rect::new(5.0, 5.0, 5.0, 5.0);
        assert_eq!(iou(&point, &point), 0.0);

        let inverted = Rect::new(10.0, 10.0, 0.0, 0.0);
        assert_eq!(inverted.area(), 0.0);
        assert_eq!(iou(&inverted, &square(0.0, 0.0, 10.0)), 0.0);
    }

    #[test]
    fn contained_box_scores_area_ratio() {
        let outer = square(0.0, 0.0, 10.0);
        let inner = square(2.0, 2.0, 5.0);
        assert!((iou(&outer, &inner) - 0.25).abs() < 1e-12);
    }
}
