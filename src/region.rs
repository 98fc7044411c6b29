//! Region algebra (component B): a set of non-overlapping rectangles in
//! framebuffer coordinates, with union/intersect/subtract/offset and a
//! deterministic iteration order.
//!
//! Grounded on the teacher's per-client `DirtyRegion`/`modified_regions`
//! bookkeeping in `client.rs`, generalized from "one rectangle" into a
//! true rectangle set so `mark_modified`/`schedule_copy` can accumulate
//! disjoint areas without the caller having to merge them by hand.

use std::cmp::{max, min};

/// A single half-open rectangle `[x1, x2) x [y1, y2)` in framebuffer
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    /// Left edge, inclusive.
    pub x1: i32,
    /// Top edge, inclusive.
    pub y1: i32,
    /// Right edge, exclusive.
    pub x2: i32,
    /// Bottom edge, exclusive.
    pub y2: i32,
}

impl Rect {
    /// Builds a rectangle from position and size.
    #[must_use]
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self {
            x1: x,
            y1: y,
            x2: x + w,
            y2: y + h,
        }
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// True when the rectangle covers zero pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x1 >= self.x2 || self.y1 >= self.y2
    }

    /// Intersection of two rectangles, or `None` if disjoint.
    #[must_use]
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let r = Rect {
            x1: max(self.x1, other.x1),
            y1: max(self.y1, other.y1),
            x2: min(self.x2, other.x2),
            y2: min(self.y2, other.y2),
        };
        if r.is_empty() {
            None
        } else {
            Some(r)
        }
    }

    /// Translates the rectangle by `(dx, dy)`.
    #[must_use]
    pub fn offset(&self, dx: i32, dy: i32) -> Rect {
        Rect {
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            x2: self.x2 + dx,
            y2: self.y2 + dy,
        }
    }

    fn overlaps(&self, other: &Rect) -> bool {
        self.x1 < other.x2 && other.x1 < self.x2 && self.y1 < other.y2 && other.y1 < self.y2
    }

    fn touches(&self, other: &Rect) -> bool {
        // Rectangles that share a full edge can be merged into one band
        // without changing the covered pixel set; this keeps rectangle
        // counts from growing unboundedly under repeated small updates.
        if self.x1 == other.x1 && self.x2 == other.x2 {
            self.y2 == other.y1 || other.y2 == self.y1
        } else if self.y1 == other.y1 && self.y2 == other.y2 {
            self.x2 == other.x1 || other.x2 == self.x1
        } else {
            false
        }
    }

    fn union_bbox(&self, other: &Rect) -> Rect {
        Rect {
            x1: min(self.x1, other.x1),
            y1: min(self.y1, other.y1),
            x2: max(self.x2, other.x2),
            y2: max(self.y2, other.y2),
        }
    }

    /// Subtracts `other` from `self`, returning zero or more rectangles
    /// whose union equals `self \ other`.
    fn subtract(&self, other: &Rect) -> Vec<Rect> {
        let Some(ix) = self.intersect(other) else {
            return vec![*self];
        };
        let mut out = Vec::with_capacity(4);
        if self.y1 < ix.y1 {
            out.push(Rect { x1: self.x1, y1: self.y1, x2: self.x2, y2: ix.y1 });
        }
        if ix.y2 < self.y2 {
            out.push(Rect { x1: self.x1, y1: ix.y2, x2: self.x2, y2: self.y2 });
        }
        if self.x1 < ix.x1 {
            out.push(Rect { x1: self.x1, y1: ix.y1, x2: ix.x1, y2: ix.y2 });
        }
        if ix.x2 < self.x2 {
            out.push(Rect { x1: ix.x2, y1: ix.y1, x2: self.x2, y2: ix.y2 });
        }
        out
    }
}

/// Iteration order for [`Region::iter`].
///
/// Pixel-rectangle order is irrelevant to correctness but must be
/// deterministic for reproducible tests (spec §4.B); CopyRect order
/// additionally must be reverse-stable with respect to the translation
/// sign so a receiver applying copies in place never overwrites an
/// as-yet-unread source pixel (spec §4.B, §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterOrder {
    /// Row-major by top-left corner; deterministic, no copy semantics.
    RowMajor,
    /// Safe order for emitting CopyRect with translation `(dx, dy)`:
    /// rectangles are visited back-to-front along the direction the
    /// copy moves pixels, so overlapping source/destination bands never
    /// clobber an unread source.
    CopySafe {
        /// Horizontal translation (`dst + dx == src`).
        dx: i32,
        /// Vertical translation (`dst + dy == src`).
        dy: i32,
    },
}

/// A set of disjoint rectangles. Equality is defined as "covers the
/// same pixels", which for the canonical (merged, non-overlapping)
/// representation this type always maintains reduces to `Vec` equality
/// up to ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    /// The empty region.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A region covering a single rectangle.
    #[must_use]
    pub fn single(r: Rect) -> Self {
        if r.is_empty() {
            Self::new()
        } else {
            Self { rects: vec![r] }
        }
    }

    /// True when the region covers zero pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Number of rectangles in the canonical representation. Not
    /// necessarily minimal, but stable for a given sequence of
    /// operations.
    #[must_use]
    pub fn count_rects(&self) -> usize {
        self.rects.len()
    }

    /// The bounding box of every rectangle in the region, or `None` for
    /// the empty region.
    #[must_use]
    pub fn bbox(&self) -> Option<Rect> {
        self.rects.iter().copied().reduce(|a, b| a.union_bbox(&b))
    }

    /// Adds `r` to the region, merging with any touching/overlapping
    /// rectangles already present.
    pub fn add(&mut self, r: Rect) {
        if r.is_empty() {
            return;
        }
        let mut merged = r;
        let mut i = 0;
        while i < self.rects.len() {
            if merged.overlaps(&self.rects[i]) || merged.touches(&self.rects[i]) {
                merged = merged.union_bbox(&self.rects.swap_remove(i));
            } else {
                i += 1;
            }
        }
        self.rects.push(merged);
    }

    /// `self ∪ other`.
    #[must_use]
    pub fn union(&self, other: &Region) -> Region {
        let mut out = self.clone();
        for r in &other.rects {
            out.add(*r);
        }
        out
    }

    /// `self ∩ other`.
    #[must_use]
    pub fn intersect(&self, other: &Region) -> Region {
        let mut out = Region::new();
        for a in &self.rects {
            for b in &other.rects {
                if let Some(ix) = a.intersect(b) {
                    out.rects.push(ix);
                }
            }
        }
        out.normalize();
        out
    }

    /// `self \ other`.
    #[must_use]
    pub fn subtract(&self, other: &Region) -> Region {
        let mut pieces = self.rects.clone();
        for b in &other.rects {
            let mut next = Vec::with_capacity(pieces.len());
            for a in &pieces {
                next.extend(a.subtract(b));
            }
            pieces = next;
        }
        let mut out = Region { rects: pieces };
        out.normalize();
        out
    }

    /// Translates every rectangle in the region by `(dx, dy)`.
    #[must_use]
    pub fn offset(&self, dx: i32, dy: i32) -> Region {
        Region {
            rects: self.rects.iter().map(|r| r.offset(dx, dy)).collect(),
        }
    }

    /// Iterates the region's rectangles in the requested order.
    pub fn iter(&self, order: IterOrder) -> impl Iterator<Item = Rect> + '_ {
        let mut rects = self.rects.clone();
        match order {
            IterOrder::RowMajor => {
                rects.sort_by_key(|r| (r.y1, r.x1));
            }
            IterOrder::CopySafe { dx, dy } => {
                // Visiting in the direction pixels move from ensures a
                // rectangle is fully read before a later one overwrites
                // it in an in-place apply. When dy > 0 (content moves
                // down) destinations must be written bottom-to-top;
                // symmetric for dx.
                rects.sort_by(|a, b| {
                    let ay = if dy >= 0 { -a.y1 } else { a.y1 };
                    let by = if dy >= 0 { -b.y1 } else { b.y1 };
                    let ax = if dx >= 0 { -a.x1 } else { a.x1 };
                    let bx = if dx >= 0 { -b.x1 } else { b.x1 };
                    (ay, ax).cmp(&(by, bx))
                });
            }
        }
        rects.into_iter()
    }

    fn normalize(&mut self) {
        let rects = std::mem::take(&mut self.rects);
        for r in rects {
            self.add(r);
        }
    }
}

impl FromIterator<Rect> for Region {
    fn from_iter<T: IntoIterator<Item = Rect>>(iter: T) -> Self {
        let mut region = Region::new();
        for r in iter {
            region.add(r);
        }
        region
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn covers(region: &Region, x: i32, y: i32) -> bool {
        region.rects.iter().any(|r| r.x1 <= x && x < r.x2 && r.y1 <= y && y < r.y2)
    }

    #[test]
    fn union_superset() {
        let a = Region::single(Rect::new(0, 0, 4, 4));
        let b = Region::single(Rect::new(10, 10, 2, 2));
        let u = a.union(&b);
        for y in 0..4 {
            for x in 0..4 {
                assert!(covers(&u, x, y));
            }
        }
        assert!(covers(&u, 10, 10));
    }

    #[test]
    fn union_then_intersect_b_is_b() {
        let a = Region::single(Rect::new(0, 0, 4, 4));
        let b = Region::single(Rect::new(2, 2, 4, 4));
        let u = a.union(&b);
        let ix = u.intersect(&b);
        for y in 2..6 {
            for x in 2..6 {
                assert!(covers(&ix, x, y));
            }
        }
    }

    #[test]
    fn subtract_disjoint_from_subtrahend() {
        let a = Region::single(Rect::new(0, 0, 10, 10));
        let b = Region::single(Rect::new(3, 3, 4, 4));
        let diff = a.subtract(&b);
        let ix = diff.intersect(&b);
        assert!(ix.is_empty());
    }

    #[test]
    fn iter_union_round_trips() {
        let mut region = Region::new();
        region.add(Rect::new(0, 0, 3, 3));
        region.add(Rect::new(20, 20, 3, 3));
        let rebuilt: Region = region.iter(IterOrder::RowMajor).collect();
        assert_eq!(region, rebuilt);
    }

    #[test]
    fn copy_safe_order_is_deterministic_and_covers_all() {
        let mut region = Region::new();
        region.add(Rect::new(0, 0, 5, 1));
        region.add(Rect::new(0, 5, 5, 1));
        let a: Vec<_> = region.iter(IterOrder::CopySafe { dx: 0, dy: 2 }).collect();
        let b: Vec<_> = region.iter(IterOrder::CopySafe { dx: 0, dy: 2 }).collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    proptest::proptest! {
        #[test]
        fn prop_union_superset(ax in 0i32..50, ay in 0i32..50, aw in 1i32..20, ah in 1i32..20,
                                bx in 0i32..50, by in 0i32..50, bw in 1i32..20, bh in 1i32..20) {
            let a = Region::single(Rect::new(ax, ay, aw, ah));
            let b = Region::single(Rect::new(bx, by, bw, bh));
            let u = a.union(&b);
            // (A ∪ B) ∩ B == B
            let ix = u.intersect(&b);
            let back_to_b = ix.subtract(&b);
            prop_assert!(back_to_b.is_empty());
            let leftover = b.subtract(&ix);
            prop_assert!(leftover.is_empty());
        }

        #[test]
        fn prop_subtract_disjoint(ax in 0i32..50, ay in 0i32..50, aw in 1i32..20, ah in 1i32..20,
                                   bx in 0i32..50, by in 0i32..50, bw in 1i32..20, bh in 1i32..20) {
            let a = Region::single(Rect::new(ax, ay, aw, ah));
            let b = Region::single(Rect::new(bx, by, bw, bh));
            let diff = a.subtract(&b);
            prop_assert!(diff.intersect(&b).is_empty());
        }
    }
}
