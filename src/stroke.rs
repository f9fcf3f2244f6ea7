//! The drawn stroke: canvas-space points in arrival order

use std::sync::Arc;

use crate::coords::Point2D;

/// Points per sealed chunk
const CHUNK_LEN: usize = 256;

/// Append-only point buffer with cheap read-only snapshots
///
/// Points are sealed into fixed-size shared chunks as they fill up, so a
/// snapshot only copies the open tail and bumps the chunk refcounts.
#[derive(Debug, Clone, Default)]
pub struct Stroke {
    sealed: Vec<Arc<[Point2D]>>,
    tail: Vec<Point2D>,
    /// Bumped on every clear so readers can tell a restart from an extension
    generation: u64,
}

impl Stroke {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, p: Point2D) {
        self.tail.push(p);
        if self.tail.len() == CHUNK_LEN {
            let chunk = std::mem::replace(&mut self.tail, Vec::with_capacity(CHUNK_LEN));
            self.sealed.push(Arc::from(chunk));
        }
    }

    pub fn clear(&mut self) {
        self.sealed.clear();
        self.tail.clear();
        self.generation += 1;
    }

    pub fn len(&self) -> usize {
        self.sealed.len() * CHUNK_LEN + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> StrokeSnapshot {
        let mut chunks = self.sealed.clone();
        if !self.tail.is_empty() {
            chunks.push(Arc::from(self.tail.as_slice()));
        }
        StrokeSnapshot {
            chunks,
            len: self.len(),
            generation: self.generation,
        }
    }
}

/// Frozen view of a [`Stroke`]; iteration over it is restartable
#[derive(Debug, Clone, Default)]
pub struct StrokeSnapshot {
    chunks: Vec<Arc<[Point2D]>>,
    len: usize,
    generation: u64,
}

impl StrokeSnapshot {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Points from index `offset` on; every chunk but the last is full
    pub fn since(&self, offset: usize) -> impl Iterator<Item = &Point2D> + '_ {
        self.chunks
            .iter()
            .skip(offset / CHUNK_LEN)
            .flat_map(|c| c.iter())
            .skip(offset % CHUNK_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize) -> Stroke {
        let mut stroke = Stroke::new();
        for i in 0..n {
            stroke.append(Point2D::new(i as f64, 0.0));
        }
        stroke
    }

    #[test]
    fn test_append_preserves_order() {
        let mut stroke = Stroke::new();
        stroke.append(Point2D::new(1.0, 1.0));
        stroke.append(Point2D::new(2.0, 2.0));
        stroke.append(Point2D::new(3.0, 1.5));

        let snap = stroke.snapshot();
        let xs: Vec<f64> = snap.since(0).map(|p| p.x).collect();
        assert_eq!(xs, vec![1.0, 2.0, 3.0]);
        // Iteration is restartable
        assert_eq!(snap.since(0).count(), 3);
    }

    #[test]
    fn test_snapshot_is_frozen() {
        let mut stroke = Stroke::new();
        stroke.append(Point2D::new(1.0, 1.0));
        let snap = stroke.snapshot();

        stroke.append(Point2D::new(2.0, 2.0));
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.since(0).count(), 1);
        assert_eq!(stroke.snapshot().len(), 2);
    }

    #[test]
    fn test_sealed_chunks_are_shared() {
        let stroke = filled(CHUNK_LEN * 2 + 10);
        let a = stroke.snapshot();
        let b = stroke.snapshot();

        assert_eq!(a.chunks.len(), 3);
        assert!(Arc::ptr_eq(&a.chunks[0], &b.chunks[0]));
        assert!(Arc::ptr_eq(&a.chunks[1], &b.chunks[1]));
        assert_eq!(a.len(), CHUNK_LEN * 2 + 10);
    }

    #[test]
    fn test_since_crosses_chunk_boundaries() {
        let snap = filled(CHUNK_LEN * 2 + 10).snapshot();

        let xs: Vec<f64> = snap.since(CHUNK_LEN - 2).take(4).map(|p| p.x).collect();
        let start = (CHUNK_LEN - 2) as f64;
        assert_eq!(xs, vec![start, start + 1.0, start + 2.0, start + 3.0]);

        assert_eq!(snap.since(CHUNK_LEN * 2).count(), 10);
        assert_eq!(snap.since(CHUNK_LEN * 2 + 10).count(), 0);
        assert_eq!(snap.since(10_000).count(), 0);
        assert_eq!(snap.since(0).count(), snap.len());
    }

    #[test]
    fn test_exactly_full_chunk_has_no_empty_tail() {
        let snap = filled(CHUNK_LEN).snapshot();
        assert_eq!(snap.chunks.len(), 1);
        assert_eq!(snap.since(CHUNK_LEN).count(), 0);
    }

    #[test]
    fn test_clear_bumps_generation() {
        let mut stroke = filled(CHUNK_LEN + 1);
        let before = stroke.snapshot().generation();

        stroke.clear();
        assert!(stroke.is_empty());
        assert!(stroke.snapshot().since(0).next().is_none());
        assert_eq!(stroke.snapshot().generation(), before + 1);
    }
}
