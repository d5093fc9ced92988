//! Uniform spatial hash for bounded-radius neighbour queries
//!
//! Items are inserted into every cell their bounding rectangle overlaps.
//! Cells hash into a power-of-two bucket table, and item records come from a
//! fixed-size pool, so a rebuild never allocates once the grid is warm. The
//! crowd clears and refills the grid every tick.

/// Sentinel bounds of an empty grid
const EMPTY_BOUNDS: [i32; 4] = [i32::MAX, i32::MAX, i32::MIN, i32::MIN];

#[derive(Debug, Clone, Copy)]
struct GridItem {
    id: usize,
    x: i32,
    y: i32,
    next: Option<usize>,
}

fn hash_pos2(x: i32, y: i32, n: usize) -> usize {
    let h = x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663);
    (h as u32 as usize) & (n - 1)
}

/// Proximity grid over the XZ plane
#[derive(Debug, Clone)]
pub struct ProximityGrid {
    cell_size: f32,
    inv_cell_size: f32,
    pool: Vec<GridItem>,
    pool_size: usize,
    buckets: Vec<Option<usize>>,
    max_items_per_cell: usize,
    bounds: [i32; 4],
}

impl ProximityGrid {
    /// Creates a grid holding at most `pool_size` cell entries.
    ///
    /// A cell accepts at most `max_items_per_cell` items; extra items are
    /// dropped from that cell.
    pub fn new(pool_size: usize, cell_size: f32, max_items_per_cell: usize) -> Self {
        let pool_size = pool_size.max(1);
        let cell_size = cell_size.max(0.001);
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            pool: Vec::with_capacity(pool_size),
            pool_size,
            buckets: vec![None; pool_size.next_power_of_two()],
            max_items_per_cell: max_items_per_cell.max(1),
            bounds: EMPTY_BOUNDS,
        }
    }

    /// Removes every item, keeping the allocations
    pub fn clear(&mut self) {
        self.pool.clear();
        self.buckets.fill(None);
        self.bounds = EMPTY_BOUNDS;
    }

    fn cell_range(&self, min: f32, max: f32) -> (i32, i32) {
        (
            (min * self.inv_cell_size).floor() as i32,
            (max * self.inv_cell_size).floor() as i32,
        )
    }

    /// Inserts `id` into every cell overlapped by the rectangle.
    ///
    /// Returns false if the item could not be stored in all of them.
    pub fn add_item(&mut self, id: usize, minx: f32, miny: f32, maxx: f32, maxy: f32) -> bool {
        let (ix0, ix1) = self.cell_range(minx, maxx);
        let (iy0, iy1) = self.cell_range(miny, maxy);

        self.bounds[0] = self.bounds[0].min(ix0);
        self.bounds[1] = self.bounds[1].min(iy0);
        self.bounds[2] = self.bounds[2].max(ix1);
        self.bounds[3] = self.bounds[3].max(iy1);

        let mut complete = true;
        for y in iy0..=iy1 {
            for x in ix0..=ix1 {
                if self.pool.len() >= self.pool_size {
                    log::debug!("Proximity grid pool exhausted ({} entries)", self.pool_size);
                    return false;
                }
                if self.item_count_at(x, y) >= self.max_items_per_cell {
                    complete = false;
                    continue;
                }

                let h = hash_pos2(x, y, self.buckets.len());
                let idx = self.pool.len();
                self.pool.push(GridItem {
                    id,
                    x,
                    y,
                    next: self.buckets[h],
                });
                self.buckets[h] = Some(idx);
            }
        }
        complete
    }

    /// Collects distinct ids stored in the cells overlapped by the rectangle,
    /// at most `max_ids` of them, in discovery order.
    pub fn query_items(
        &self,
        minx: f32,
        miny: f32,
        maxx: f32,
        maxy: f32,
        max_ids: usize,
    ) -> Vec<usize> {
        let (ix0, ix1) = self.cell_range(minx, maxx);
        let (iy0, iy1) = self.cell_range(miny, maxy);

        let mut ids = Vec::new();
        for y in iy0..=iy1 {
            for x in ix0..=ix1 {
                let h = hash_pos2(x, y, self.buckets.len());
                let mut cur = self.buckets[h];
                while let Some(idx) = cur {
                    let item = &self.pool[idx];
                    if item.x == x && item.y == y && !ids.contains(&item.id) {
                        if ids.len() >= max_ids {
                            return ids;
                        }
                        ids.push(item.id);
                    }
                    cur = item.next;
                }
            }
        }
        ids
    }

    /// Number of items stored in cell `(x, y)`
    pub fn item_count_at(&self, x: i32, y: i32) -> usize {
        let h = hash_pos2(x, y, self.buckets.len());
        let mut n = 0;
        let mut cur = self.buckets[h];
        while let Some(idx) = cur {
            let item = &self.pool[idx];
            if item.x == x && item.y == y {
                n += 1;
            }
            cur = item.next;
        }
        n
    }

    /// Occupied cell range as `[minx, miny, maxx, maxy]`
    pub fn bounds(&self) -> [i32; 4] {
        self.bounds
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_query() {
        let mut grid = ProximityGrid::new(64, 1.0, 16);
        assert!(grid.is_empty());

        assert!(grid.add_item(0, 0.1, 0.1, 0.4, 0.4));
        assert!(grid.add_item(1, 5.1, 5.1, 5.4, 5.4));

        assert_eq!(grid.query_items(-1.0, -1.0, 1.0, 1.0, 8), vec![0]);
        assert_eq!(grid.query_items(4.0, 4.0, 6.0, 6.0, 8), vec![1]);
        assert!(grid.query_items(2.0, 2.0, 3.0, 3.0, 8).is_empty());
    }

    #[test]
    fn test_spanning_item_is_reported_once() {
        let mut grid = ProximityGrid::new(64, 1.0, 16);
        // Covers four cells
        grid.add_item(7, 0.5, 0.5, 1.5, 1.5);
        assert_eq!(grid.item_count_at(0, 0), 1);
        assert_eq!(grid.item_count_at(1, 1), 1);
        assert_eq!(grid.query_items(0.0, 0.0, 2.0, 2.0, 8), vec![7]);
        assert_eq!(grid.bounds(), [0, 0, 1, 1]);
    }

    #[test]
    fn test_query_limit() {
        let mut grid = ProximityGrid::new(64, 2.0, 16);
        for id in 0..5 {
            grid.add_item(id, 0.5, 0.5, 0.6, 0.6);
        }
        assert_eq!(grid.query_items(0.0, 0.0, 1.0, 1.0, 3).len(), 3);
        assert_eq!(grid.item_count_at(0, 0), 5);
    }

    #[test]
    fn test_cell_and_pool_limits() {
        let mut grid = ProximityGrid::new(64, 1.0, 2);
        assert!(grid.add_item(0, 0.5, 0.5, 0.5, 0.5));
        assert!(grid.add_item(1, 0.5, 0.5, 0.5, 0.5));
        assert!(!grid.add_item(2, 0.5, 0.5, 0.5, 0.5));
        assert_eq!(grid.item_count_at(0, 0), 2);

        let mut small = ProximityGrid::new(2, 1.0, 8);
        assert!(!small.add_item(0, 0.0, 0.0, 2.5, 0.5));
        assert_eq!(small.query_items(0.0, 0.0, 3.0, 1.0, 8), vec![0]);
    }

    #[test]
    fn test_negative_coordinates_and_clear() {
        let mut grid = ProximityGrid::new(16, 1.5, 8);
        grid.add_item(3, -2.0, -2.0, -1.8, -1.8);
        assert_eq!(grid.bounds(), [-2, -2, -2, -2]);
        assert_eq!(grid.query_items(-3.0, -3.0, -1.0, -1.0, 8), vec![3]);

        grid.clear();
        assert!(grid.is_empty());
        assert!(grid.query_items(-3.0, -3.0, -1.0, -1.0, 8).is_empty());
        assert_eq!(grid.cell_size(), 1.5);
    }
}
