//! Node pool and open list backing an incremental A* search
//!
//! A [`PathSearch`] holds all the state of one search, so it can be parked
//! between frames and resumed later. The expansion step itself lives with the
//! mesh that knows how polygons connect.

use crate::{PolyRef, SlicedSearch, Status};
use glam::Vec3;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Heuristic scale, slightly below one so the estimate stays admissible
pub const H_SCALE: f32 = 0.999;

/// Node state in the search graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Open,
    Closed,
}

/// A polygon visited by the search
#[derive(Debug, Clone)]
pub struct SearchNode {
    pub poly: PolyRef,
    /// Entry point into the polygon
    pub pos: Vec3,
    /// Cost from the start
    pub cost: f32,
    /// Cost plus heuristic
    pub total: f32,
    pub parent: Option<usize>,
    pub state: Option<NodeState>,
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    total: f32,
    node: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; ties go to the older node
        other
            .total
            .total_cmp(&self.total)
            .then_with(|| other.node.cmp(&self.node))
    }
}

/// State of one sliced path search
#[derive(Debug, Clone)]
pub struct PathSearch {
    pub(crate) status: Status,
    pub(crate) start_ref: PolyRef,
    pub(crate) end_ref: PolyRef,
    pub(crate) end_pos: Vec3,
    nodes: Vec<SearchNode>,
    lookup: HashMap<PolyRef, usize>,
    open: BinaryHeap<HeapEntry>,
    max_nodes: usize,
    pub(crate) last_best: Option<usize>,
    pub(crate) last_best_cost: f32,
}

impl PathSearch {
    /// A search that failed before it started
    pub(crate) fn failed(detail: u32) -> Self {
        Self {
            status: Status::failure_detail(detail),
            start_ref: PolyRef::NULL,
            end_ref: PolyRef::NULL,
            end_pos: Vec3::ZERO,
            nodes: Vec::new(),
            lookup: HashMap::new(),
            open: BinaryHeap::new(),
            max_nodes: 0,
            last_best: None,
            last_best_cost: f32::MAX,
        }
    }

    pub(crate) fn new(
        start_ref: PolyRef,
        end_ref: PolyRef,
        end_pos: Vec3,
        max_nodes: usize,
    ) -> Self {
        Self {
            status: Status::in_progress(),
            start_ref,
            end_ref,
            end_pos,
            nodes: Vec::new(),
            lookup: HashMap::new(),
            open: BinaryHeap::new(),
            max_nodes: max_nodes.max(1),
            last_best: None,
            last_best_cost: f32::MAX,
        }
    }

    pub fn start_ref(&self) -> PolyRef {
        self.start_ref
    }

    pub fn end_ref(&self) -> PolyRef {
        self.end_ref
    }

    /// Number of polygons touched so far
    pub fn visited_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn node(&self, idx: usize) -> &SearchNode {
        &self.nodes[idx]
    }

    pub(crate) fn node_mut(&mut self, idx: usize) -> &mut SearchNode {
        &mut self.nodes[idx]
    }

    pub(crate) fn find_node(&self, poly: PolyRef) -> Option<usize> {
        self.lookup.get(&poly).copied()
    }

    /// Returns the node for `poly`, allocating it if needed. `None` when the pool is exhausted.
    pub(crate) fn get_node(&mut self, poly: PolyRef) -> Option<usize> {
        if let Some(idx) = self.lookup.get(&poly) {
            return Some(*idx);
        }
        if self.nodes.len() >= self.max_nodes {
            return None;
        }
        let idx = self.nodes.len();
        self.nodes.push(SearchNode {
            poly,
            pos: Vec3::ZERO,
            cost: 0.0,
            total: 0.0,
            parent: None,
            state: None,
        });
        self.lookup.insert(poly, idx);
        Some(idx)
    }

    /// Pushes (or re-pushes with a better total) a node on the open list
    pub(crate) fn push_open(&mut self, idx: usize) {
        self.nodes[idx].state = Some(NodeState::Open);
        self.open.push(HeapEntry {
            total: self.nodes[idx].total,
            node: idx,
        });
    }

    /// Pops the cheapest open node and closes it
    pub(crate) fn pop_open(&mut self) -> Option<usize> {
        self.discard_stale();
        let entry = self.open.pop()?;
        self.nodes[entry.node].state = Some(NodeState::Closed);
        Some(entry.node)
    }

    pub(crate) fn has_open(&mut self) -> bool {
        self.discard_stale();
        !self.open.is_empty()
    }

    // Entries superseded by a cheaper re-push stay in the heap until they surface.
    fn discard_stale(&mut self) {
        while let Some(top) = self.open.peek() {
            let node = &self.nodes[top.node];
            if node.state == Some(NodeState::Open) && node.total == top.total {
                break;
            }
            self.open.pop();
        }
    }

    /// Walks parents back from `idx` and returns the path start-first,
    /// truncated to `max_path` polygons. The flag is set when truncated.
    pub(crate) fn path_to(&self, idx: usize, max_path: usize) -> (Vec<PolyRef>, bool) {
        let mut path = Vec::new();
        let mut cur = Some(idx);
        while let Some(i) = cur {
            path.push(self.nodes[i].poly);
            cur = self.nodes[i].parent;
        }
        path.reverse();
        let truncated = path.len() > max_path;
        path.truncate(max_path);
        (path, truncated)
    }

    /// Releases node storage once the result has been extracted
    pub(crate) fn finish(&mut self, status: Status) {
        self.status = status;
        self.nodes.clear();
        self.lookup.clear();
        self.open.clear();
        self.last_best = None;
    }
}

impl SlicedSearch for PathSearch {
    fn status(&self) -> Status {
        self.status
    }
}
