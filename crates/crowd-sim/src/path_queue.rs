//! Bounded queue of sliced path searches
//!
//! Every crowd tick the queue spends a shared iteration budget on its pending
//! searches, oldest slot first, so no single tick pays for a full search.
//! Finished results wait a couple of ticks to be collected and are dropped
//! afterwards, which also disposes of results nobody asks for anymore.

use crowd_common::Vec3;
use nav_query::{NavMeshQuery, PolyRef, PolygonFilter, SlicedSearch, Status};
use std::fmt;
use std::rc::Rc;

/// Ticks a finished result is kept before its slot is reclaimed
const MAX_KEEP_ALIVE: u32 = 2;

/// Handle of a queued path request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PathQueueRef(u32);

impl PathQueueRef {
    pub const INVALID: PathQueueRef = PathQueueRef(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PathQueueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

struct PathQuery<S> {
    handle: PathQueueRef,
    start_ref: PolyRef,
    end_ref: PolyRef,
    start_pos: Vec3,
    end_pos: Vec3,
    filter: Rc<dyn PolygonFilter>,
    /// `Status::NONE` until the search is started
    status: Status,
    search: Option<S>,
    path: Vec<PolyRef>,
    keep_alive: u32,
}

pub struct PathQueue<S> {
    queue: Vec<Option<PathQuery<S>>>,
    next_handle: u32,
    max_path_size: usize,
    queue_head: usize,
}

impl<S: SlicedSearch> PathQueue<S> {
    pub fn new(queue_size: usize, max_path_size: usize) -> Self {
        let mut queue = Vec::with_capacity(queue_size.max(1));
        queue.resize_with(queue_size.max(1), || None);
        Self {
            queue,
            next_handle: 1,
            max_path_size: max_path_size.max(1),
            queue_head: 0,
        }
    }

    /// Queues a search. Returns [`PathQueueRef::INVALID`] when every slot is taken.
    pub fn request(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: Rc<dyn PolygonFilter>,
    ) -> PathQueueRef {
        let Some(slot) = self.queue.iter().position(Option::is_none) else {
            return PathQueueRef::INVALID;
        };

        let handle = PathQueueRef(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        if self.next_handle == 0 {
            self.next_handle = 1;
        }

        self.queue[slot] = Some(PathQuery {
            handle,
            start_ref,
            end_ref,
            start_pos,
            end_pos,
            filter,
            status: Status::NONE,
            search: None,
            path: Vec::new(),
            keep_alive: 0,
        });
        handle
    }

    /// Advances pending searches, spending at most `max_iters` search iterations in total.
    pub fn update<Q>(&mut self, navquery: &Q, max_iters: usize)
    where
        Q: NavMeshQuery<Search = S> + ?Sized,
    {
        let n = self.queue.len();
        let mut iter_count = max_iters;

        for _ in 0..n {
            let head = self.queue_head % n;
            let Some(q) = self.queue[head].as_mut() else {
                self.queue_head += 1;
                continue;
            };

            // Finished: give the owner a few ticks to collect it
            if q.status.is_success() || q.status.is_failure() {
                q.keep_alive += 1;
                if q.keep_alive > MAX_KEEP_ALIVE {
                    log::trace!("Dropping uncollected path result {}", q.handle);
                    self.queue[head] = None;
                }
                self.queue_head += 1;
                continue;
            }

            if q.status == Status::NONE {
                let search = navquery.init_sliced_find_path(
                    q.start_ref,
                    q.end_ref,
                    q.start_pos,
                    q.end_pos,
                    q.filter.as_ref(),
                );
                q.status = search.status();
                q.search = Some(search);
            }

            if q.status.is_in_progress() {
                if let Some(search) = q.search.as_mut() {
                    let (status, iters) =
                        navquery.update_sliced_find_path(search, iter_count, q.filter.as_ref());
                    q.status = status;
                    iter_count = iter_count.saturating_sub(iters);
                }
            }

            if q.status.is_success() {
                if let Some(mut search) = q.search.take() {
                    let (status, path) =
                        navquery.finalize_sliced_find_path(&mut search, self.max_path_size);
                    q.status = status;
                    q.path = path;
                }
            } else if q.status.is_failure() {
                q.search = None;
            }

            if iter_count == 0 {
                break;
            }
            self.queue_head += 1;
        }
    }

    /// Status of a request, failure for unknown handles
    pub fn request_status(&self, handle: PathQueueRef) -> Status {
        self.find(handle)
            .map(|q| q.status)
            .unwrap_or_else(Status::failure)
    }

    /// Takes a finished path and frees its slot.
    ///
    /// The returned status is success with the search's detail bits.
    pub fn path_result(&mut self, handle: PathQueueRef) -> (Status, Vec<PolyRef>) {
        let Some(slot) = self
            .queue
            .iter()
            .position(|q| q.as_ref().is_some_and(|q| q.handle == handle))
        else {
            return (Status::failure(), Vec::new());
        };
        match self.queue[slot].take() {
            Some(q) => (Status::success_detail(q.status.detail()), q.path),
            None => (Status::failure(), Vec::new()),
        }
    }

    /// Drops a request whatever its state. Returns false for unknown handles.
    pub fn cancel(&mut self, handle: PathQueueRef) -> bool {
        match self
            .queue
            .iter_mut()
            .find(|q| q.as_ref().is_some_and(|q| q.handle == handle))
        {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.queue.iter().filter(|q| q.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.iter().all(Option::is_none)
    }

    pub fn capacity(&self) -> usize {
        self.queue.len()
    }

    fn find(&self, handle: PathQueueRef) -> Option<&PathQuery<S>> {
        self.queue
            .iter()
            .flatten()
            .find(|q| q.handle == handle && handle.is_valid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nav_query::{GridNavMesh, PathSearch, QueryFilter};

    fn filter() -> Rc<dyn PolygonFilter> {
        Rc::new(QueryFilter::default())
    }

    fn corridor_mesh(len: usize) -> GridNavMesh {
        GridNavMesh::new(Vec3::ZERO, 1.0, len, 1).unwrap()
    }

    fn request_across(queue: &mut PathQueue<PathSearch>, mesh: &GridNavMesh) -> PathQueueRef {
        let end_x = mesh.width() - 1;
        queue.request(
            mesh.cell_ref(0, 0),
            mesh.cell_ref(end_x, 0),
            Vec3::new(0.5, 0.0, 0.5),
            Vec3::new(end_x as f32 + 0.5, 0.0, 0.5),
            filter(),
        )
    }

    #[test]
    fn test_request_completes() {
        let mesh = corridor_mesh(8);
        let mut queue = PathQueue::new(4, 64);
        let handle = request_across(&mut queue, &mesh);
        assert!(handle.is_valid());
        assert_eq!(queue.request_status(handle), Status::NONE);

        queue.update(&mesh, 100);
        assert!(queue.request_status(handle).is_success());

        let (status, path) = queue.path_result(handle);
        assert!(status.is_success());
        assert_eq!(path.len(), 8);
        assert!(queue.is_empty());
        assert!(queue.request_status(handle).is_failure());
    }

    #[test]
    fn test_search_is_spread_over_ticks() {
        let mesh = corridor_mesh(30);
        let mut queue = PathQueue::new(4, 64);
        let handle = request_across(&mut queue, &mesh);

        queue.update(&mesh, 5);
        assert!(queue.request_status(handle).is_in_progress());

        for _ in 0..10 {
            queue.update(&mesh, 5);
        }
        assert!(queue.request_status(handle).is_success());
    }

    #[test]
    fn test_full_queue_rejects() {
        let mesh = corridor_mesh(4);
        let mut queue = PathQueue::new(2, 64);
        assert!(request_across(&mut queue, &mesh).is_valid());
        assert!(request_across(&mut queue, &mesh).is_valid());
        assert_eq!(request_across(&mut queue, &mesh), PathQueueRef::INVALID);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.capacity(), 2);
    }

    #[test]
    fn test_uncollected_results_expire() {
        let mesh = corridor_mesh(4);
        let mut queue = PathQueue::new(2, 64);
        let handle = request_across(&mut queue, &mesh);

        queue.update(&mesh, 100);
        assert!(queue.request_status(handle).is_success());
        for _ in 0..MAX_KEEP_ALIVE {
            queue.update(&mesh, 100);
            assert!(queue.request_status(handle).is_success());
        }
        queue.update(&mesh, 100);
        assert!(queue.is_empty());
        assert!(queue.path_result(handle).0.is_failure());
    }

    #[test]
    fn test_failed_search_reports_failure() {
        let mesh = corridor_mesh(4);
        let mut queue = PathQueue::new(2, 64);
        let handle = queue.request(
            PolyRef::NULL,
            mesh.cell_ref(3, 0),
            Vec3::ZERO,
            Vec3::new(3.5, 0.0, 0.5),
            filter(),
        );
        queue.update(&mesh, 100);
        assert!(queue.request_status(handle).is_failure());
    }

    #[test]
    fn test_cancel_frees_slot() {
        let mesh = corridor_mesh(4);
        let mut queue = PathQueue::new(1, 64);
        let first = request_across(&mut queue, &mesh);
        assert!(queue.cancel(first));
        assert!(!queue.cancel(first));

        let second = request_across(&mut queue, &mesh);
        assert!(second.is_valid());
        assert_ne!(first, second);
    }
}
