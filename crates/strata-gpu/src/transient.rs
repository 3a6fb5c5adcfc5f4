//! Per-frame linear allocator for short-lived upload data.
//!
//! Allocations bump a cursor through fixed-size host-visible pages. At the end
//! of a frame every page the frame touched is stamped and parked; a page only
//! returns to the available pool (cursor reset to 0) once its stamp has
//! passed, so memory still being read by the GPU is never handed out again.

use std::collections::VecDeque;
use std::ptr::NonNull;

use strata_core::{BufferDesc, BufferUsage, CompletionStamp, MemoryDomain};

use crate::backend::Backend;
use crate::error::{GpuError, Result};
use crate::freelist::align_up;

/// Identifier of a transient page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u32);

/// A span of mapped upload memory valid until the end of the frame it was
/// allocated in.
///
/// The span holds no pointer. Bytes are written through
/// [`TransientAllocator::write`], which refuses spans of closed frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientAllocation {
    page: PageId,
    offset: u64,
    size: u64,
    frame: u64,
    gpu_address: u64,
}

impl TransientAllocation {
    /// Page the span lives in.
    pub const fn page(&self) -> PageId {
        self.page
    }

    /// Offset of the span inside its page.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the span.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Frame the span belongs to.
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// GPU address of the first byte.
    pub const fn gpu_address(&self) -> u64 {
        self.gpu_address
    }
}

struct TransientPage<B: Backend> {
    buffer: B::Buffer,
    base_ptr: NonNull<u8>,
    gpu_address: u64,
    cursor: u64,
}

// SAFETY: `base_ptr` points into `buffer`'s mapping and moves with it.
unsafe impl<B: Backend> Send for TransientPage<B> {}

struct Generation {
    id: u64,
    stamp: CompletionStamp,
    pages: Vec<PageId>,
}

/// Linear allocator over a growing pool of fixed-size pages.
pub struct TransientAllocator<B: Backend> {
    page_size: u64,
    pages: Vec<TransientPage<B>>,
    available: Vec<PageId>,
    current: Vec<PageId>,
    in_flight: VecDeque<Generation>,
    generation: u64,
}

impl<B: Backend> TransientAllocator<B> {
    /// Create an allocator with pages of `page_size` bytes.
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size,
            pages: Vec::new(),
            available: Vec::new(),
            current: Vec::new(),
            in_flight: VecDeque::new(),
            generation: 0,
        }
    }

    /// Size of every page.
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Id of the frame currently being recorded.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Reserve `size` bytes aligned to `alignment` for the current frame.
    ///
    /// # Panics
    /// Panics if `size` exceeds the page size. Callers must split larger
    /// uploads themselves.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn allocate(
        &mut self,
        backend: &B,
        size: u64,
        alignment: u64,
    ) -> Result<TransientAllocation> {
        assert!(
            size <= self.page_size,
            "transient request of {size} bytes exceeds the {}-byte page",
            self.page_size
        );
        let alignment = alignment.max(1);
        debug_assert!(alignment.is_power_of_two());

        if let Some(&id) = self.current.last() {
            if let Some(allocation) = self.bump(id, size, alignment) {
                return Ok(allocation);
            }
        }

        let id = self.take_page(backend)?;
        self.current.push(id);
        self.bump(id, size, alignment).ok_or_else(|| {
            GpuError::InvalidState(format!("fresh transient page cannot hold {size} bytes"))
        })
    }

    fn bump(&mut self, id: PageId, size: u64, alignment: u64) -> Option<TransientAllocation> {
        let page = &mut self.pages[id.0 as usize];
        let offset = align_up(page.cursor, alignment);
        if offset + size > self.page_size {
            return None;
        }
        page.cursor = offset + size;
        tracing::trace!(page = id.0, offset, size, "transient allocation");

        Some(TransientAllocation {
            page: id,
            offset,
            size,
            frame: self.generation,
            gpu_address: page.gpu_address + offset,
        })
    }

    /// Copy `data` to the start of `span`.
    ///
    /// Fails if the span's frame has been closed, since its page may already
    /// be read by the GPU or handed to a later frame.
    pub fn write(&self, span: &TransientAllocation, data: &[u8]) -> Result<()> {
        if span.frame != self.generation || !self.current.contains(&span.page) {
            return Err(GpuError::InvalidState(format!(
                "transient span of frame {} written during frame {}",
                span.frame, self.generation
            )));
        }
        if data.len() as u64 > span.size {
            return Err(GpuError::Core(strata_core::Error::OutOfBounds(format!(
                "{} bytes do not fit a {}-byte transient span",
                data.len(),
                span.size
            ))));
        }
        let page = &self.pages[span.page.0 as usize];
        // SAFETY: the span lies inside this page's mapping, was handed out in
        // the open frame, and bump allocation never overlaps two spans.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                page.base_ptr.as_ptr().add(span.offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    fn take_page(&mut self, backend: &B) -> Result<PageId> {
        if let Some(id) = self.available.pop() {
            self.pages[id.0 as usize].cursor = 0;
            return Ok(id);
        }

        let desc = BufferDesc::new(
            self.page_size,
            BufferUsage::COPY_SRC
                | BufferUsage::VERTEX
                | BufferUsage::INDEX
                | BufferUsage::UNIFORM
                | BufferUsage::STORAGE,
        )
        .with_domain(MemoryDomain::Upload);
        let buffer = backend.create_buffer(&desc)?;
        let Some(base_ptr) = backend.buffer_mapped_ptr(&buffer) else {
            backend.destroy_buffer(buffer);
            return Err(GpuError::InvalidState(
                "upload page is not host-visible".to_string(),
            ));
        };
        let gpu_address = backend.buffer_gpu_address(&buffer);

        let id = PageId(self.pages.len() as u32);
        self.pages.push(TransientPage {
            buffer,
            base_ptr,
            gpu_address,
            cursor: 0,
        });
        tracing::debug!(
            page = id.0,
            page_size = self.page_size,
            total_pages = self.pages.len(),
            "created transient page"
        );
        Ok(id)
    }

    /// Close the current frame: stamp every page it used with `stamp`.
    ///
    /// Returns the id of the closed frame.
    pub fn reset(&mut self, stamp: CompletionStamp) -> u64 {
        let closed = self.generation;
        let pages = std::mem::take(&mut self.current);
        if !pages.is_empty() {
            self.in_flight.push_back(Generation {
                id: closed,
                stamp,
                pages,
            });
        }
        self.generation += 1;
        closed
    }

    /// Return pages of every frame whose stamp `completed` has passed.
    ///
    /// Returns the number of pages made available.
    pub fn reclaim(&mut self, completed: &CompletionStamp) -> usize {
        let mut reclaimed = 0;
        let mut waiting = VecDeque::with_capacity(self.in_flight.len());
        for generation in self.in_flight.drain(..) {
            if generation.stamp.has_passed(completed) {
                for id in generation.pages {
                    self.pages[id.0 as usize].cursor = 0;
                    self.available.push(id);
                    reclaimed += 1;
                }
            } else {
                waiting.push_back(generation);
            }
        }
        self.in_flight = waiting;
        reclaimed
    }

    /// Returns true if the GPU may still read memory allocated in frame `generation`.
    pub fn in_flight(&self, generation: u64, completed: &CompletionStamp) -> bool {
        if generation == self.generation {
            return true;
        }
        self.in_flight
            .iter()
            .find(|g| g.id == generation)
            .is_some_and(|g| !g.stamp.has_passed(completed))
    }

    /// Returns true if `page` belongs to a closed frame that has not been reclaimed.
    pub fn is_page_in_flight(&self, page: PageId) -> bool {
        self.in_flight.iter().any(|g| g.pages.contains(&page))
    }

    /// Native buffer behind a page.
    pub fn page_buffer(&self, page: PageId) -> Option<&B::Buffer> {
        self.pages.get(page.0 as usize).map(|p| &p.buffer)
    }

    /// Total pages ever created.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Pages ready for reuse.
    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    /// Pages held by closed frames the GPU may still be reading.
    pub fn in_flight_page_count(&self) -> usize {
        self.in_flight.iter().map(|g| g.pages.len()).sum()
    }

    /// Destroy every page. The device must be idle.
    pub fn destroy(&mut self, backend: &B) {
        self.available.clear();
        self.current.clear();
        self.in_flight.clear();
        for page in self.pages.drain(..) {
            backend.destroy_buffer(page.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{CompletionMode, HeadlessBackend};
    use strata_core::QueueClass;

    const PAGE: u64 = 4096;

    #[test]
    fn bump_within_a_page() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let mut alloc = TransientAllocator::new(PAGE);
        let a = alloc.allocate(&backend, 100, 16).unwrap();
        let b = alloc.allocate(&backend, 100, 256).unwrap();
        assert_eq!(a.page(), b.page());
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 256);
        assert_eq!(b.gpu_address() - a.gpu_address(), 256);
        assert_eq!(alloc.page_count(), 1);
    }

    #[test]
    fn spills_to_a_new_page() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let mut alloc = TransientAllocator::new(PAGE);
        let a = alloc.allocate(&backend, 3000, 1).unwrap();
        let b = alloc.allocate(&backend, 3000, 1).unwrap();
        assert_ne!(a.page(), b.page());
        assert_eq!(b.offset(), 0);
        let c = alloc.allocate(&backend, PAGE, 1).unwrap();
        assert_eq!(alloc.page_count(), 3);
        assert_eq!(c.size(), PAGE);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn oversize_request_is_fatal() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let mut alloc = TransientAllocator::new(PAGE);
        let _ = alloc.allocate(&backend, PAGE + 1, 1);
    }

    #[test]
    fn writes_land_in_the_page() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let mut alloc = TransientAllocator::new(PAGE);
        let _ = alloc.allocate(&backend, 8, 1).unwrap();
        let span = alloc.allocate(&backend, 4, 4).unwrap();
        alloc.write(&span, &[1, 2, 3, 4]).unwrap();
        let buffer = alloc.page_buffer(span.page()).unwrap();
        assert_eq!(backend.read_buffer(buffer, span.offset(), 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn closed_frame_spans_reject_writes() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let mut alloc = TransientAllocator::new(PAGE);
        let span = alloc.allocate(&backend, 16, 1).unwrap();
        assert!(alloc.write(&span, &[0; 17]).is_err());

        alloc.reset(CompletionStamp::only(QueueClass::Graphics, 1));
        assert!(alloc.write(&span, &[9; 4]).is_err());

        // the page comes back for a later frame; the old span stays dead
        alloc.reclaim(&CompletionStamp::only(QueueClass::Graphics, 1));
        let fresh = alloc.allocate(&backend, 16, 1).unwrap();
        assert_eq!(fresh.page(), span.page());
        assert_eq!(fresh.offset(), span.offset());
        assert!(alloc.write(&span, &[9; 4]).is_err());
        alloc.write(&fresh, &[5; 4]).unwrap();
        let buffer = alloc.page_buffer(fresh.page()).unwrap();
        assert_eq!(backend.read_buffer(buffer, fresh.offset(), 4), vec![5; 4]);
    }

    #[test]
    fn stalled_fence_forces_new_pages_without_touching_in_flight_ones() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let mut alloc = TransientAllocator::new(PAGE);
        let stalled = CompletionStamp::ZERO;
        let mut seen = Vec::new();

        for frame in 1..=3u64 {
            alloc.reclaim(&stalled);
            let span = alloc.allocate(&backend, PAGE / 2, 1).unwrap();
            assert!(
                !alloc.is_page_in_flight(span.page()),
                "frame {frame} was handed a page still in flight"
            );
            assert!(!seen.contains(&span.page()));
            seen.push(span.page());
            alloc.reset(CompletionStamp::only(QueueClass::Graphics, frame));
        }

        assert_eq!(alloc.page_count(), 3);
        assert_eq!(alloc.available_count(), 0);
        assert_eq!(alloc.in_flight_page_count(), 3);
    }

    #[test]
    fn pages_recycle_after_stamp_passes() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let mut alloc = TransientAllocator::new(PAGE);
        let first = alloc.allocate(&backend, 64, 1).unwrap();
        let frame = alloc.reset(CompletionStamp::new(1, 0, 1));

        assert!(alloc.in_flight(frame, &CompletionStamp::new(1, 0, 0)));
        assert_eq!(alloc.reclaim(&CompletionStamp::new(1, 0, 0)), 0);

        assert_eq!(alloc.reclaim(&CompletionStamp::new(1, 0, 1)), 1);
        assert!(!alloc.in_flight(frame, &CompletionStamp::new(1, 0, 1)));

        let again = alloc.allocate(&backend, 64, 1).unwrap();
        assert_eq!(again.page(), first.page());
        assert_eq!(again.offset(), 0);
        assert!(alloc.in_flight(alloc.generation(), &CompletionStamp::ZERO));
    }
}
