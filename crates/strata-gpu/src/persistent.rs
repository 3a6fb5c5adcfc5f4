//! Long-lived buffer sub-allocation.
//!
//! Small buffers are carved out of large shared pages, one set of pages per
//! memory domain, each page managed by a [`FreeListRegion`]. Requests above
//! the dedicated threshold, GPU-writable buffers and readback buffers get a
//! region of their own. Initial contents for device-local memory are staged
//! through the transient allocator and copied on the copy queue later.

use std::ptr::NonNull;

use hashbrown::HashMap;
use strata_core::{BufferDesc, BufferUsage, MemoryDomain};

use crate::backend::Backend;
use crate::error::{GpuError, Result};
use crate::freelist::FreeListRegion;
use crate::transient::{PageId, TransientAllocator};

/// Placement of one buffer inside a backing region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferAllocation {
    region: u32,
    offset: u64,
    size: u64,
    base_address: u64,
    domain: MemoryDomain,
    dedicated: bool,
}

impl BufferAllocation {
    /// Backing region id.
    pub const fn region(&self) -> u32 {
        self.region
    }

    /// Offset inside the backing region.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Requested size.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Memory domain of the backing region.
    pub const fn domain(&self) -> MemoryDomain {
        self.domain
    }

    /// Returns true if the buffer owns its region outright.
    pub const fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// GPU address of the first byte.
    pub const fn gpu_address(&self) -> u64 {
        self.base_address + self.offset
    }
}

/// A pending staging-to-destination copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadRequest {
    /// Transient page holding the source bytes.
    pub staging_page: PageId,
    /// Offset of the source bytes in the page.
    pub staging_offset: u64,
    /// Destination region.
    pub dst_region: u32,
    /// Destination offset inside the region.
    pub dst_offset: u64,
    /// Bytes to copy.
    pub size: u64,
}

struct Region<B: Backend> {
    buffer: B::Buffer,
    list: FreeListRegion,
    domain: MemoryDomain,
    dedicated: bool,
    mapped: Option<NonNull<u8>>,
    gpu_address: u64,
}

// SAFETY: `mapped` points into `buffer`'s mapping and moves with it.
unsafe impl<B: Backend> Send for Region<B> {}

/// Allocator statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PersistentStats {
    /// Shared pages across all domains.
    pub shared_pages: usize,
    /// Dedicated regions.
    pub dedicated_regions: usize,
    /// Bytes handed out to live allocations.
    pub allocated_bytes: u64,
    /// Bytes of backing memory held.
    pub reserved_bytes: u64,
    /// Copies waiting for the next flush.
    pub pending_uploads: usize,
}

/// Free-list allocator over shared pages plus dedicated regions.
pub struct PersistentAllocator<B: Backend> {
    page_size: u64,
    dedicated_threshold: u64,
    regions: Vec<Option<Region<B>>>,
    free_ids: Vec<u32>,
    shared: [Vec<u32>; 2],
    uploads: HashMap<u32, Vec<UploadRequest>>,
}

impl<B: Backend> PersistentAllocator<B> {
    /// Usage every shared page is created with.
    const PAGE_USAGE: BufferUsage = BufferUsage::VERTEX
        .union(BufferUsage::INDEX)
        .union(BufferUsage::UNIFORM)
        .union(BufferUsage::STORAGE)
        .union(BufferUsage::INDIRECT)
        .union(BufferUsage::COPY_SRC)
        .union(BufferUsage::COPY_DST);

    /// Staging alignment for upload chunks.
    const STAGING_ALIGNMENT: u64 = 16;

    /// Create an allocator with `page_size` shared pages. Requests larger
    /// than `dedicated_threshold` get a region of their own.
    pub fn new(page_size: u64, dedicated_threshold: u64) -> Self {
        Self {
            page_size,
            dedicated_threshold: dedicated_threshold.min(page_size),
            regions: Vec::new(),
            free_ids: Vec::new(),
            shared: [Vec::new(), Vec::new()],
            uploads: HashMap::new(),
        }
    }

    /// Size of every shared page.
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Returns true if `desc` must be placed in a dedicated region.
    pub fn wants_dedicated(&self, desc: &BufferDesc) -> bool {
        desc.size > self.dedicated_threshold
            || desc.is_writable()
            || desc.domain == MemoryDomain::Readback
    }

    const fn shared_slot(domain: MemoryDomain) -> Option<usize> {
        match domain {
            MemoryDomain::Device => Some(0),
            MemoryDomain::Upload => Some(1),
            MemoryDomain::Readback => None,
        }
    }

    /// Place a buffer and, if `data` is given, write or stage its contents.
    ///
    /// Host-visible placements are written immediately. Device-local ones
    /// queue [`UploadRequest`]s that must be flushed on the copy queue.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn alloc(
        &mut self,
        backend: &B,
        staging: &mut TransientAllocator<B>,
        desc: &BufferDesc,
        data: Option<&[u8]>,
    ) -> Result<BufferAllocation> {
        desc.validate()?;
        if let Some(bytes) = data {
            if bytes.len() as u64 > desc.size {
                return Err(GpuError::Core(strata_core::Error::OutOfBounds(format!(
                    "{} bytes of initial data for a {}-byte buffer",
                    bytes.len(),
                    desc.size
                ))));
            }
        }

        let allocation = if self.wants_dedicated(desc) {
            self.alloc_dedicated(backend, desc)?
        } else {
            self.alloc_shared(backend, desc)?
        };

        if let Some(bytes) = data.filter(|b| !b.is_empty()) {
            if let Err(err) = self.write_initial(backend, staging, &allocation, bytes) {
                self.cancel_uploads(&allocation);
                self.free(backend, allocation);
                return Err(err);
            }
        }
        Ok(allocation)
    }

    fn insert_region(&mut self, region: Region<B>) -> u32 {
        if let Some(id) = self.free_ids.pop() {
            self.regions[id as usize] = Some(region);
            id
        } else {
            self.regions.push(Some(region));
            (self.regions.len() - 1) as u32
        }
    }

    fn create_region(
        backend: &B,
        desc: &BufferDesc,
        dedicated: bool,
    ) -> Result<Region<B>> {
        let buffer = backend.create_buffer(desc)?;
        let mapped = backend.buffer_mapped_ptr(&buffer);
        if desc.domain.is_host_visible() && mapped.is_none() {
            backend.destroy_buffer(buffer);
            return Err(GpuError::InvalidState(
                "host-visible region is not mapped".to_string(),
            ));
        }
        let gpu_address = backend.buffer_gpu_address(&buffer);
        Ok(Region {
            buffer,
            list: FreeListRegion::new(desc.size),
            domain: desc.domain,
            dedicated,
            mapped,
            gpu_address,
        })
    }

    fn alloc_dedicated(&mut self, backend: &B, desc: &BufferDesc) -> Result<BufferAllocation> {
        let mut region = Self::create_region(backend, desc, true)?;
        let offset = region.list.allocate(desc.size, 1).ok_or_else(|| {
            GpuError::AllocationFailed(format!("dedicated region of {} bytes", desc.size))
        })?;
        let base_address = region.gpu_address;
        let domain = region.domain;
        let id = self.insert_region(region);
        tracing::debug!(region = id, size = desc.size, ?domain, "dedicated buffer region");
        Ok(BufferAllocation {
            region: id,
            offset,
            size: desc.size,
            base_address,
            domain,
            dedicated: true,
        })
    }

    fn alloc_shared(&mut self, backend: &B, desc: &BufferDesc) -> Result<BufferAllocation> {
        let slot = Self::shared_slot(desc.domain).ok_or_else(|| {
            GpuError::InvalidState("readback buffers are always dedicated".to_string())
        })?;
        let alignment = desc.alignment.max(1);

        for &id in &self.shared[slot] {
            if let Some(region) = self.regions[id as usize].as_mut() {
                if let Some(offset) = region.list.allocate(desc.size, alignment) {
                    return Ok(BufferAllocation {
                        region: id,
                        offset,
                        size: desc.size,
                        base_address: region.gpu_address,
                        domain: region.domain,
                        dedicated: false,
                    });
                }
            }
        }

        let page_desc = BufferDesc::new(self.page_size, Self::PAGE_USAGE).with_domain(desc.domain);
        let mut region = Self::create_region(backend, &page_desc, false)?;
        let offset = region.list.allocate(desc.size, alignment).ok_or_else(|| {
            GpuError::AllocationFailed(format!(
                "{} bytes do not fit a fresh {}-byte page",
                desc.size, self.page_size
            ))
        })?;
        let base_address = region.gpu_address;
        let domain = region.domain;
        let id = self.insert_region(region);
        self.shared[slot].push(id);
        tracing::debug!(
            region = id,
            page_size = self.page_size,
            ?domain,
            pages = self.shared[slot].len(),
            "created shared buffer page"
        );
        Ok(BufferAllocation {
            region: id,
            offset,
            size: desc.size,
            base_address,
            domain,
            dedicated: false,
        })
    }

    fn write_initial(
        &mut self,
        backend: &B,
        staging: &mut TransientAllocator<B>,
        allocation: &BufferAllocation,
        bytes: &[u8],
    ) -> Result<()> {
        if let Some(ptr) = self.mapped_ptr(allocation) {
            // SAFETY: the allocation spans at least `bytes.len()` mapped bytes
            // and is not yet visible to the GPU.
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
            }
            return Ok(());
        }

        let chunk = usize::try_from(align_down(staging.page_size(), Self::STAGING_ALIGNMENT))
            .unwrap_or(usize::MAX)
            .max(1);
        let mut requests = Vec::with_capacity(bytes.len().div_ceil(chunk));
        for (i, piece) in bytes.chunks(chunk).enumerate() {
            let span = staging.allocate(backend, piece.len() as u64, Self::STAGING_ALIGNMENT)?;
            staging.write(&span, piece)?;
            requests.push(UploadRequest {
                staging_page: span.page(),
                staging_offset: span.offset(),
                dst_region: allocation.region,
                dst_offset: allocation.offset + (i * chunk) as u64,
                size: piece.len() as u64,
            });
        }
        self.uploads
            .entry(allocation.region)
            .or_default()
            .extend(requests);
        Ok(())
    }

    /// Return an allocation. The GPU must be done with it.
    pub fn free(&mut self, backend: &B, allocation: BufferAllocation) {
        let Some(region) = self
            .regions
            .get_mut(allocation.region as usize)
            .and_then(Option::as_mut)
        else {
            tracing::warn!(region = allocation.region, "free of an unknown buffer region");
            return;
        };

        if region.dedicated {
            if let Some(region) = self.regions[allocation.region as usize].take() {
                backend.destroy_buffer(region.buffer);
            }
            self.uploads.remove(&allocation.region);
            self.free_ids.push(allocation.region);
            tracing::debug!(region = allocation.region, "released dedicated region");
        } else {
            region.list.free(allocation.offset, allocation.size);
            if region.list.is_unused() {
                self.release_empty_page(backend, allocation.region, allocation.domain);
            }
        }
    }

    /// Destroy an empty shared page unless it is the last one of its domain.
    fn release_empty_page(&mut self, backend: &B, id: u32, domain: MemoryDomain) {
        let Some(slot) = Self::shared_slot(domain) else {
            return;
        };
        let pages = &mut self.shared[slot];
        if pages.len() <= 1 {
            return;
        }
        pages.retain(|&page| page != id);
        if let Some(region) = self.regions[id as usize].take() {
            backend.destroy_buffer(region.buffer);
        }
        self.uploads.remove(&id);
        self.free_ids.push(id);
        tracing::debug!(region = id, ?domain, pages = pages.len(), "released shared buffer page");
    }

    /// Drop queued uploads that target `allocation`.
    ///
    /// Returns the number of requests removed.
    pub fn cancel_uploads(&mut self, allocation: &BufferAllocation) -> usize {
        let Some(requests) = self.uploads.get_mut(&allocation.region) else {
            return 0;
        };
        let start = allocation.offset;
        let end = allocation.offset + allocation.size;
        let before = requests.len();
        requests.retain(|r| r.dst_offset + r.size <= start || r.dst_offset >= end);
        let removed = before - requests.len();
        if requests.is_empty() {
            self.uploads.remove(&allocation.region);
        }
        removed
    }

    /// Take every queued upload, ordered by region then destination offset.
    pub fn take_uploads(&mut self) -> Vec<UploadRequest> {
        let mut out: Vec<UploadRequest> = self.uploads.drain().flat_map(|(_, r)| r).collect();
        out.sort_by_key(|r| (r.dst_region, r.dst_offset));
        out
    }

    /// Put back uploads taken by [`Self::take_uploads`] that were never
    /// submitted. Requests whose region has since been released are dropped.
    pub fn restore_uploads(&mut self, requests: Vec<UploadRequest>) {
        for request in requests {
            let live = self
                .regions
                .get(request.dst_region as usize)
                .is_some_and(Option::is_some);
            if live {
                self.uploads.entry(request.dst_region).or_default().push(request);
            }
        }
    }

    /// Number of queued uploads.
    pub fn pending_uploads(&self) -> usize {
        self.uploads.values().map(Vec::len).sum()
    }

    /// Native buffer backing `region`.
    pub fn region_buffer(&self, region: u32) -> Option<&B::Buffer> {
        self.regions
            .get(region as usize)
            .and_then(Option::as_ref)
            .map(|r| &r.buffer)
    }

    /// CPU pointer to the first byte of a host-visible allocation.
    pub fn mapped_ptr(&self, allocation: &BufferAllocation) -> Option<NonNull<u8>> {
        let region = self.regions.get(allocation.region as usize)?.as_ref()?;
        let base = region.mapped?;
        // SAFETY: offset lies inside the region's mapping.
        Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(allocation.offset as usize)) })
    }

    /// Current statistics.
    pub fn stats(&self) -> PersistentStats {
        let mut stats = PersistentStats {
            pending_uploads: self.pending_uploads(),
            ..PersistentStats::default()
        };
        for region in self.regions.iter().flatten() {
            if region.dedicated {
                stats.dedicated_regions += 1;
            } else {
                stats.shared_pages += 1;
            }
            stats.allocated_bytes += region.list.allocated_bytes();
            stats.reserved_bytes += region.list.size();
        }
        stats
    }

    /// Check tiling invariants of every shared page.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        for (id, region) in self.regions.iter().enumerate() {
            if let Some(region) = region {
                region
                    .list
                    .check_invariants()
                    .map_err(|e| format!("region {id}: {e}"))?;
            }
        }
        Ok(())
    }

    /// Destroy every region. The device must be idle.
    pub fn destroy(&mut self, backend: &B) {
        self.uploads.clear();
        self.free_ids.clear();
        for list in &mut self.shared {
            list.clear();
        }
        for region in self.regions.drain(..).flatten() {
            backend.destroy_buffer(region.buffer);
        }
    }
}

const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{CompletionMode, HeadlessBackend};

    const PAGE: u64 = 2 * 1024 * 1024;

    type Setup = (
        HeadlessBackend,
        TransientAllocator<HeadlessBackend>,
        PersistentAllocator<HeadlessBackend>,
    );

    fn setup() -> Setup {
        (
            HeadlessBackend::new(CompletionMode::Manual),
            TransientAllocator::new(64 * 1024),
            PersistentAllocator::new(PAGE, PAGE / 2),
        )
    }

    fn storage(size: u64) -> BufferDesc {
        BufferDesc::new(size, BufferUsage::STORAGE)
    }

    #[test]
    fn freed_range_is_reused() {
        let (backend, mut staging, mut alloc) = setup();
        let first = alloc.alloc(&backend, &mut staging, &storage(5000), None).unwrap();
        alloc.free(&backend, first);
        let second = alloc.alloc(&backend, &mut staging, &storage(5000), None).unwrap();
        assert_eq!(first.region(), second.region());
        assert_eq!(first.offset(), second.offset());
        assert_eq!(alloc.stats().shared_pages, 1);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn routing_to_dedicated_regions() {
        let (_backend, _staging, alloc) = setup();
        assert!(!alloc.wants_dedicated(&storage(1024)));
        assert!(alloc.wants_dedicated(&storage(PAGE / 2 + 1)));
        assert!(alloc.wants_dedicated(&BufferDesc::new(64, BufferUsage::STORAGE_WRITE)));
        assert!(alloc.wants_dedicated(
            &BufferDesc::new(64, BufferUsage::COPY_DST).with_domain(MemoryDomain::Readback)
        ));
    }

    #[test]
    fn dedicated_region_is_destroyed_on_free() {
        let (backend, mut staging, mut alloc) = setup();
        let big = alloc
            .alloc(&backend, &mut staging, &storage(PAGE), None)
            .unwrap();
        assert!(big.is_dedicated());
        assert_eq!(big.offset(), 0);
        assert_eq!(backend.live_objects().buffers, 1);

        alloc.free(&backend, big);
        assert_eq!(backend.live_objects().buffers, 0);

        // region id is recycled
        let again = alloc
            .alloc(&backend, &mut staging, &storage(PAGE), None)
            .unwrap();
        assert_eq!(again.region(), big.region());
    }

    #[test]
    fn alignment_and_addresses() {
        let (backend, mut staging, mut alloc) = setup();
        let a = alloc.alloc(&backend, &mut staging, &storage(10), None).unwrap();
        let b = alloc
            .alloc(&backend, &mut staging, &storage(10).with_alignment(1024), None)
            .unwrap();
        assert_eq!(a.region(), b.region());
        assert_eq!(b.offset() % 1024, 0);
        assert_eq!(b.gpu_address() - a.gpu_address(), b.offset() - a.offset());
    }

    #[test]
    fn upload_domain_is_written_directly() {
        let (backend, mut staging, mut alloc) = setup();
        let desc = BufferDesc::new(4, BufferUsage::UNIFORM).with_domain(MemoryDomain::Upload);
        let a = alloc
            .alloc(&backend, &mut staging, &desc, Some(&[1, 2, 3, 4]))
            .unwrap();
        assert_eq!(alloc.pending_uploads(), 0);
        let buffer = alloc.region_buffer(a.region()).unwrap();
        assert_eq!(backend.read_buffer(buffer, a.offset(), 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn device_data_is_staged_in_chunks() {
        let (backend, mut staging, mut alloc) = setup();
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        let a = alloc
            .alloc(&backend, &mut staging, &storage(data.len() as u64), Some(&data))
            .unwrap();

        let uploads = alloc.take_uploads();
        assert_eq!(uploads.len(), 3);
        assert_eq!(uploads.iter().map(|u| u.size).sum::<u64>(), data.len() as u64);
        assert_eq!(uploads[0].dst_offset, a.offset());
        assert_eq!(uploads[1].dst_offset, a.offset() + 64 * 1024);
        assert!(uploads.iter().all(|u| u.dst_region == a.region()));
        assert_eq!(alloc.pending_uploads(), 0);
    }

    #[test]
    fn cancel_only_touches_the_freed_range() {
        let (backend, mut staging, mut alloc) = setup();
        let a = alloc
            .alloc(&backend, &mut staging, &storage(16), Some(&[1; 16]))
            .unwrap();
        let b = alloc
            .alloc(&backend, &mut staging, &storage(16), Some(&[2; 16]))
            .unwrap();
        assert_eq!(alloc.pending_uploads(), 2);

        assert_eq!(alloc.cancel_uploads(&a), 1);
        let left = alloc.take_uploads();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].dst_offset, b.offset());
    }

    #[test]
    fn oversized_initial_data_is_rejected() {
        let (backend, mut staging, mut alloc) = setup();
        let err = alloc
            .alloc(&backend, &mut staging, &storage(2), Some(&[0; 3]))
            .unwrap_err();
        assert!(matches!(err, GpuError::Core(strata_core::Error::OutOfBounds(_))));
        assert_eq!(alloc.stats().allocated_bytes, 0);
    }

    #[test]
    fn stats_track_bytes() {
        let (backend, mut staging, mut alloc) = setup();
        let a = alloc.alloc(&backend, &mut staging, &storage(1000), None).unwrap();
        let _b = alloc.alloc(&backend, &mut staging, &storage(PAGE), None).unwrap();
        let stats = alloc.stats();
        assert_eq!(stats.shared_pages, 1);
        assert_eq!(stats.dedicated_regions, 1);
        assert_eq!(stats.allocated_bytes, 1000 + PAGE);
        assert_eq!(stats.reserved_bytes, 2 * PAGE);
        alloc.free(&backend, a);
        assert_eq!(alloc.stats().allocated_bytes, PAGE);
        alloc.destroy(&backend);
        assert_eq!(backend.live_objects().buffers, 0);
    }

    #[test]
    fn empty_extra_pages_are_released() {
        let (backend, mut staging, mut alloc) = setup();
        let half = storage(PAGE / 2);
        let a = alloc.alloc(&backend, &mut staging, &half, None).unwrap();
        let b = alloc.alloc(&backend, &mut staging, &half, None).unwrap();
        let c = alloc.alloc(&backend, &mut staging, &half, None).unwrap();
        assert_eq!(a.region(), b.region());
        assert_ne!(a.region(), c.region());
        assert_eq!(alloc.stats().shared_pages, 2);

        alloc.free(&backend, c);
        assert_eq!(alloc.stats().shared_pages, 1);
        assert_eq!(backend.live_objects().buffers, 1);

        // the last page of a domain stays
        alloc.free(&backend, a);
        alloc.free(&backend, b);
        assert_eq!(alloc.stats().shared_pages, 1);
        alloc.check_invariants().unwrap();

        let again = alloc.alloc(&backend, &mut staging, &half, None).unwrap();
        assert_eq!(again.region(), a.region());
        assert_eq!(alloc.stats().shared_pages, 1);
    }
}
