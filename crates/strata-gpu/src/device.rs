//! The device context.
//!
//! `Device` owns every registry: textures, buffers with their persistent
//! allocator, views with one descriptor table recycler per class, the
//! transient allocator, the retirement queue and the per-queue command
//! pools. Each registry sits behind its own lock. When more than one is
//! needed they are taken in this order:
//!
//! textures, buffers, views, transient, retirement, queue pools.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use strata_core::{
    kind, BufferDesc, BufferHandle, BufferViewDesc, CompletionStamp, DescriptorClass,
    DeviceConfig, Handle, HandleArena, QueueClass, ResourceKind, TextureDesc, TextureHandle,
    TextureViewDesc, ViewDesc, ViewHandle,
};

use crate::backend::{Backend, BufferCopy};
use crate::command::{CommandList, QueuePool};
use crate::counters::CompletionCounters;
use crate::descriptor::{DescriptorTable, DescriptorTableRecycler, RecyclerStats, ViewRecord};
use crate::error::{GpuError, Result};
use crate::persistent::{BufferAllocation, PersistentAllocator, PersistentStats, UploadRequest};
use crate::retire::RetirementQueue;
use crate::transient::{TransientAllocation, TransientAllocator};

struct TextureRecord<B: Backend> {
    desc: TextureDesc,
    native: B::Texture,
}

struct BufferRecord {
    desc: BufferDesc,
    allocation: BufferAllocation,
}

struct BufferRegistry<B: Backend> {
    arena: HandleArena<BufferRecord, kind::Buffer>,
    memory: PersistentAllocator<B>,
}

struct ViewRegistry<B: Backend> {
    arena: HandleArena<ViewRecord<B>, kind::View>,
    recyclers: [DescriptorTableRecycler<B>; DescriptorClass::COUNT],
}

impl<B: Backend> ViewRegistry<B> {
    fn recycler(&mut self, class: DescriptorClass) -> &mut DescriptorTableRecycler<B> {
        &mut self.recyclers[class.index()]
    }
}

/// Something the GPU may still read after the CPU let go of it.
enum Retiree<B: Backend> {
    Texture(B::Texture),
    View(B::View),
    Allocation(BufferAllocation),
}

/// Snapshot of device bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Live texture handles.
    pub textures: usize,
    /// Live buffer handles.
    pub buffers: usize,
    /// Live view handles.
    pub views: usize,
    /// Persistent allocator figures.
    pub persistent: PersistentStats,
    /// Transient pages ever created.
    pub transient_pages: usize,
    /// Transient pages ready for reuse.
    pub transient_available: usize,
    /// Transient pages the GPU may still read.
    pub transient_in_flight: usize,
    /// Items waiting in the retirement queue.
    pub pending_retirements: usize,
    /// Per descriptor class, indexed by [`DescriptorClass::index`].
    pub descriptor_tables: [RecyclerStats; DescriptorClass::COUNT],
    /// Last submitted values.
    pub submitted: CompletionStamp,
    /// Last polled completed values.
    pub completed: CompletionStamp,
}

/// Resource kinds whose handles the device refcounts.
pub trait DeviceResource: ResourceKind + Sized {
    #[doc(hidden)]
    fn add_ref<B: Backend>(device: &Device<B>, handle: Handle<Self>) -> bool;
    #[doc(hidden)]
    fn release<B: Backend>(device: &Device<B>, handle: Handle<Self>) -> bool;
    #[doc(hidden)]
    fn is_valid<B: Backend>(device: &Device<B>, handle: Handle<Self>) -> bool;
}

impl DeviceResource for kind::Texture {
    fn add_ref<B: Backend>(device: &Device<B>, handle: Handle<Self>) -> bool {
        device.textures.lock().add_ref(handle)
    }

    fn release<B: Backend>(device: &Device<B>, handle: Handle<Self>) -> bool {
        device.release_texture(handle)
    }

    fn is_valid<B: Backend>(device: &Device<B>, handle: Handle<Self>) -> bool {
        device.textures.lock().is_valid(handle)
    }
}

impl DeviceResource for kind::Buffer {
    fn add_ref<B: Backend>(device: &Device<B>, handle: Handle<Self>) -> bool {
        device.buffers.lock().arena.add_ref(handle)
    }

    fn release<B: Backend>(device: &Device<B>, handle: Handle<Self>) -> bool {
        device.release_buffer(handle)
    }

    fn is_valid<B: Backend>(device: &Device<B>, handle: Handle<Self>) -> bool {
        device.buffers.lock().arena.is_valid(handle)
    }
}

impl DeviceResource for kind::View {
    fn add_ref<B: Backend>(device: &Device<B>, handle: Handle<Self>) -> bool {
        device.views.lock().arena.add_ref(handle)
    }

    fn release<B: Backend>(device: &Device<B>, handle: Handle<Self>) -> bool {
        device.release_view(handle)
    }

    fn is_valid<B: Backend>(device: &Device<B>, handle: Handle<Self>) -> bool {
        device.views.lock().arena.is_valid(handle)
    }
}

/// Handle-based resource lifetime management over one backend.
pub struct Device<B: Backend> {
    backend: B,
    config: DeviceConfig,
    counters: CompletionCounters,
    textures: Mutex<HandleArena<TextureRecord<B>, kind::Texture>>,
    buffers: Mutex<BufferRegistry<B>>,
    views: Mutex<ViewRegistry<B>>,
    transient: Mutex<TransientAllocator<B>>,
    retirement: Mutex<RetirementQueue<Retiree<B>>>,
    queues: [Mutex<QueuePool<B>>; QueueClass::COUNT],
    frames: Mutex<VecDeque<CompletionStamp>>,
    frame: AtomicU64,
    last_upload: AtomicU64,
}

impl<B: Backend> Device<B> {
    /// Wrap a backend.
    pub fn new(backend: B, config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            backend = backend.name(),
            app = %config.app_name,
            frames_in_flight = config.frames_in_flight,
            transient_page_size = config.transient_page_size,
            persistent_page_size = config.persistent_page_size,
            dedicated_threshold = config.dedicated_threshold,
            "device created"
        );

        let min_capacity = config.min_descriptor_capacity;
        Ok(Self {
            counters: CompletionCounters::new(),
            textures: Mutex::new(HandleArena::new()),
            buffers: Mutex::new(BufferRegistry {
                arena: HandleArena::new(),
                memory: PersistentAllocator::new(
                    config.persistent_page_size,
                    config.dedicated_threshold,
                ),
            }),
            views: Mutex::new(ViewRegistry {
                arena: HandleArena::new(),
                recyclers: DescriptorClass::ALL
                    .map(|class| DescriptorTableRecycler::new(class, min_capacity)),
            }),
            transient: Mutex::new(TransientAllocator::new(config.transient_page_size)),
            retirement: Mutex::new(RetirementQueue::new()),
            queues: QueueClass::ALL.map(|class| Mutex::new(QueuePool::new(class))),
            frames: Mutex::new(VecDeque::new()),
            frame: AtomicU64::new(0),
            last_upload: AtomicU64::new(0),
            backend,
            config,
        })
    }

    /// The native backend.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Configuration the device was created with.
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Number of frames closed by [`Device::end_frame`].
    pub fn frame_index(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Last submitted counter values.
    pub fn submitted(&self) -> CompletionStamp {
        self.counters.submitted()
    }

    /// Completed counter values as of the last poll.
    pub fn completed(&self) -> CompletionStamp {
        self.counters.completed()
    }

    /// Query the backend for completed counter values.
    pub fn poll(&self) -> Result<CompletionStamp> {
        self.counters.poll(&self.backend)
    }

    // Handle creation

    /// Create a buffer without initial contents.
    ///
    /// Returns [`Handle::INVALID`] if the backend cannot provide storage.
    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        self.create_buffer_with(desc, None)
    }

    /// Create a buffer holding `data`.
    ///
    /// Device-local contents are staged and reach the buffer with the next
    /// [`Device::flush_uploads`].
    pub fn create_buffer_init<T: bytemuck::Pod>(
        &self,
        desc: &BufferDesc,
        data: &[T],
    ) -> Result<BufferHandle> {
        self.create_buffer_with(desc, Some(bytemuck::cast_slice(data)))
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn create_buffer_with(&self, desc: &BufferDesc, data: Option<&[u8]>) -> Result<BufferHandle> {
        let mut buffers = self.buffers.lock();
        let mut transient = self.transient.lock();
        let allocation = match buffers
            .memory
            .alloc(&self.backend, &mut transient, desc, data)
        {
            Ok(allocation) => allocation,
            Err(err) => return Self::creation_failed("buffer", err),
        };
        Ok(buffers.arena.create_with(BufferRecord {
            desc: *desc,
            allocation,
        }))
    }

    /// Create a texture with dedicated storage.
    ///
    /// Returns [`Handle::INVALID`] if the backend rejects it.
    pub fn create_texture(&self, desc: &TextureDesc) -> Result<TextureHandle> {
        desc.validate()?;
        let native = match self.backend.create_texture(desc) {
            Ok(native) => native,
            Err(err) => return Self::creation_failed("texture", err),
        };
        Ok(self
            .textures
            .lock()
            .create_with(TextureRecord { desc: *desc, native }))
    }

    /// Create a view of a texture or buffer.
    ///
    /// The view keeps its resource alive. Every existing descriptor table of
    /// the view's class goes stale. Returns [`Handle::INVALID`] if the
    /// resource handle is dead or the backend rejects the view.
    pub fn create_view(&self, desc: impl Into<ViewDesc>) -> Result<ViewHandle> {
        match desc.into() {
            ViewDesc::Texture(desc) => self.create_texture_view(&desc),
            ViewDesc::Buffer(desc) => self.create_buffer_view(&desc),
        }
    }

    fn create_texture_view(&self, desc: &TextureViewDesc) -> Result<ViewHandle> {
        let mut textures = self.textures.lock();
        let Some(texture) = textures.get(desc.texture) else {
            tracing::warn!(texture = ?desc.texture, "view of a dead texture");
            return Ok(ViewHandle::INVALID);
        };
        desc.validate(&texture.desc)?;
        let native = match self.backend.create_texture_view(&texture.native, desc) {
            Ok(native) => native,
            Err(err) => return Self::creation_failed("texture view", err),
        };
        if !textures.add_ref(desc.texture) {
            self.backend.destroy_view(native);
            return Err(Self::saturated("texture"));
        }
        Ok(self.insert_view(ViewDesc::Texture(*desc), native))
    }

    fn create_buffer_view(&self, desc: &BufferViewDesc) -> Result<ViewHandle> {
        let mut buffers = self.buffers.lock();
        let Some(record) = buffers.arena.get(desc.buffer) else {
            tracing::warn!(buffer = ?desc.buffer, "view of a dead buffer");
            return Ok(ViewHandle::INVALID);
        };
        desc.validate(&record.desc)?;
        let allocation = record.allocation;
        let size = desc.resolved_size(record.desc.size);
        let native_buffer = buffers
            .memory
            .region_buffer(allocation.region())
            .ok_or_else(|| GpuError::InvalidState("buffer without a backing region".into()))?;
        let native = match self.backend.create_buffer_view(
            native_buffer,
            allocation.offset() + desc.offset,
            size,
            desc,
        ) {
            Ok(native) => native,
            Err(err) => return Self::creation_failed("buffer view", err),
        };
        if !buffers.arena.add_ref(desc.buffer) {
            self.backend.destroy_view(native);
            return Err(Self::saturated("buffer"));
        }
        Ok(self.insert_view(ViewDesc::Buffer(*desc), native))
    }

    fn insert_view(&self, desc: ViewDesc, native: B::View) -> ViewHandle {
        let mut views = self.views.lock();
        // read under the lock so no submit can slip a table in between
        let submitted = self.counters.submitted();
        let handle = views.arena.create_with(ViewRecord { desc, native });
        views
            .recycler(desc.descriptor_class())
            .heap_changed(&self.backend, submitted);
        handle
    }

    fn saturated(what: &str) -> GpuError {
        strata_core::Error::InvalidArgument(format!("{what} reference count is saturated")).into()
    }

    fn creation_failed<K: ResourceKind>(what: &str, err: GpuError) -> Result<Handle<K>> {
        if err.is_device_lost() {
            return Err(err);
        }
        if matches!(err, GpuError::Core(_)) {
            return Err(err);
        }
        tracing::warn!(error = %err, "{what} creation failed");
        Ok(Handle::INVALID)
    }

    // Refcounting

    /// Add a reference. Returns false for dead handles.
    pub fn add_ref<K: DeviceResource>(&self, handle: Handle<K>) -> bool {
        K::add_ref(self, handle)
    }

    /// Drop a reference. On the last one the resource is retired and
    /// destroyed once every queue has passed the current submissions.
    ///
    /// Returns true if this call retired the resource. Dead handles are ignored.
    pub fn release<K: DeviceResource>(&self, handle: Handle<K>) -> bool {
        K::release(self, handle)
    }

    /// Returns true if the handle refers to a live resource.
    pub fn is_valid<K: DeviceResource>(&self, handle: Handle<K>) -> bool {
        K::is_valid(self, handle)
    }

    fn retire(&self, item: Retiree<B>) {
        let stamp = self.counters.submitted();
        self.retirement.lock().retire(item, stamp);
    }

    fn release_texture(&self, handle: TextureHandle) -> bool {
        let Some(record) = self.textures.lock().release(handle) else {
            return false;
        };
        tracing::trace!(texture = ?handle, "texture retired");
        self.retire(Retiree::Texture(record.native));
        true
    }

    fn release_buffer(&self, handle: BufferHandle) -> bool {
        let allocation = {
            let mut buffers = self.buffers.lock();
            let Some(record) = buffers.arena.release(handle) else {
                return false;
            };
            buffers.memory.cancel_uploads(&record.allocation);
            record.allocation
        };
        tracing::trace!(buffer = ?handle, "buffer retired");
        self.retire(Retiree::Allocation(allocation));
        true
    }

    fn release_view(&self, handle: ViewHandle) -> bool {
        let record = {
            let mut views = self.views.lock();
            let Some(record) = views.arena.release(handle) else {
                return false;
            };
            let submitted = self.counters.submitted();
            views
                .recycler(record.desc.descriptor_class())
                .heap_changed(&self.backend, submitted);
            record
        };
        self.retire(Retiree::View(record.native));
        match record.desc {
            ViewDesc::Texture(desc) => {
                self.release_texture(desc.texture);
            }
            ViewDesc::Buffer(desc) => {
                self.release_buffer(desc.buffer);
            }
        }
        true
    }

    // Lookups

    /// Description of a live buffer.
    pub fn buffer_desc(&self, handle: BufferHandle) -> Option<BufferDesc> {
        self.buffers.lock().arena.get(handle).map(|r| r.desc)
    }

    /// Placement of a live buffer.
    pub fn buffer_allocation(&self, handle: BufferHandle) -> Option<BufferAllocation> {
        self.buffers.lock().arena.get(handle).map(|r| r.allocation)
    }

    /// Description of a live texture.
    pub fn texture_desc(&self, handle: TextureHandle) -> Option<TextureDesc> {
        self.textures.lock().get(handle).map(|r| r.desc)
    }

    /// Description of a live view.
    pub fn view_desc(&self, handle: ViewHandle) -> Option<ViewDesc> {
        self.views.lock().arena.get(handle).map(|r| r.desc)
    }

    /// Run `f` on the native view behind `handle` while the view registry is locked.
    pub fn with_view<R>(&self, handle: ViewHandle, f: impl FnOnce(&B::View) -> R) -> Option<R> {
        self.views.lock().arena.get(handle).map(|r| f(&r.native))
    }

    /// Run `f` on the native buffer backing `handle` and the buffer's offset in it.
    pub fn with_buffer<R>(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(&B::Buffer, u64) -> R,
    ) -> Option<R> {
        let buffers = self.buffers.lock();
        let allocation = buffers.arena.get(handle)?.allocation;
        let native = buffers.memory.region_buffer(allocation.region())?;
        Some(f(native, allocation.offset()))
    }

    /// Run `f` on the native texture behind `handle`.
    pub fn with_texture<R>(
        &self,
        handle: TextureHandle,
        f: impl FnOnce(&B::Texture) -> R,
    ) -> Option<R> {
        self.textures.lock().get(handle).map(|r| f(&r.native))
    }

    // Frames

    /// Start a frame: poll the queues and reclaim everything they have passed.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(&self) -> Result<CompletionStamp> {
        let completed = self.counters.poll(&self.backend)?;
        self.reclaim(&completed);
        Ok(completed)
    }

    /// Close a frame: flush staged uploads and stamp the frame's transient
    /// pages with everything submitted so far.
    ///
    /// Returns the index of the closed frame.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn end_frame(&self) -> Result<u64> {
        self.flush_uploads()?;
        let stamp = self.counters.submitted();
        let closed = self.transient.lock().reset(stamp);

        let mut frames = self.frames.lock();
        frames.push_back(stamp);
        while frames.len() > self.config.frames_in_flight as usize {
            frames.pop_front();
        }
        self.frame.fetch_add(1, Ordering::AcqRel);
        Ok(closed)
    }

    /// Block until fewer than `frames_in_flight` closed frames are still
    /// executing.
    pub fn wait_for_frame_slot(&self) -> Result<()> {
        let oldest = {
            let frames = self.frames.lock();
            if frames.len() < self.config.frames_in_flight as usize {
                return Ok(());
            }
            match frames.front() {
                Some(stamp) => *stamp,
                None => return Ok(()),
            }
        };
        self.wait_for(&oldest)?;
        Ok(())
    }

    /// Block until every class in `stamp` has completed.
    pub fn wait_for(&self, stamp: &CompletionStamp) -> Result<CompletionStamp> {
        for class in QueueClass::ALL {
            let value = stamp.get(class);
            if value > 0 {
                self.backend.wait(class, value)?;
            }
        }
        self.counters.poll(&self.backend)
    }

    fn reclaim(&self, completed: &CompletionStamp) -> usize {
        self.transient.lock().reclaim(completed);
        {
            let mut views = self.views.lock();
            for recycler in &mut views.recyclers {
                recycler.begin_frame(&self.backend, completed);
            }
        }
        let ready = self.retirement.lock().drain_passed(completed);
        let count = ready.len();
        if count > 0 {
            tracing::debug!(count, "reclaimed retired resources");
        }
        self.destroy_retired(ready);
        for pool in &self.queues {
            pool.lock().reclaim(completed);
        }
        count
    }

    fn destroy_retired(&self, items: Vec<Retiree<B>>) {
        for item in items {
            match item {
                Retiree::Texture(native) => self.backend.destroy_texture(native),
                Retiree::View(native) => self.backend.destroy_view(native),
                Retiree::Allocation(allocation) => {
                    self.buffers.lock().memory.free(&self.backend, allocation);
                }
            }
        }
    }

    /// Reclaim retired resources.
    ///
    /// With `flush`, first waits for everything submitted so far on every
    /// queue, so the retirement queue drains completely. Returns the number
    /// of items reclaimed.
    pub fn process_pending(&self, flush: bool) -> Result<usize> {
        let completed = if flush {
            self.counters.wait_all(&self.backend)?
        } else {
            self.counters.poll(&self.backend)?
        };
        Ok(self.reclaim(&completed))
    }

    /// Wait for every queue and reclaim everything retired.
    pub fn wait_idle(&self) -> Result<()> {
        self.process_pending(true).map(|_| ())
    }

    // Descriptor tables

    /// Get a descriptor table matching the live views of `class`.
    ///
    /// The table may be empty if the backend could not create one.
    pub fn acquire_descriptor_table(&self, class: DescriptorClass) -> Result<DescriptorTable<B>> {
        let mut views = self.views.lock();
        let ViewRegistry { arena, recyclers } = &mut *views;
        recyclers[class.index()].acquire(&self.backend, arena)
    }

    /// Hand back a table used by work that completes at `stamp`.
    pub fn submit_descriptor_table(&self, table: DescriptorTable<B>, stamp: CompletionStamp) {
        self.views.lock().recycler(table.class()).submit(table, stamp);
    }

    /// Hand back a table that no submitted work references.
    pub fn recycle_descriptor_table(&self, table: DescriptorTable<B>) {
        self.views
            .lock()
            .recycler(table.class())
            .recycle(&self.backend, table);
    }

    // Transient memory

    /// Reserve transient upload memory valid until the frame's work completes.
    ///
    /// # Panics
    /// Panics if `size` exceeds the transient page size.
    pub fn allocate_transient(&self, size: u64, alignment: u64) -> Result<TransientAllocation> {
        self.transient
            .lock()
            .allocate(&self.backend, size, alignment)
    }

    /// Fill a span returned by [`Self::allocate_transient`].
    ///
    /// Fails once the span's frame has been closed by [`Self::end_frame`].
    pub fn write_transient(&self, span: &TransientAllocation, data: &[u8]) -> Result<()> {
        self.transient.lock().write(span, data)
    }

    // Submission

    /// Record every staged upload into one copy-queue submission.
    ///
    /// Returns the copy queue value that signals their completion, or `None`
    /// if nothing was staged. Later graphics and compute submissions wait on it.
    /// On failure the uploads stay queued for the next flush.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn flush_uploads(&self) -> Result<Option<u64>> {
        let mut buffers = self.buffers.lock();
        let uploads = buffers.memory.take_uploads();
        if uploads.is_empty() {
            return Ok(None);
        }
        let submitted = self.submit_uploads(&buffers.memory, &uploads);
        match submitted {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::warn!(
                    copies = uploads.len(),
                    error = %err,
                    "upload flush failed; keeping uploads queued"
                );
                buffers.memory.restore_uploads(uploads);
                Err(err)
            }
        }
    }

    fn submit_uploads(
        &self,
        memory: &PersistentAllocator<B>,
        uploads: &[UploadRequest],
    ) -> Result<u64> {
        let transient = self.transient.lock();
        let mut pool = self.queues[QueueClass::Copy.index()].lock();

        let completed = self.counters.completed();
        let mut allocator = pool.acquire(&self.backend, &completed)?;
        if let Err(err) = self.backend.begin_commands(&mut allocator) {
            pool.release_unused(allocator);
            return Err(err);
        }
        let mut bytes = 0;
        for upload in uploads {
            let (Some(src), Some(dst)) = (
                transient.page_buffer(upload.staging_page),
                memory.region_buffer(upload.dst_region),
            ) else {
                tracing::warn!(?upload, "dropping upload with a missing endpoint");
                continue;
            };
            self.backend.record_copy(
                &mut allocator,
                &BufferCopy {
                    src,
                    src_offset: upload.staging_offset,
                    dst,
                    dst_offset: upload.dst_offset,
                    size: upload.size,
                },
            );
            bytes += upload.size;
        }

        let value = self.counters.next_value(QueueClass::Copy);
        if let Err(err) = self
            .backend
            .submit(QueueClass::Copy, &mut allocator, &[], value)
        {
            pool.release_unused(allocator);
            return Err(err);
        }
        self.counters.mark_submitted(QueueClass::Copy, value);
        pool.release_submitted(allocator, CompletionStamp::only(QueueClass::Copy, value));
        self.last_upload.fetch_max(value, Ordering::AcqRel);

        tracing::debug!(copies = uploads.len(), bytes, value, "flushed uploads");
        Ok(value)
    }

    /// Start recording commands for `class`.
    pub fn begin_commands(&self, class: QueueClass) -> Result<CommandList<B>> {
        let mut pool = self.queues[class.index()].lock();
        let completed = self.counters.completed();
        let mut allocator = pool.acquire(&self.backend, &completed)?;
        if let Err(err) = self.backend.begin_commands(&mut allocator) {
            pool.release_unused(allocator);
            return Err(err);
        }
        Ok(CommandList::new(class, allocator))
    }

    /// Record a copy between two live buffers.
    pub fn copy_buffer(
        &self,
        list: &mut CommandList<B>,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let buffers = self.buffers.lock();
        let (Some(src_record), Some(dst_record)) =
            (buffers.arena.get(src), buffers.arena.get(dst))
        else {
            return Err(strata_core::Error::InvalidHandle.into());
        };
        if src_offset + size > src_record.desc.size || dst_offset + size > dst_record.desc.size {
            return Err(strata_core::Error::OutOfBounds(format!(
                "copy of {size} bytes from {src_offset} to {dst_offset}"
            ))
            .into());
        }
        let (src_alloc, dst_alloc) = (src_record.allocation, dst_record.allocation);
        let (Some(src_native), Some(dst_native)) = (
            buffers.memory.region_buffer(src_alloc.region()),
            buffers.memory.region_buffer(dst_alloc.region()),
        ) else {
            return Err(GpuError::InvalidState("buffer without a backing region".into()));
        };
        self.backend.record_copy(
            list.native_mut(),
            &BufferCopy {
                src: src_native,
                src_offset: src_alloc.offset() + src_offset,
                dst: dst_native,
                dst_offset: dst_alloc.offset() + dst_offset,
                size,
            },
        );
        Ok(())
    }

    /// Submit a command list. Returns the value its queue signals on completion.
    ///
    /// Attached descriptor tables and the command allocator are recycled once
    /// that value has passed.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&self, list: CommandList<B>) -> Result<u64> {
        let class = list.class();
        let CommandList {
            mut allocator,
            tables,
            mut waits,
            ..
        } = list;

        let last_upload = self.last_upload.load(Ordering::Acquire);
        if class != QueueClass::Copy && last_upload > self.counters.completed().copy {
            waits.push((QueueClass::Copy, last_upload));
        }

        let value = {
            let mut pool = self.queues[class.index()].lock();
            let value = self.counters.next_value(class);
            if let Err(err) = self.backend.submit(class, &mut allocator, &waits, value) {
                pool.release_unused(allocator);
                drop(pool);
                for table in tables {
                    self.recycle_descriptor_table(table);
                }
                return Err(err);
            }
            self.counters.mark_submitted(class, value);
            pool.release_submitted(allocator, CompletionStamp::only(class, value));
            value
        };

        if !tables.is_empty() {
            let stamp = CompletionStamp::only(class, value);
            let mut views = self.views.lock();
            for table in tables {
                views.recycler(table.class()).submit(table, stamp);
            }
        }
        tracing::trace!(queue = class.name(), value, "submitted");
        Ok(value)
    }

    /// Submit a command list and block until it has executed.
    pub fn execute_and_stall(&self, list: CommandList<B>) -> Result<u64> {
        let class = list.class();
        let value = self.submit(list)?;
        self.backend.wait(class, value)?;
        self.counters.poll(&self.backend)?;
        Ok(value)
    }

    /// Throw away a command list without submitting it.
    pub fn discard(&self, list: CommandList<B>) {
        let class = list.class();
        let CommandList {
            allocator, tables, ..
        } = list;
        self.queues[class.index()].lock().release_unused(allocator);
        for table in tables {
            self.recycle_descriptor_table(table);
        }
    }

    /// Signal the next value on `class` without submitting work.
    pub fn signal_queue(&self, class: QueueClass) -> Result<u64> {
        let _pool = self.queues[class.index()].lock();
        let value = self.counters.next_value(class);
        self.backend.signal(class, value)?;
        self.counters.mark_submitted(class, value);
        Ok(value)
    }

    // Introspection

    /// Current bookkeeping figures.
    pub fn stats(&self) -> DeviceStats {
        let textures = self.textures.lock().len();
        let (buffers, persistent) = {
            let buffers = self.buffers.lock();
            (buffers.arena.len(), buffers.memory.stats())
        };
        let (views, descriptor_tables) = {
            let views = self.views.lock();
            (views.arena.len(), views.recyclers.each_ref().map(DescriptorTableRecycler::stats))
        };
        let (transient_pages, transient_available, transient_in_flight) = {
            let transient = self.transient.lock();
            (
                transient.page_count(),
                transient.available_count(),
                transient.in_flight_page_count(),
            )
        };
        DeviceStats {
            textures,
            buffers,
            views,
            persistent,
            transient_pages,
            transient_available,
            transient_in_flight,
            pending_retirements: self.retirement.lock().len(),
            descriptor_tables,
            submitted: self.counters.submitted(),
            completed: self.counters.completed(),
        }
    }

    fn shutdown(&mut self) {
        if let Err(err) = self.counters.wait_all(&self.backend) {
            tracing::warn!(error = %err, "device not idle at shutdown; destroying anyway");
        }

        let retired = self.retirement.get_mut().drain_all();
        self.destroy_retired(retired);

        let views = self.views.get_mut();
        for recycler in &mut views.recyclers {
            recycler.destroy(&self.backend);
        }
        for record in views.arena.drain() {
            self.backend.destroy_view(record.native);
        }

        let buffers = self.buffers.get_mut();
        let _ = buffers.arena.drain();
        buffers.memory.destroy(&self.backend);

        for record in self.textures.get_mut().drain() {
            self.backend.destroy_texture(record.native);
        }
        self.transient.get_mut().destroy(&self.backend);
        for pool in &mut self.queues {
            pool.get_mut().destroy(&self.backend);
        }
        tracing::info!(backend = self.backend.name(), "device destroyed");
    }
}

impl<B: Backend> Drop for Device<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
