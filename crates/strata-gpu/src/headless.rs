//! Software backend without a GPU.
//!
//! Buffers are plain heap allocations, descriptor tables are vectors that can
//! be read back slot by slot, and queue completion either follows every
//! signal immediately or only advances when told to. Used for tests, tools
//! and CI machines with no driver.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use strata_core::{
    BufferDesc, BufferViewDesc, DescriptorClass, QueueClass, TextureDesc, TextureViewDesc,
    ViewDesc,
};

use crate::backend::{Backend, BufferCopy};
use crate::error::{GpuError, Result};
use crate::freelist::align_up;

/// How the simulated queues complete work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionMode {
    /// Every signal completes as soon as it is issued.
    Immediate,
    /// Values only complete through [`HeadlessBackend::complete`].
    Manual,
}

struct HeadlessMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the allocation is uniquely owned and freed only on drop; concurrent
// access goes through raw copies just like mapped GPU memory.
unsafe impl Send for HeadlessMemory {}
unsafe impl Sync for HeadlessMemory {}

impl HeadlessMemory {
    fn zeroed(len: usize) -> Self {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<u8>();
        Self { ptr, len }
    }
}

impl Drop for HeadlessMemory {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a leaked Box<[u8]> of exactly this length.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

/// Heap-backed buffer.
pub struct HeadlessBuffer {
    id: u64,
    desc: BufferDesc,
    memory: Arc<HeadlessMemory>,
    gpu_address: u64,
}

impl HeadlessBuffer {
    /// Unique object id.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Description the buffer was created with.
    pub const fn desc(&self) -> &BufferDesc {
        &self.desc
    }
}

/// Texture placeholder; only its description is kept.
pub struct HeadlessTexture {
    id: u64,
    desc: TextureDesc,
}

impl HeadlessTexture {
    /// Unique object id.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Description the texture was created with.
    pub const fn desc(&self) -> &TextureDesc {
        &self.desc
    }
}

/// A view: the description plus the resource it was created on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadlessView {
    /// Unique object id.
    pub id: u64,
    /// Id of the texture or buffer viewed.
    pub resource: u64,
    /// Resolved byte offset for buffer views, 0 for textures.
    pub offset: u64,
    /// Resolved byte length for buffer views, 0 for textures.
    pub size: u64,
    /// The view description.
    pub desc: ViewDesc,
}

/// Readable descriptor table.
#[derive(Debug)]
pub struct HeadlessTable {
    id: u64,
    class: DescriptorClass,
    entries: Vec<Option<HeadlessView>>,
}

impl HeadlessTable {
    /// Unique object id.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Class the table was created for.
    pub const fn class(&self) -> DescriptorClass {
        self.class
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Descriptor written at `index`, `None` for the placeholder.
    pub fn entry(&self, index: u32) -> Option<&HeadlessView> {
        self.entries.get(index as usize).and_then(Option::as_ref)
    }

    /// Every slot in index order.
    pub fn entries(&self) -> &[Option<HeadlessView>] {
        &self.entries
    }
}

struct PendingCopy {
    src: Arc<HeadlessMemory>,
    src_offset: u64,
    dst: Arc<HeadlessMemory>,
    dst_offset: u64,
    size: u64,
}

/// Command allocator that records copies and replays them on submit.
pub struct HeadlessCommandAllocator {
    id: u64,
    class: QueueClass,
    recording: bool,
    copies: Vec<PendingCopy>,
    submissions: u64,
}

impl HeadlessCommandAllocator {
    /// Unique object id.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Queue class the allocator records for.
    pub const fn class(&self) -> QueueClass {
        self.class
    }

    /// Number of times work from this allocator was submitted.
    pub const fn submissions(&self) -> u64 {
        self.submissions
    }
}

#[derive(Default)]
struct QueueState {
    signaled: [u64; QueueClass::COUNT],
    completed: [u64; QueueClass::COUNT],
    last_waits: [Vec<(QueueClass, u64)>; QueueClass::COUNT],
}

/// Live object counts, for leak checks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub buffers: i64,
    pub textures: i64,
    pub views: i64,
    pub tables: i64,
    pub command_allocators: i64,
}

#[derive(Default)]
struct Counters {
    buffers: AtomicI64,
    textures: AtomicI64,
    views: AtomicI64,
    tables: AtomicI64,
    command_allocators: AtomicI64,
}

#[derive(Default)]
struct FailureSwitches {
    buffers: AtomicBool,
    textures: AtomicBool,
    views: AtomicBool,
    tables: AtomicBool,
    submits: AtomicBool,
}

/// Software implementation of [`Backend`].
pub struct HeadlessBackend {
    mode: Mutex<CompletionMode>,
    queues: Mutex<QueueState>,
    progress: Condvar,
    lost: AtomicBool,
    next_id: AtomicU64,
    next_address: AtomicU64,
    live: Counters,
    fail: FailureSwitches,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(CompletionMode::Immediate)
    }
}

impl HeadlessBackend {
    /// Base of the fake GPU address space.
    const ADDRESS_BASE: u64 = 0x1_0000_0000;
    /// Granularity of fake GPU addresses.
    const ADDRESS_ALIGNMENT: u64 = 0x1_0000;

    /// Create a backend with the given completion behaviour.
    pub fn new(mode: CompletionMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            queues: Mutex::new(QueueState::default()),
            progress: Condvar::new(),
            lost: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            next_address: AtomicU64::new(Self::ADDRESS_BASE),
            live: Counters::default(),
            fail: FailureSwitches::default(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_lost(&self) -> Result<()> {
        if self.lost.load(Ordering::Acquire) {
            Err(GpuError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Switch completion behaviour. Switching to `Immediate` completes
    /// everything already signalled.
    pub fn set_mode(&self, mode: CompletionMode) {
        *self.mode.lock() = mode;
        if mode == CompletionMode::Immediate {
            self.complete_all();
        }
    }

    /// Advance `class` to `value` (clamped to what has been signalled).
    pub fn complete(&self, class: QueueClass, value: u64) {
        let mut queues = self.queues.lock();
        let i = class.index();
        let target = value.min(queues.signaled[i]);
        queues.completed[i] = queues.completed[i].max(target);
        self.progress.notify_all();
    }

    /// Complete everything signalled on every queue.
    pub fn complete_all(&self) {
        let mut queues = self.queues.lock();
        for i in 0..QueueClass::COUNT {
            queues.completed[i] = queues.signaled[i];
        }
        self.progress.notify_all();
    }

    /// Highest value signalled on `class` so far.
    pub fn signaled_value(&self, class: QueueClass) -> u64 {
        self.queues.lock().signaled[class.index()]
    }

    /// Cross-queue waits passed with the last submission on `class`.
    pub fn last_waits(&self, class: QueueClass) -> Vec<(QueueClass, u64)> {
        self.queues.lock().last_waits[class.index()].clone()
    }

    /// Simulate device removal: every later queue call fails.
    pub fn lose_device(&self) {
        self.lost.store(true, Ordering::Release);
        let _queues = self.queues.lock();
        self.progress.notify_all();
    }

    /// Make buffer creation fail until switched off.
    pub fn fail_buffers(&self, fail: bool) {
        self.fail.buffers.store(fail, Ordering::Release);
    }

    /// Make texture creation fail until switched off.
    pub fn fail_textures(&self, fail: bool) {
        self.fail.textures.store(fail, Ordering::Release);
    }

    /// Make view creation fail until switched off.
    pub fn fail_views(&self, fail: bool) {
        self.fail.views.store(fail, Ordering::Release);
    }

    /// Make descriptor table creation fail until switched off.
    pub fn fail_tables(&self, fail: bool) {
        self.fail.tables.store(fail, Ordering::Release);
    }

    /// Make queue submissions fail until switched off. The device stays alive.
    pub fn fail_submits(&self, fail: bool) {
        self.fail.submits.store(fail, Ordering::Release);
    }

    /// Objects created and not yet destroyed.
    pub fn live_objects(&self) -> LiveObjects {
        LiveObjects {
            buffers: self.live.buffers.load(Ordering::Acquire),
            textures: self.live.textures.load(Ordering::Acquire),
            views: self.live.views.load(Ordering::Acquire),
            tables: self.live.tables.load(Ordering::Acquire),
            command_allocators: self.live.command_allocators.load(Ordering::Acquire),
        }
    }

    /// Copy `len` bytes out of a buffer.
    ///
    /// # Panics
    /// Panics if the range lies outside the buffer.
    pub fn read_buffer(&self, buffer: &HeadlessBuffer, offset: u64, len: usize) -> Vec<u8> {
        let start = offset as usize;
        assert!(start + len <= buffer.memory.len, "read past the end of the buffer");
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                buffer.memory.ptr.as_ptr().add(start),
                out.as_mut_ptr(),
                len,
            );
        }
        out
    }

    fn signal_locked(&self, queues: &mut QueueState, class: QueueClass, value: u64) {
        let i = class.index();
        queues.signaled[i] = queues.signaled[i].max(value);
        if *self.mode.lock() == CompletionMode::Immediate {
            queues.completed[i] = queues.completed[i].max(value);
        }
        self.progress.notify_all();
    }
}

impl Backend for HeadlessBackend {
    type Buffer = HeadlessBuffer;
    type Texture = HeadlessTexture;
    type View = HeadlessView;
    type Table = HeadlessTable;
    type CommandAllocator = HeadlessCommandAllocator;

    fn name(&self) -> &'static str {
        "headless"
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<HeadlessBuffer> {
        self.check_lost()?;
        if self.fail.buffers.load(Ordering::Acquire) {
            return Err(GpuError::AllocationFailed(format!(
                "injected failure for {}-byte buffer",
                desc.size
            )));
        }
        let len = usize::try_from(desc.size)
            .map_err(|_| GpuError::AllocationFailed(format!("{} bytes", desc.size)))?;
        let span = align_up(desc.size.max(1), Self::ADDRESS_ALIGNMENT);
        let gpu_address = self.next_address.fetch_add(span, Ordering::Relaxed);
        self.live.buffers.fetch_add(1, Ordering::AcqRel);
        Ok(HeadlessBuffer {
            id: self.next_id(),
            desc: *desc,
            memory: Arc::new(HeadlessMemory::zeroed(len)),
            gpu_address,
        })
    }

    fn destroy_buffer(&self, _buffer: HeadlessBuffer) {
        self.live.buffers.fetch_sub(1, Ordering::AcqRel);
    }

    fn buffer_mapped_ptr(&self, buffer: &HeadlessBuffer) -> Option<NonNull<u8>> {
        buffer
            .desc
            .domain
            .is_host_visible()
            .then_some(buffer.memory.ptr)
    }

    fn buffer_gpu_address(&self, buffer: &HeadlessBuffer) -> u64 {
        buffer.gpu_address
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<HeadlessTexture> {
        self.check_lost()?;
        if self.fail.textures.load(Ordering::Acquire) {
            return Err(GpuError::AllocationFailed(format!(
                "injected failure for {}x{} texture",
                desc.width, desc.height
            )));
        }
        self.live.textures.fetch_add(1, Ordering::AcqRel);
        Ok(HeadlessTexture {
            id: self.next_id(),
            desc: *desc,
        })
    }

    fn destroy_texture(&self, _texture: HeadlessTexture) {
        self.live.textures.fetch_sub(1, Ordering::AcqRel);
    }

    fn create_texture_view(
        &self,
        texture: &HeadlessTexture,
        desc: &TextureViewDesc,
    ) -> Result<HeadlessView> {
        self.check_lost()?;
        if self.fail.views.load(Ordering::Acquire) {
            return Err(GpuError::CreationFailed("injected view failure".to_string()));
        }
        self.live.views.fetch_add(1, Ordering::AcqRel);
        Ok(HeadlessView {
            id: self.next_id(),
            resource: texture.id,
            offset: 0,
            size: 0,
            desc: ViewDesc::Texture(*desc),
        })
    }

    fn create_buffer_view(
        &self,
        buffer: &HeadlessBuffer,
        offset: u64,
        size: u64,
        desc: &BufferViewDesc,
    ) -> Result<HeadlessView> {
        self.check_lost()?;
        if self.fail.views.load(Ordering::Acquire) {
            return Err(GpuError::CreationFailed("injected view failure".to_string()));
        }
        if offset + size > buffer.desc.size {
            return Err(GpuError::CreationFailed(format!(
                "view {offset}+{size} outside a {}-byte buffer",
                buffer.desc.size
            )));
        }
        self.live.views.fetch_add(1, Ordering::AcqRel);
        Ok(HeadlessView {
            id: self.next_id(),
            resource: buffer.id,
            offset,
            size,
            desc: ViewDesc::Buffer(*desc),
        })
    }

    fn destroy_view(&self, _view: HeadlessView) {
        self.live.views.fetch_sub(1, Ordering::AcqRel);
    }

    fn create_descriptor_table(
        &self,
        class: DescriptorClass,
        capacity: u32,
    ) -> Result<HeadlessTable> {
        self.check_lost()?;
        if self.fail.tables.load(Ordering::Acquire) {
            return Err(GpuError::CreationFailed(
                "injected descriptor table failure".to_string(),
            ));
        }
        self.live.tables.fetch_add(1, Ordering::AcqRel);
        Ok(HeadlessTable {
            id: self.next_id(),
            class,
            entries: vec![None; capacity as usize],
        })
    }

    fn write_descriptor(&self, table: &mut HeadlessTable, index: u32, view: Option<&HeadlessView>) {
        if let Some(slot) = table.entries.get_mut(index as usize) {
            *slot = view.copied();
        }
    }

    fn destroy_descriptor_table(&self, _table: HeadlessTable) {
        self.live.tables.fetch_sub(1, Ordering::AcqRel);
    }

    fn completed_value(&self, class: QueueClass) -> Result<u64> {
        self.check_lost()?;
        Ok(self.queues.lock().completed[class.index()])
    }

    fn signal(&self, class: QueueClass, value: u64) -> Result<()> {
        self.check_lost()?;
        let mut queues = self.queues.lock();
        self.signal_locked(&mut queues, class, value);
        Ok(())
    }

    fn wait(&self, class: QueueClass, value: u64) -> Result<()> {
        let mut queues = self.queues.lock();
        loop {
            self.check_lost()?;
            if queues.completed[class.index()] >= value {
                return Ok(());
            }
            self.progress.wait(&mut queues);
        }
    }

    fn create_command_allocator(&self, class: QueueClass) -> Result<HeadlessCommandAllocator> {
        self.check_lost()?;
        self.live.command_allocators.fetch_add(1, Ordering::AcqRel);
        Ok(HeadlessCommandAllocator {
            id: self.next_id(),
            class,
            recording: false,
            copies: Vec::new(),
            submissions: 0,
        })
    }

    fn begin_commands(&self, allocator: &mut HeadlessCommandAllocator) -> Result<()> {
        self.check_lost()?;
        allocator.copies.clear();
        allocator.recording = true;
        Ok(())
    }

    fn record_copy(
        &self,
        allocator: &mut HeadlessCommandAllocator,
        copy: &BufferCopy<'_, Self>,
    ) {
        debug_assert!(allocator.recording, "copy recorded outside begin/submit");
        allocator.copies.push(PendingCopy {
            src: copy.src.memory.clone(),
            src_offset: copy.src_offset,
            dst: copy.dst.memory.clone(),
            dst_offset: copy.dst_offset,
            size: copy.size,
        });
    }

    fn submit(
        &self,
        class: QueueClass,
        allocator: &mut HeadlessCommandAllocator,
        waits: &[(QueueClass, u64)],
        signal_value: u64,
    ) -> Result<()> {
        self.check_lost()?;
        if self.fail.submits.load(Ordering::Acquire) {
            allocator.copies.clear();
            allocator.recording = false;
            return Err(GpuError::Other("injected submit failure".to_string()));
        }
        if !allocator.recording {
            return Err(GpuError::InvalidState(
                "submitting an allocator that is not recording".to_string(),
            ));
        }
        for copy in allocator.copies.drain(..) {
            let size = copy.size as usize;
            if copy.src_offset as usize + size > copy.src.len
                || copy.dst_offset as usize + size > copy.dst.len
            {
                return Err(GpuError::InvalidState("copy out of bounds".to_string()));
            }
            // SAFETY: ranges were bounds checked; `copy` tolerates overlap.
            unsafe {
                std::ptr::copy(
                    copy.src.ptr.as_ptr().add(copy.src_offset as usize),
                    copy.dst.ptr.as_ptr().add(copy.dst_offset as usize),
                    size,
                );
            }
        }
        allocator.recording = false;
        allocator.submissions += 1;

        let mut queues = self.queues.lock();
        queues.last_waits[class.index()] = waits.to_vec();
        self.signal_locked(&mut queues, class, signal_value);
        Ok(())
    }

    fn destroy_command_allocator(&self, _allocator: HeadlessCommandAllocator) {
        self.live.command_allocators.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{BufferUsage, MemoryDomain};

    #[test]
    fn immediate_mode_completes_on_signal() {
        let backend = HeadlessBackend::new(CompletionMode::Immediate);
        backend.signal(QueueClass::Copy, 2).unwrap();
        assert_eq!(backend.completed_value(QueueClass::Copy).unwrap(), 2);
        backend.wait(QueueClass::Copy, 2).unwrap();
    }

    #[test]
    fn manual_mode_waits_for_completion() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        backend.signal(QueueClass::Graphics, 5).unwrap();
        assert_eq!(backend.completed_value(QueueClass::Graphics).unwrap(), 0);
        backend.complete(QueueClass::Graphics, 9);
        assert_eq!(backend.completed_value(QueueClass::Graphics).unwrap(), 5);
    }

    #[test]
    fn lost_device_fails_queue_calls() {
        let backend = HeadlessBackend::default();
        backend.lose_device();
        assert!(backend.completed_value(QueueClass::Compute).unwrap_err().is_device_lost());
        assert!(backend.wait(QueueClass::Compute, 1).unwrap_err().is_device_lost());
    }

    #[test]
    fn copies_execute_on_submit() {
        let backend = HeadlessBackend::default();
        let upload = BufferDesc::new(64, BufferUsage::COPY_SRC).with_domain(MemoryDomain::Upload);
        let src = backend.create_buffer(&upload).unwrap();
        let dst = backend
            .create_buffer(&BufferDesc::new(64, BufferUsage::COPY_DST))
            .unwrap();
        assert!(backend.buffer_mapped_ptr(&dst).is_none());

        let ptr = backend.buffer_mapped_ptr(&src).unwrap();
        unsafe { std::ptr::copy_nonoverlapping([7u8, 8, 9].as_ptr(), ptr.as_ptr(), 3) };

        let mut cmd = backend.create_command_allocator(QueueClass::Copy).unwrap();
        backend.begin_commands(&mut cmd).unwrap();
        backend.record_copy(
            &mut cmd,
            &BufferCopy {
                src: &src,
                src_offset: 0,
                dst: &dst,
                dst_offset: 10,
                size: 3,
            },
        );
        backend.submit(QueueClass::Copy, &mut cmd, &[], 1).unwrap();
        assert_eq!(backend.read_buffer(&dst, 10, 3), vec![7, 8, 9]);
        assert_eq!(cmd.submissions(), 1);

        backend.destroy_command_allocator(cmd);
        backend.destroy_buffer(src);
        backend.destroy_buffer(dst);
        assert_eq!(backend.live_objects(), LiveObjects::default());
    }
}
