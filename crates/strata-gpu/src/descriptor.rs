//! Descriptor table snapshots and their recycling.
//!
//! A table is a fully populated copy of every live view of one descriptor
//! class, indexed by the view handle's slot index. Any view creation or
//! destruction makes every existing table stale: free tables are dropped at
//! once, tables the GPU may still read are parked until their stamps pass,
//! and the next acquire rebuilds from the live view set.

use strata_core::{kind, CompletionStamp, DescriptorClass, HandleArena, ViewDesc};

use crate::backend::Backend;
use crate::error::Result;
use crate::retire::RetirementQueue;

/// A live view: its description plus the native object.
pub struct ViewRecord<B: Backend> {
    /// Description the view was created from.
    pub desc: ViewDesc,
    /// Native view.
    pub native: B::View,
}

/// State of one descriptor class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableState {
    /// Free tables match the live view set.
    Clean,
    /// A view changed since the last rebuild.
    Dirty,
    /// A rebuild is in progress.
    Rebuilding,
}

/// A descriptor table snapshot handed out by [`DescriptorTableRecycler::acquire`].
pub struct DescriptorTable<B: Backend> {
    class: DescriptorClass,
    generation: u64,
    native: Option<B::Table>,
    len: u32,
    capacity: u32,
}

impl<B: Backend> std::fmt::Debug for DescriptorTable<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorTable")
            .field("class", &self.class)
            .field("generation", &self.generation)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("empty", &self.native.is_none())
            .finish()
    }
}

impl<B: Backend> DescriptorTable<B> {
    /// Placeholder returned when the native table could not be created.
    const fn empty(class: DescriptorClass, generation: u64) -> Self {
        Self {
            class,
            generation,
            native: None,
            len: 0,
            capacity: 0,
        }
    }

    /// Descriptor class.
    pub const fn class(&self) -> DescriptorClass {
        self.class
    }

    /// Heap generation the snapshot was built for.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true if no descriptors can be bound from this table.
    pub const fn is_empty(&self) -> bool {
        self.native.is_none()
    }

    /// Number of slots written from the view arena.
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// Slot capacity of the native table.
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Native table, `None` for an empty snapshot.
    pub const fn native(&self) -> Option<&B::Table> {
        self.native.as_ref()
    }
}

/// Recycler statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecyclerStats {
    /// Tables built from scratch.
    pub rebuilds: u64,
    /// Current tables ready for reuse.
    pub free: usize,
    /// Tables the GPU may still be reading.
    pub in_flight: usize,
    /// Stale tables waiting to be destroyed.
    pub pending_destroy: usize,
}

/// Pool of descriptor table snapshots for one descriptor class.
pub struct DescriptorTableRecycler<B: Backend> {
    class: DescriptorClass,
    min_capacity: u32,
    state: TableState,
    generation: u64,
    free: Vec<DescriptorTable<B>>,
    in_flight: RetirementQueue<DescriptorTable<B>>,
    pending_destroy: RetirementQueue<DescriptorTable<B>>,
    rebuilds: u64,
}

impl<B: Backend> DescriptorTableRecycler<B> {
    /// Create a recycler for `class`. Tables hold at least `min_capacity` slots.
    pub fn new(class: DescriptorClass, min_capacity: u32) -> Self {
        Self {
            class,
            min_capacity: min_capacity.max(1),
            state: TableState::Dirty,
            generation: 0,
            free: Vec::new(),
            in_flight: RetirementQueue::new(),
            pending_destroy: RetirementQueue::new(),
            rebuilds: 0,
        }
    }

    /// Descriptor class served.
    pub const fn class(&self) -> DescriptorClass {
        self.class
    }

    /// Current state.
    pub const fn state(&self) -> TableState {
        self.state
    }

    /// Current heap generation.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Mark every existing snapshot stale.
    ///
    /// Free tables are destroyed immediately. In-flight tables are parked
    /// until both their own stamp and `submitted` have passed.
    pub fn heap_changed(&mut self, backend: &B, submitted: CompletionStamp) {
        self.generation += 1;
        self.state = TableState::Dirty;
        for table in self.free.drain(..) {
            if let Some(native) = table.native {
                backend.destroy_descriptor_table(native);
            }
        }
        for retired in self.in_flight.take_all() {
            self.pending_destroy
                .retire(retired.item, retired.stamp.join(submitted));
        }
    }

    /// Get a snapshot that matches the live views in `views`.
    ///
    /// Reuses a free table when one is current, otherwise rebuilds. A failed
    /// native creation yields an empty table unless the device is lost.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn acquire(
        &mut self,
        backend: &B,
        views: &HandleArena<ViewRecord<B>, kind::View>,
    ) -> Result<DescriptorTable<B>> {
        if self.state == TableState::Clean {
            if let Some(table) = self.free.pop() {
                return Ok(table);
            }
        }
        self.rebuild(backend, views)
    }

    fn rebuild(
        &mut self,
        backend: &B,
        views: &HandleArena<ViewRecord<B>, kind::View>,
    ) -> Result<DescriptorTable<B>> {
        self.state = TableState::Rebuilding;
        let len = u32::try_from(views.slot_count()).unwrap_or(u32::MAX);
        let capacity = self.min_capacity.max(len);

        let mut native = match backend.create_descriptor_table(self.class, capacity) {
            Ok(native) => native,
            Err(err) if err.is_device_lost() => {
                self.state = TableState::Dirty;
                return Err(err);
            }
            Err(err) => {
                tracing::warn!(
                    class = ?self.class,
                    capacity,
                    error = %err,
                    "descriptor table creation failed; binding nothing this frame"
                );
                self.state = TableState::Dirty;
                return Ok(DescriptorTable::empty(self.class, self.generation));
            }
        };

        let mut written = 0u32;
        for index in 0..len {
            let view = views
                .slot(index)
                .filter(|record| record.desc.descriptor_class() == self.class)
                .map(|record| &record.native);
            if view.is_some() {
                written += 1;
            }
            backend.write_descriptor(&mut native, index, view);
        }

        self.rebuilds += 1;
        self.state = TableState::Clean;
        tracing::debug!(
            class = ?self.class,
            generation = self.generation,
            slots = len,
            live = written,
            "rebuilt descriptor table"
        );
        Ok(DescriptorTable {
            class: self.class,
            generation: self.generation,
            native: Some(native),
            len,
            capacity,
        })
    }

    /// Hand a table back after work that binds it has been submitted.
    pub fn submit(&mut self, table: DescriptorTable<B>, stamp: CompletionStamp) {
        if table.native.is_none() {
            return;
        }
        if table.generation == self.generation {
            self.in_flight.retire(table, stamp);
        } else {
            self.pending_destroy.retire(table, stamp);
        }
    }

    /// Hand back a table that was never submitted.
    pub fn recycle(&mut self, backend: &B, table: DescriptorTable<B>) {
        let Some(native) = table.native else {
            return;
        };
        if table.generation == self.generation {
            self.free.push(DescriptorTable {
                native: Some(native),
                ..table
            });
        } else {
            backend.destroy_descriptor_table(native);
        }
    }

    /// Promote finished in-flight tables to the free pool and destroy
    /// finished stale ones.
    pub fn begin_frame(&mut self, backend: &B, completed: &CompletionStamp) {
        for table in self.in_flight.drain_passed(completed) {
            if table.generation == self.generation {
                self.free.push(table);
            } else if let Some(native) = table.native {
                backend.destroy_descriptor_table(native);
            }
        }
        for table in self.pending_destroy.drain_passed(completed) {
            if let Some(native) = table.native {
                backend.destroy_descriptor_table(native);
            }
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> RecyclerStats {
        RecyclerStats {
            rebuilds: self.rebuilds,
            free: self.free.len(),
            in_flight: self.in_flight.len(),
            pending_destroy: self.pending_destroy.len(),
        }
    }

    /// Destroy every table. The device must be idle.
    pub fn destroy(&mut self, backend: &B) {
        let tables = self
            .free
            .drain(..)
            .chain(self.in_flight.drain_all())
            .chain(self.pending_destroy.drain_all());
        for table in tables {
            if let Some(native) = table.native {
                backend.destroy_descriptor_table(native);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{CompletionMode, HeadlessBackend};
    use strata_core::{
        BufferHandle, BufferViewDesc, QueueClass, TextureHandle, TextureViewDesc,
        ViewAccess, ViewHandle,
    };

    type Views = HandleArena<ViewRecord<HeadlessBackend>, kind::View>;

    fn add_view(backend: &HeadlessBackend, views: &mut Views, desc: ViewDesc) -> ViewHandle {
        let native = match desc {
            ViewDesc::Texture(t) => {
                let texture = backend
                    .create_texture(&strata_core::TextureDesc::d2(
                        4,
                        4,
                        strata_core::Format::Rgba8Unorm,
                        strata_core::TextureUsage::SAMPLED,
                    ))
                    .unwrap();
                let view = backend.create_texture_view(&texture, &t).unwrap();
                backend.destroy_texture(texture);
                view
            }
            ViewDesc::Buffer(b) => {
                let buffer = backend
                    .create_buffer(&strata_core::BufferDesc::new(
                        1024,
                        strata_core::BufferUsage::STORAGE,
                    ))
                    .unwrap();
                let view = backend.create_buffer_view(&buffer, 0, 64, &b).unwrap();
                backend.destroy_buffer(buffer);
                view
            }
        };
        views.create_with(ViewRecord { desc, native })
    }

    fn texture_view(n: u64) -> ViewDesc {
        TextureViewDesc::new(TextureHandle::from_raw(n), ViewAccess::ShaderRead).into()
    }

    fn buffer_view(n: u64) -> ViewDesc {
        BufferViewDesc::new(BufferHandle::from_raw(n), ViewAccess::ShaderReadWrite).into()
    }

    #[test]
    fn rebuilt_table_matches_live_views() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let mut views = Views::new();
        let mut recycler = DescriptorTableRecycler::new(DescriptorClass::ShaderVisible, 4);

        let mut handles = Vec::new();
        for i in 1..=12 {
            let desc = if i % 2 == 0 { texture_view(i) } else { buffer_view(i) };
            handles.push((add_view(&backend, &mut views, desc), desc));
        }
        let rt = add_view(
            &backend,
            &mut views,
            TextureViewDesc::new(TextureHandle::from_raw(99), ViewAccess::RenderTarget).into(),
        );

        let table = recycler.acquire(&backend, &views).unwrap();
        assert_eq!(recycler.state(), TableState::Clean);
        let native = table.native().unwrap();
        assert_eq!(native.capacity(), 13);
        for (handle, desc) in &handles {
            let entry = native.entry(handle.index().unwrap()).unwrap();
            assert_eq!(entry.desc, *desc);
        }
        // render targets never land in the shader-visible table
        assert!(native.entry(rt.index().unwrap()).is_none());
    }

    #[test]
    fn destroyed_view_becomes_placeholder_after_rebuild() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let mut views = Views::new();
        let mut recycler = DescriptorTableRecycler::new(DescriptorClass::ShaderVisible, 8);
        let a = add_view(&backend, &mut views, texture_view(1));
        let b = add_view(&backend, &mut views, texture_view(2));

        let first = recycler.acquire(&backend, &views).unwrap();
        recycler.recycle(&backend, first);

        let record = views.release(a).unwrap();
        backend.destroy_view(record.native);
        recycler.heap_changed(&backend, CompletionStamp::ZERO);
        assert_eq!(recycler.state(), TableState::Dirty);
        assert_eq!(recycler.stats().free, 0);

        let second = recycler.acquire(&backend, &views).unwrap();
        let native = second.native().unwrap();
        assert!(native.entry(a.index().unwrap()).is_none());
        assert!(native.entry(b.index().unwrap()).is_some());
        assert_eq!(recycler.stats().rebuilds, 2);
    }

    #[test]
    fn clean_free_table_is_reused_without_rebuild() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let views = Views::new();
        let mut recycler = DescriptorTableRecycler::new(DescriptorClass::ShaderVisible, 8);

        let table = recycler.acquire(&backend, &views).unwrap();
        let id = table.native().unwrap().id();
        recycler.submit(table, CompletionStamp::only(QueueClass::Graphics, 1));

        recycler.begin_frame(&backend, &CompletionStamp::ZERO);
        assert_eq!(recycler.stats().in_flight, 1);

        recycler.begin_frame(&backend, &CompletionStamp::only(QueueClass::Graphics, 1));
        let again = recycler.acquire(&backend, &views).unwrap();
        assert_eq!(again.native().unwrap().id(), id);
        assert_eq!(recycler.stats().rebuilds, 1);
    }

    #[test]
    fn in_flight_table_survives_heap_change_until_stamp_passes() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let views = Views::new();
        let mut recycler = DescriptorTableRecycler::new(DescriptorClass::DepthStencil, 8);

        let table = recycler.acquire(&backend, &views).unwrap();
        recycler.submit(table, CompletionStamp::only(QueueClass::Graphics, 1));
        recycler.heap_changed(&backend, CompletionStamp::new(1, 0, 3));
        assert_eq!(recycler.stats().pending_destroy, 1);
        assert_eq!(backend.live_objects().tables, 1);

        recycler.begin_frame(&backend, &CompletionStamp::new(1, 0, 2));
        assert_eq!(backend.live_objects().tables, 1);
        recycler.begin_frame(&backend, &CompletionStamp::new(1, 0, 3));
        assert_eq!(backend.live_objects().tables, 0);
    }

    #[test]
    fn parked_table_keeps_its_own_stamp() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let views = Views::new();
        let mut recycler = DescriptorTableRecycler::new(DescriptorClass::ShaderVisible, 8);

        let table = recycler.acquire(&backend, &views).unwrap();
        recycler.submit(table, CompletionStamp::only(QueueClass::Graphics, 1));
        // submitted values read before the table went in flight
        recycler.heap_changed(&backend, CompletionStamp::ZERO);

        recycler.begin_frame(&backend, &CompletionStamp::ZERO);
        assert_eq!(backend.live_objects().tables, 1);
        assert_eq!(recycler.stats().pending_destroy, 1);

        recycler.begin_frame(&backend, &CompletionStamp::only(QueueClass::Graphics, 1));
        assert_eq!(backend.live_objects().tables, 0);
    }

    #[test]
    fn stale_table_submitted_after_change_is_destroyed() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let views = Views::new();
        let mut recycler = DescriptorTableRecycler::new(DescriptorClass::ShaderVisible, 8);

        let table = recycler.acquire(&backend, &views).unwrap();
        recycler.heap_changed(&backend, CompletionStamp::ZERO);
        recycler.submit(table, CompletionStamp::only(QueueClass::Compute, 1));
        recycler.begin_frame(&backend, &CompletionStamp::only(QueueClass::Compute, 1));
        assert_eq!(recycler.stats().free, 0);
        assert_eq!(backend.live_objects().tables, 0);
    }

    #[test]
    fn creation_failure_yields_empty_table() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let views = Views::new();
        let mut recycler = DescriptorTableRecycler::new(DescriptorClass::ShaderVisible, 8);
        backend.fail_tables(true);
        let table = recycler.acquire(&backend, &views).unwrap();
        assert!(table.is_empty());
        assert_eq!(recycler.state(), TableState::Dirty);
        recycler.submit(table, CompletionStamp::ZERO);
        assert_eq!(recycler.stats().in_flight, 0);

        backend.fail_tables(false);
        backend.lose_device();
        assert!(recycler
            .acquire(&backend, &views)
            .unwrap_err()
            .is_device_lost());
    }
}
