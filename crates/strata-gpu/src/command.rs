//! Command allocator pooling and command lists.

use strata_core::{CompletionStamp, QueueClass};

use crate::backend::Backend;
use crate::descriptor::DescriptorTable;
use crate::error::Result;
use crate::retire::RetirementQueue;

/// Command allocators for one queue class.
///
/// An allocator goes back to the idle list only after the work recorded
/// from it has completed on the GPU.
pub struct QueuePool<B: Backend> {
    class: QueueClass,
    idle: Vec<B::CommandAllocator>,
    in_flight: RetirementQueue<B::CommandAllocator>,
    created: usize,
}

impl<B: Backend> QueuePool<B> {
    /// Create an empty pool.
    pub const fn new(class: QueueClass) -> Self {
        Self {
            class,
            idle: Vec::new(),
            in_flight: RetirementQueue::new(),
            created: 0,
        }
    }

    /// Queue class served.
    pub const fn class(&self) -> QueueClass {
        self.class
    }

    /// Move allocators whose work has completed back to the idle list.
    pub fn reclaim(&mut self, completed: &CompletionStamp) -> usize {
        let ready = self.in_flight.drain_passed(completed);
        let count = ready.len();
        self.idle.extend(ready);
        count
    }

    /// Take an idle allocator or create one.
    pub fn acquire(
        &mut self,
        backend: &B,
        completed: &CompletionStamp,
    ) -> Result<B::CommandAllocator> {
        self.reclaim(completed);
        if let Some(allocator) = self.idle.pop() {
            return Ok(allocator);
        }
        let allocator = backend.create_command_allocator(self.class)?;
        self.created += 1;
        tracing::debug!(
            queue = self.class.name(),
            total = self.created,
            "created command allocator"
        );
        Ok(allocator)
    }

    /// Park an allocator until `stamp` passes.
    pub fn release_submitted(&mut self, allocator: B::CommandAllocator, stamp: CompletionStamp) {
        self.in_flight.retire(allocator, stamp);
    }

    /// Return an allocator whose commands were never submitted.
    pub fn release_unused(&mut self, allocator: B::CommandAllocator) {
        self.idle.push(allocator);
    }

    /// Allocators ever created.
    pub const fn created(&self) -> usize {
        self.created
    }

    /// Allocators waiting for the GPU.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Destroy every allocator. The queue must be idle.
    pub fn destroy(&mut self, backend: &B) {
        for allocator in self.idle.drain(..).chain(self.in_flight.drain_all()) {
            backend.destroy_command_allocator(allocator);
        }
        self.created = 0;
    }
}

/// Commands being recorded for one queue class.
///
/// Obtained from `Device::begin_commands` and consumed by `Device::submit`,
/// `Device::execute_and_stall` or `Device::discard`.
pub struct CommandList<B: Backend> {
    class: QueueClass,
    pub(crate) allocator: B::CommandAllocator,
    pub(crate) tables: Vec<DescriptorTable<B>>,
    pub(crate) waits: Vec<(QueueClass, u64)>,
}

impl<B: Backend> std::fmt::Debug for CommandList<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("class", &self.class)
            .field("tables", &self.tables)
            .field("waits", &self.waits)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> CommandList<B> {
    pub(crate) const fn new(class: QueueClass, allocator: B::CommandAllocator) -> Self {
        Self {
            class,
            allocator,
            tables: Vec::new(),
            waits: Vec::new(),
        }
    }

    /// Queue class the list will be submitted to.
    pub const fn class(&self) -> QueueClass {
        self.class
    }

    /// Attach a descriptor table. It is stamped with this list's completion
    /// value on submit and recycled once that value passes.
    pub fn use_descriptor_table(&mut self, table: DescriptorTable<B>) -> &DescriptorTable<B> {
        self.tables.push(table);
        let last = self.tables.len() - 1;
        &self.tables[last]
    }

    /// Tables attached so far.
    pub fn descriptor_tables(&self) -> &[DescriptorTable<B>] {
        &self.tables
    }

    /// Make the submission wait until `class` reaches `value`.
    pub fn wait_for(&mut self, class: QueueClass, value: u64) {
        if let Some(wait) = self.waits.iter_mut().find(|(c, _)| *c == class) {
            wait.1 = wait.1.max(value);
        } else {
            self.waits.push((class, value));
        }
    }

    /// Cross-queue waits recorded so far.
    pub fn waits(&self) -> &[(QueueClass, u64)] {
        &self.waits
    }

    /// Native command allocator for recording backend commands.
    pub fn native_mut(&mut self) -> &mut B::CommandAllocator {
        &mut self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{CompletionMode, HeadlessBackend};

    #[test]
    fn allocators_return_only_after_completion() {
        let backend = HeadlessBackend::new(CompletionMode::Manual);
        let mut pool = QueuePool::new(QueueClass::Graphics);

        let first = pool.acquire(&backend, &CompletionStamp::ZERO).unwrap();
        let id = first.id();
        pool.release_submitted(first, CompletionStamp::only(QueueClass::Graphics, 1));

        let second = pool.acquire(&backend, &CompletionStamp::ZERO).unwrap();
        assert_ne!(second.id(), id);
        pool.release_unused(second);
        assert_eq!(pool.created(), 2);

        assert_eq!(pool.reclaim(&CompletionStamp::only(QueueClass::Graphics, 1)), 1);
        assert_eq!(pool.in_flight(), 0);
        pool.destroy(&backend);
        assert_eq!(backend.live_objects().command_allocators, 0);
    }

    #[test]
    fn waits_merge_per_class() {
        let backend = HeadlessBackend::default();
        let allocator = backend.create_command_allocator(QueueClass::Compute).unwrap();
        let mut list = CommandList::<HeadlessBackend>::new(QueueClass::Compute, allocator);
        list.wait_for(QueueClass::Copy, 3);
        list.wait_for(QueueClass::Copy, 2);
        list.wait_for(QueueClass::Graphics, 1);
        assert_eq!(list.waits(), &[(QueueClass::Copy, 3), (QueueClass::Graphics, 1)]);
        assert_eq!(list.class(), QueueClass::Compute);
    }

    #[test]
    fn debug_output_shows_class_and_waits() {
        let backend = HeadlessBackend::default();
        let allocator = backend.create_command_allocator(QueueClass::Graphics).unwrap();
        let mut list = CommandList::<HeadlessBackend>::new(QueueClass::Graphics, allocator);
        list.wait_for(QueueClass::Copy, 7);
        let text = format!("{list:?}");
        assert!(text.starts_with("CommandList"));
        assert!(text.contains("Graphics"));
        assert!(text.contains("Copy, 7"));
    }
}
