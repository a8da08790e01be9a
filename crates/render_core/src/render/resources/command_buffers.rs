//! Command buffer management
//!
//! Command buffers are addressed through generation-checked handles. Each
//! recording thread gets its own lazily created command pool, so threads
//! never record from the same native pool. Primary buffers own a fence that
//! starts signaled; secondary buffers borrow the fence of the primary they
//! were created for.
//!
//! Destroying a buffer the GPU may still be reading does not free it: the
//! buffer is pushed onto an intrusive destroy queue and reclaimed by
//! [`CommandBufferManager::poll_destructions`] once its fence has signaled.

use crate::foundation::collections::{Handle, HandlePool};
use crate::render::api::{CommandBufferLevel, GpuBackend, Inheritance};
use crate::render::resources::error::{ResourceError, ResourceResult};

/// Marker for command buffer handles
#[derive(Debug)]
pub enum CommandBufferKind {}

/// Handle to a command buffer owned by a [`CommandBufferManager`]
pub type CommandBufferHandle = Handle<CommandBufferKind>;

/// Lifecycle state of a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    /// Allocated, nothing recorded yet
    Unrecorded,
    /// Between `begin` and `end`
    Recording,
    /// Recorded and ready to submit or execute
    Executable,
    /// Submitted, fence not yet signaled
    InFlight,
    /// Submitted and the fence has signaled
    Idle,
    /// Destroy requested while in flight; waiting for the fence
    PendingDestruction,
}

/// What `destroy` did with a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// The buffer was freed and its handle released
    Destroyed,
    /// The GPU may still use the buffer; it was queued for a later poll
    Deferred,
}

struct CommandBufferRecord<B: GpuBackend> {
    native: B::CommandBuffer,
    level: CommandBufferLevel,
    thread_index: usize,
    recording: bool,
    state: CommandBufferState,
    // Owned by primary buffers only
    fence: Option<B::Fence>,
    // Secondary buffers resolve their fence through the primary
    primary: Option<CommandBufferHandle>,
    inheritance: Option<Inheritance<B>>,
    // Linked into the destroy queue
    queued: bool,
    destroy_next: Option<CommandBufferHandle>,
}

/// Per-thread command pools plus the handle pool of command buffers
pub struct CommandBufferManager<B: GpuBackend> {
    command_pools: Vec<Option<B::CommandPool>>,
    buffers: HandlePool<CommandBufferRecord<B>, CommandBufferKind>,
    destroy_head: Option<CommandBufferHandle>,
    pending_destructions: usize,
}

impl<B: GpuBackend> CommandBufferManager<B> {
    /// Create a manager for `max_threads` recording threads
    pub fn new(max_threads: usize, growth_chunk: usize, max_slots: usize) -> Self {
        Self {
            command_pools: vec![None; max_threads],
            buffers: HandlePool::with_limits(growth_chunk, max_slots),
            destroy_head: None,
            pending_destructions: 0,
        }
    }

    fn command_pool(&mut self, backend: &B, thread_index: usize) -> ResourceResult<B::CommandPool> {
        let thread_count = self.command_pools.len();
        let slot = self.command_pools.get_mut(thread_index).ok_or_else(|| {
            ResourceError::precondition(format!(
                "thread index {thread_index} out of range ({thread_count} recording threads)"
            ))
        })?;

        if let Some(pool) = *slot {
            return Ok(pool);
        }
        let pool = backend
            .create_command_pool(thread_index)
            .map_err(ResourceError::exhausted("command pool"))?;
        log::debug!("Created command pool for thread {}", thread_index);
        *slot = Some(pool);
        Ok(pool)
    }

    /// Allocate a primary command buffer for `thread_index`
    ///
    /// The buffer gets a fresh fence created signaled, so a buffer that was
    /// never submitted counts as not in use.
    pub fn create_primary(&mut self, backend: &B, thread_index: usize) -> ResourceResult<CommandBufferHandle> {
        let pool = self.command_pool(backend, thread_index)?;
        let native = backend
            .allocate_command_buffer(pool, CommandBufferLevel::Primary)
            .map_err(ResourceError::exhausted("primary command buffer"))?;

        let fence = match backend.create_fence(true) {
            Ok(fence) => fence,
            Err(err) => {
                backend.free_command_buffer(pool, native);
                return Err(ResourceError::exhausted("command buffer fence")(err));
            }
        };

        let record = CommandBufferRecord {
            native,
            level: CommandBufferLevel::Primary,
            thread_index,
            recording: false,
            state: CommandBufferState::Unrecorded,
            fence: Some(fence),
            primary: None,
            inheritance: None,
            queued: false,
            destroy_next: None,
        };
        self.buffers.allocate(record).map_err(|err| {
            backend.destroy_fence(fence);
            backend.free_command_buffer(pool, native);
            ResourceError::from(err)
        })
    }

    /// Allocate a secondary command buffer executed by `primary`
    ///
    /// `inheritance` names the render pass and framebuffer the buffer will be
    /// recorded against; it is passed to the backend on every `begin`.
    pub fn create_secondary(
        &mut self,
        backend: &B,
        thread_index: usize,
        primary: CommandBufferHandle,
        inheritance: Inheritance<B>,
    ) -> ResourceResult<CommandBufferHandle> {
        if self.buffers.get(primary)?.level != CommandBufferLevel::Primary {
            return Err(ResourceError::precondition("secondary buffer parented to a secondary buffer"));
        }

        let pool = self.command_pool(backend, thread_index)?;
        let native = backend
            .allocate_command_buffer(pool, CommandBufferLevel::Secondary)
            .map_err(ResourceError::exhausted("secondary command buffer"))?;

        let record = CommandBufferRecord {
            native,
            level: CommandBufferLevel::Secondary,
            thread_index,
            recording: false,
            state: CommandBufferState::Unrecorded,
            fence: None,
            primary: Some(primary),
            inheritance: Some(inheritance),
            queued: false,
            destroy_next: None,
        };
        self.buffers.allocate(record).map_err(|err| {
            backend.free_command_buffer(pool, native);
            ResourceError::from(err)
        })
    }

    /// Fence guarding `handle`: its own for primaries, the primary's for secondaries
    ///
    /// `None` means nothing can still be executing the buffer, which is also
    /// the case for a secondary whose primary has already been destroyed.
    pub fn fence(&self, handle: CommandBufferHandle) -> ResourceResult<Option<B::Fence>> {
        let record = self.buffers.get(handle)?;
        Ok(self.fence_of(record))
    }

    fn fence_of(&self, record: &CommandBufferRecord<B>) -> Option<B::Fence> {
        match record.primary {
            Some(primary) => self.buffers.get(primary).ok().and_then(|p| p.fence),
            None => record.fence,
        }
    }

    fn is_signaled(backend: &B, fence: Option<B::Fence>) -> ResourceResult<bool> {
        match fence {
            Some(fence) => backend.fence_status(fence).map_err(ResourceError::fence_wait),
            None => Ok(true),
        }
    }

    fn usable(&self, backend: &B, handle: CommandBufferHandle, action: &str) -> ResourceResult<()> {
        let record = self.buffers.get(handle)?;
        if record.state == CommandBufferState::PendingDestruction {
            return Err(ResourceError::precondition(format!(
                "cannot {action} a command buffer pending destruction"
            )));
        }
        if !Self::is_signaled(backend, self.fence_of(record))? {
            return Err(ResourceError::precondition(format!(
                "cannot {action} a command buffer the GPU is still executing"
            )));
        }
        Ok(())
    }

    /// Reset the buffer and start recording
    pub fn begin(&mut self, backend: &B, handle: CommandBufferHandle) -> ResourceResult<()> {
        self.usable(backend, handle, "begin")?;
        let record = self.buffers.get_mut(handle)?;

        backend.reset_command_buffer(record.native)?;
        let inheritance = match record.level {
            CommandBufferLevel::Primary => None,
            CommandBufferLevel::Secondary => record.inheritance,
        };
        backend.begin_command_buffer(record.native, inheritance)?;

        record.recording = true;
        record.state = CommandBufferState::Recording;
        Ok(())
    }

    /// Finish recording
    pub fn end(&mut self, backend: &B, handle: CommandBufferHandle) -> ResourceResult<()> {
        let record = self.buffers.get_mut(handle)?;
        if record.queued {
            return Err(ResourceError::precondition("cannot end a command buffer pending destruction"));
        }
        if !record.recording {
            return Err(ResourceError::precondition("end called on a command buffer that is not recording"));
        }

        backend.end_command_buffer(record.native)?;
        record.recording = false;
        record.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Record execution of `secondaries` into the recording primary buffer
    pub fn execute_secondary(
        &self,
        backend: &B,
        primary: CommandBufferHandle,
        secondaries: &[CommandBufferHandle],
    ) -> ResourceResult<()> {
        let record = self.buffers.get(primary)?;
        if record.level != CommandBufferLevel::Primary || !record.recording || record.queued {
            return Err(ResourceError::precondition("secondary buffers execute only inside a recording primary"));
        }

        let mut natives = Vec::with_capacity(secondaries.len());
        for &handle in secondaries {
            let secondary = self.buffers.get(handle)?;
            if secondary.level != CommandBufferLevel::Secondary || secondary.state != CommandBufferState::Executable {
                return Err(ResourceError::precondition("only recorded secondary buffers can be executed"));
            }
            // Destruction of a secondary is gated on the fence of the primary it was created for
            if secondary.primary != Some(primary) {
                return Err(ResourceError::precondition(format!(
                    "{handle:?} was created for a different primary than {primary:?}"
                )));
            }
            natives.push(secondary.native);
        }

        backend.cmd_execute_commands(record.native, &natives);
        Ok(())
    }

    /// Submit a recorded primary buffer to the graphics queue
    pub fn submit(&mut self, backend: &B, handle: CommandBufferHandle) -> ResourceResult<()> {
        self.usable(backend, handle, "submit")?;
        let record = self.buffers.get_mut(handle)?;
        let fence = match (record.level, record.fence) {
            (CommandBufferLevel::Primary, Some(fence)) => fence,
            _ => return Err(ResourceError::precondition("only primary command buffers can be submitted")),
        };
        if record.recording {
            return Err(ResourceError::precondition("submitted a command buffer that is still recording"));
        }
        if record.state != CommandBufferState::Executable {
            return Err(ResourceError::precondition(format!(
                "submitted a command buffer in state {:?}; record it again first",
                record.state
            )));
        }

        backend.submit(record.native, fence)?;
        record.state = CommandBufferState::InFlight;
        log::trace!("Submitted {:?} from thread {}", handle, record.thread_index);
        Ok(())
    }

    /// Lifecycle state of `handle`
    pub fn status(&self, backend: &B, handle: CommandBufferHandle) -> ResourceResult<CommandBufferState> {
        let record = self.buffers.get(handle)?;
        if record.state == CommandBufferState::InFlight && Self::is_signaled(backend, self.fence_of(record))? {
            return Ok(CommandBufferState::Idle);
        }
        Ok(record.state)
    }

    /// Block until the GPU has finished with `handle`
    pub fn wait(&self, backend: &B, handle: CommandBufferHandle, timeout_ns: u64) -> ResourceResult<()> {
        match self.fence(handle)? {
            Some(fence) => backend.wait_for_fence(fence, timeout_ns).map_err(ResourceError::fence_wait),
            None => Ok(()),
        }
    }

    /// Native command buffer, for recording commands directly through the backend
    pub fn native(&self, handle: CommandBufferHandle) -> ResourceResult<B::CommandBuffer> {
        Ok(self.buffers.get(handle)?.native)
    }

    /// Level of `handle`
    pub fn level(&self, handle: CommandBufferHandle) -> ResourceResult<CommandBufferLevel> {
        Ok(self.buffers.get(handle)?.level)
    }

    /// Whether `handle` still refers to a live (possibly pending) command buffer
    pub fn contains(&self, handle: CommandBufferHandle) -> bool {
        self.buffers.contains(handle)
    }

    /// Destroy a command buffer, deferring if its fence has not signaled
    ///
    /// A deferred buffer keeps its handle until a later
    /// [`poll_destructions`](Self::poll_destructions) reclaims it.
    pub fn destroy(&mut self, backend: &B, handle: CommandBufferHandle) -> ResourceResult<DestroyOutcome> {
        let record = self.buffers.get(handle)?;
        if record.queued {
            return Ok(DestroyOutcome::Deferred);
        }

        if !Self::is_signaled(backend, self.fence_of(record))? {
            let head = self.destroy_head;
            let record = self.buffers.get_mut(handle)?;
            record.destroy_next = head;
            record.queued = true;
            record.state = CommandBufferState::PendingDestruction;
            self.destroy_head = Some(handle);
            self.pending_destructions += 1;
            log::debug!("Deferring destruction of {:?} until its fence signals", handle);
            return Ok(DestroyOutcome::Deferred);
        }

        self.destroy_now(backend, handle)?;
        Ok(DestroyOutcome::Destroyed)
    }

    fn destroy_now(&mut self, backend: &B, handle: CommandBufferHandle) -> ResourceResult<()> {
        let record = self.buffers.get_mut(handle)?;
        let pool = self
            .command_pools
            .get(record.thread_index)
            .copied()
            .flatten()
            .ok_or_else(|| ResourceError::precondition("command pool destroyed before its buffers"))?;

        if record.recording {
            backend.end_command_buffer(record.native)?;
            record.recording = false;
        }
        backend.queue_wait_idle()?;

        let record = self.buffers.free(handle)?;
        backend.free_command_buffer(pool, record.native);
        if let Some(fence) = record.fence {
            backend.destroy_fence(fence);
        }
        log::trace!("Destroyed {:?}", handle);
        Ok(())
    }

    /// Reclaim every queued buffer whose fence has signaled
    ///
    /// Walks the destroy queue once; unsignaled entries stay queued. Returns the
    /// number of buffers destroyed. Must be driven by the owner, typically once
    /// per frame.
    pub fn poll_destructions(&mut self, backend: &B) -> ResourceResult<usize> {
        let mut reclaimed = 0;
        let mut previous: Option<CommandBufferHandle> = None;
        let mut current = self.destroy_head;

        while let Some(handle) = current {
            let record = self.buffers.get(handle)?;
            let next = record.destroy_next;

            if Self::is_signaled(backend, self.fence_of(record))? {
                // A failed destruction leaves the entry queued for the next poll
                self.destroy_now(backend, handle)?;
                match previous {
                    Some(previous) => self.buffers.get_mut(previous)?.destroy_next = next,
                    None => self.destroy_head = next,
                }
                self.pending_destructions -= 1;
                reclaimed += 1;
            } else {
                previous = Some(handle);
            }
            current = next;
        }

        if reclaimed > 0 {
            log::debug!(
                "Reclaimed {} command buffers, {} still pending",
                reclaimed,
                self.pending_destructions
            );
        }
        Ok(reclaimed)
    }

    /// Number of buffers waiting in the destroy queue
    pub fn pending_destructions(&self) -> usize {
        self.pending_destructions
    }

    /// Number of live command buffers, pending ones included
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no command buffer is alive
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Destroy every per-thread command pool
    ///
    /// Every command buffer must have been destroyed first.
    pub fn destroy_all_pools(&mut self, backend: &B) -> ResourceResult<()> {
        if !self.buffers.is_empty() {
            return Err(ResourceError::precondition(format!(
                "{} command buffers still alive while destroying command pools",
                self.buffers.len()
            )));
        }

        for (thread_index, slot) in self.command_pools.iter_mut().enumerate() {
            if let Some(pool) = slot.take() {
                backend.destroy_command_pool(pool);
                log::debug!("Destroyed command pool for thread {}", thread_index);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::collections::{HandleError, MAX_HANDLE_SLOTS};
    use crate::render::api::{BackendError, InheritanceInfo};
    use crate::render::backends::headless::{
        FailurePoint, HeadlessBackend, HeadlessFramebuffer, HeadlessRenderPass,
    };

    type Manager = CommandBufferManager<HeadlessBackend>;

    fn manager() -> Manager {
        CommandBufferManager::new(4, 64, MAX_HANDLE_SLOTS)
    }

    fn target() -> Inheritance<HeadlessBackend> {
        InheritanceInfo {
            render_pass: HeadlessRenderPass(1),
            framebuffer: HeadlessFramebuffer(7),
            subpass: 0,
        }
    }

    fn recorded_and_submitted(backend: &HeadlessBackend, manager: &mut Manager) -> CommandBufferHandle {
        let primary = manager.create_primary(backend, 0).unwrap();
        manager.begin(backend, primary).unwrap();
        manager.end(backend, primary).unwrap();
        manager.submit(backend, primary).unwrap();
        primary
    }

    #[test]
    fn test_primary_fence_starts_signaled() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();

        let fence = manager.fence(primary).unwrap().unwrap();
        assert!(backend.is_signaled(fence));
        assert_eq!(manager.status(&backend, primary).unwrap(), CommandBufferState::Unrecorded);
    }

    #[test]
    fn test_command_pools_are_created_per_thread_on_demand() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        manager.create_primary(&backend, 0).unwrap();
        manager.create_primary(&backend, 0).unwrap();
        assert_eq!(backend.stats().command_pools, 1);

        manager.create_primary(&backend, 3).unwrap();
        assert_eq!(backend.stats().command_pools, 2);

        assert!(matches!(
            manager.create_primary(&backend, 4),
            Err(ResourceError::UsagePrecondition { .. })
        ));
    }

    #[test]
    fn test_lifecycle_states() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();

        manager.begin(&backend, primary).unwrap();
        assert_eq!(manager.status(&backend, primary).unwrap(), CommandBufferState::Recording);
        manager.end(&backend, primary).unwrap();
        assert_eq!(manager.status(&backend, primary).unwrap(), CommandBufferState::Executable);
        manager.submit(&backend, primary).unwrap();
        assert_eq!(manager.status(&backend, primary).unwrap(), CommandBufferState::InFlight);

        backend.complete_all();
        assert_eq!(manager.status(&backend, primary).unwrap(), CommandBufferState::Idle);
    }

    #[test]
    fn test_secondary_shares_primary_fence_and_inheritance() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();
        let secondary = manager.create_secondary(&backend, 1, primary, target()).unwrap();

        assert_eq!(manager.fence(secondary).unwrap(), manager.fence(primary).unwrap());
        assert_eq!(backend.stats().fences, 1);

        manager.begin(&backend, secondary).unwrap();
        let native = manager.native(secondary).unwrap();
        assert_eq!(backend.inheritance(native), Some(target()));

        manager.begin(&backend, primary).unwrap();
        assert_eq!(backend.inheritance(manager.native(primary).unwrap()), None);
    }

    #[test]
    fn test_secondary_cannot_parent_secondary() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();
        let secondary = manager.create_secondary(&backend, 0, primary, target()).unwrap();
        assert!(manager.create_secondary(&backend, 0, secondary, target()).is_err());
    }

    #[test]
    fn test_execute_secondary_into_primary() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();
        let secondary = manager.create_secondary(&backend, 2, primary, target()).unwrap();

        manager.begin(&backend, secondary).unwrap();
        manager.begin(&backend, primary).unwrap();
        // Still recording, not executable yet
        assert!(manager.execute_secondary(&backend, primary, &[secondary]).is_err());

        manager.end(&backend, secondary).unwrap();
        manager.execute_secondary(&backend, primary, &[secondary]).unwrap();
        assert_eq!(
            backend.executed_secondaries(manager.native(primary).unwrap()),
            vec![manager.native(secondary).unwrap()]
        );
    }

    #[test]
    fn test_submit_preconditions() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();
        let secondary = manager.create_secondary(&backend, 0, primary, target()).unwrap();

        manager.begin(&backend, primary).unwrap();
        assert!(matches!(
            manager.submit(&backend, primary),
            Err(ResourceError::UsagePrecondition { .. })
        ));

        manager.begin(&backend, secondary).unwrap();
        manager.end(&backend, secondary).unwrap();
        assert!(matches!(
            manager.submit(&backend, secondary),
            Err(ResourceError::UsagePrecondition { .. })
        ));
        assert_eq!(backend.stats().submissions, 0);
    }

    #[test]
    fn test_begin_refused_while_in_flight() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = recorded_and_submitted(&backend, &mut manager);

        assert!(matches!(
            manager.begin(&backend, primary),
            Err(ResourceError::UsagePrecondition { .. })
        ));

        backend.complete_all();
        manager.begin(&backend, primary).unwrap();
    }

    #[test]
    fn test_destroy_idle_buffer_is_immediate() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();
        let native = manager.native(primary).unwrap();

        assert_eq!(manager.destroy(&backend, primary).unwrap(), DestroyOutcome::Destroyed);
        assert!(!manager.contains(primary));
        assert!(!backend.command_buffer_exists(native));
        assert_eq!(backend.stats().fences, 0);
    }

    #[test]
    fn test_destroy_ends_recording_first() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();
        manager.begin(&backend, primary).unwrap();

        assert_eq!(manager.destroy(&backend, primary).unwrap(), DestroyOutcome::Destroyed);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_in_flight_destroy_is_deferred_until_signaled() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = recorded_and_submitted(&backend, &mut manager);
        let native = manager.native(primary).unwrap();
        let fence = manager.fence(primary).unwrap().unwrap();

        assert_eq!(manager.destroy(&backend, primary).unwrap(), DestroyOutcome::Deferred);
        assert_eq!(manager.pending_destructions(), 1);
        assert!(manager.contains(primary));
        assert!(backend.command_buffer_exists(native));
        assert_eq!(manager.status(&backend, primary).unwrap(), CommandBufferState::PendingDestruction);

        // Destroying again must not link the buffer twice
        assert_eq!(manager.destroy(&backend, primary).unwrap(), DestroyOutcome::Deferred);
        assert_eq!(manager.poll_destructions(&backend).unwrap(), 0);
        assert_eq!(manager.pending_destructions(), 1);

        backend.signal_fence(fence);
        assert_eq!(manager.poll_destructions(&backend).unwrap(), 1);
        assert_eq!(manager.pending_destructions(), 0);
        assert!(!backend.command_buffer_exists(native));
        assert!(matches!(
            manager.native(primary),
            Err(ResourceError::Handle(HandleError::StaleHandle { .. }))
        ));
    }

    #[test]
    fn test_poll_reclaims_signaled_entries_regardless_of_position() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let first = recorded_and_submitted(&backend, &mut manager);
        let second = recorded_and_submitted(&backend, &mut manager);
        let third = recorded_and_submitted(&backend, &mut manager);

        for handle in [first, second, third] {
            assert_eq!(manager.destroy(&backend, handle).unwrap(), DestroyOutcome::Deferred);
        }

        // second sits in the middle of the queue
        backend.signal_fence(manager.fence(second).unwrap().unwrap());
        assert_eq!(manager.poll_destructions(&backend).unwrap(), 1);
        assert!(!manager.contains(second));
        assert!(manager.contains(first));
        assert!(manager.contains(third));

        backend.signal_fence(manager.fence(first).unwrap().unwrap());
        backend.signal_fence(manager.fence(third).unwrap().unwrap());
        assert_eq!(manager.poll_destructions(&backend).unwrap(), 2);
        assert!(manager.is_empty());
        assert_eq!(manager.pending_destructions(), 0);
    }

    #[test]
    fn test_secondary_destruction_follows_primary_fence() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();
        let secondary = manager.create_secondary(&backend, 1, primary, target()).unwrap();

        manager.begin(&backend, secondary).unwrap();
        manager.end(&backend, secondary).unwrap();
        manager.begin(&backend, primary).unwrap();
        manager.execute_secondary(&backend, primary, &[secondary]).unwrap();
        manager.end(&backend, primary).unwrap();
        manager.submit(&backend, primary).unwrap();

        assert_eq!(manager.destroy(&backend, secondary).unwrap(), DestroyOutcome::Deferred);
        assert_eq!(manager.destroy(&backend, primary).unwrap(), DestroyOutcome::Deferred);

        backend.signal_fence(manager.fence(primary).unwrap().unwrap());
        assert_eq!(manager.poll_destructions(&backend).unwrap(), 2);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_secondary_outliving_primary_is_not_in_use() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();
        let secondary = manager.create_secondary(&backend, 0, primary, target()).unwrap();

        manager.destroy(&backend, primary).unwrap();
        assert_eq!(manager.fence(secondary).unwrap(), None);
        assert_eq!(manager.destroy(&backend, secondary).unwrap(), DestroyOutcome::Destroyed);
    }

    #[test]
    fn test_stale_handle_is_refused() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let keep = manager.create_primary(&backend, 0).unwrap();
        let primary = manager.create_primary(&backend, 0).unwrap();
        manager.destroy(&backend, primary).unwrap();

        let err = manager.destroy(&backend, primary).unwrap_err();
        assert!(err.is_handle_misuse());
        assert!(manager.begin(&backend, primary).is_err());
        assert!(manager.contains(keep));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_fence_failure_releases_command_buffer() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        backend.fail_next(FailurePoint::Fence);

        assert!(matches!(
            manager.create_primary(&backend, 0),
            Err(ResourceError::ResourceExhausted { resource: "command buffer fence", .. })
        ));
        assert_eq!(backend.stats().command_buffers, 0);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_fence_status_failure_aborts_poll() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = recorded_and_submitted(&backend, &mut manager);
        manager.destroy(&backend, primary).unwrap();

        backend.fail_next(FailurePoint::FenceStatus);
        assert!(matches!(
            manager.poll_destructions(&backend),
            Err(ResourceError::FenceWait { .. })
        ));
        assert_eq!(manager.pending_destructions(), 1);
    }

    #[test]
    fn test_handle_exhaustion_frees_native_objects() {
        let backend = HeadlessBackend::new();
        let mut manager: Manager = CommandBufferManager::new(1, 2, 2);
        manager.create_primary(&backend, 0).unwrap();
        manager.create_primary(&backend, 0).unwrap();

        assert!(matches!(
            manager.create_primary(&backend, 0),
            Err(ResourceError::Handle(HandleError::PoolExhausted { max_slots: 2 }))
        ));
        assert_eq!(backend.stats().command_buffers, 2);
        assert_eq!(backend.stats().fences, 2);
    }

    #[test]
    fn test_destroy_all_pools_requires_no_live_buffers() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();

        assert!(matches!(
            manager.destroy_all_pools(&backend),
            Err(ResourceError::UsagePrecondition { .. })
        ));
        assert_eq!(backend.stats().command_pools, 1);

        manager.destroy(&backend, primary).unwrap();
        manager.destroy_all_pools(&backend).unwrap();
        assert_eq!(backend.stats().command_pools, 0);

        // Pools come back lazily
        manager.create_primary(&backend, 0).unwrap();
        assert_eq!(backend.stats().command_pools, 1);
    }

    #[test]
    fn test_pending_buffer_refuses_recording_calls() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();
        let secondary = manager.create_secondary(&backend, 1, primary, target()).unwrap();
        manager.begin(&backend, secondary).unwrap();
        manager.begin(&backend, primary).unwrap();
        manager.end(&backend, primary).unwrap();
        manager.submit(&backend, primary).unwrap();

        assert_eq!(manager.destroy(&backend, secondary).unwrap(), DestroyOutcome::Deferred);
        for result in [
            manager.end(&backend, secondary),
            manager.begin(&backend, secondary),
        ] {
            assert!(matches!(result, Err(ResourceError::UsagePrecondition { .. })));
        }
        assert_eq!(
            manager.status(&backend, secondary).unwrap(),
            CommandBufferState::PendingDestruction
        );

        assert_eq!(manager.destroy(&backend, secondary).unwrap(), DestroyOutcome::Deferred);
        assert_eq!(manager.pending_destructions(), 1);

        backend.complete_all();
        assert_eq!(manager.poll_destructions(&backend).unwrap(), 1);
        assert_eq!(manager.poll_destructions(&backend).unwrap(), 0);
        assert_eq!(manager.pending_destructions(), 0);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_pending_primary_cannot_be_submitted_or_executed_into() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = recorded_and_submitted(&backend, &mut manager);
        assert_eq!(manager.destroy(&backend, primary).unwrap(), DestroyOutcome::Deferred);

        assert!(matches!(
            manager.submit(&backend, primary),
            Err(ResourceError::UsagePrecondition { .. })
        ));
        assert!(matches!(
            manager.execute_secondary(&backend, primary, &[]),
            Err(ResourceError::UsagePrecondition { .. })
        ));
        assert_eq!(backend.stats().submissions, 1);
    }

    #[test]
    fn test_submit_requires_fresh_recording() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();

        assert!(matches!(
            manager.submit(&backend, primary),
            Err(ResourceError::UsagePrecondition { .. })
        ));

        manager.begin(&backend, primary).unwrap();
        manager.end(&backend, primary).unwrap();
        manager.submit(&backend, primary).unwrap();
        backend.complete_all();
        assert!(matches!(
            manager.submit(&backend, primary),
            Err(ResourceError::UsagePrecondition { .. })
        ));
        assert_eq!(backend.stats().submissions, 1);

        manager.begin(&backend, primary).unwrap();
        manager.end(&backend, primary).unwrap();
        manager.submit(&backend, primary).unwrap();
        assert_eq!(backend.stats().submissions, 2);
    }

    #[test]
    fn test_execute_secondary_requires_its_own_primary() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let owner = manager.create_primary(&backend, 0).unwrap();
        let other = manager.create_primary(&backend, 0).unwrap();
        let secondary = manager.create_secondary(&backend, 1, owner, target()).unwrap();

        manager.begin(&backend, secondary).unwrap();
        manager.end(&backend, secondary).unwrap();
        manager.begin(&backend, other).unwrap();

        assert!(matches!(
            manager.execute_secondary(&backend, other, &[secondary]),
            Err(ResourceError::UsagePrecondition { .. })
        ));
        assert!(backend.executed_secondaries(manager.native(other).unwrap()).is_empty());
    }

    #[test]
    fn test_failed_reclamation_stays_queued() {
        let backend = HeadlessBackend::new();
        let mut manager = manager();
        let primary = manager.create_primary(&backend, 0).unwrap();
        let secondary = manager.create_secondary(&backend, 1, primary, target()).unwrap();
        manager.begin(&backend, secondary).unwrap();
        manager.begin(&backend, primary).unwrap();
        manager.end(&backend, primary).unwrap();
        manager.submit(&backend, primary).unwrap();
        assert_eq!(manager.destroy(&backend, secondary).unwrap(), DestroyOutcome::Deferred);

        backend.complete_all();
        backend.fail_next(FailurePoint::QueueWaitIdle);
        assert!(matches!(
            manager.poll_destructions(&backend),
            Err(ResourceError::Backend(BackendError::DeviceLost))
        ));
        assert_eq!(manager.pending_destructions(), 1);
        assert!(manager.contains(secondary));

        // The secondary was ended on the failed attempt and must not be ended twice
        assert_eq!(manager.poll_destructions(&backend).unwrap(), 1);
        assert!(!manager.contains(secondary));
        assert_eq!(manager.pending_destructions(), 0);
    }
}
