//! Descriptor budget allocator
//!
//! Keeps a growable list of fixed-capacity descriptor pools. A request for
//! `N` uniform and `M` sampler descriptors is served by the first pool with
//! enough budget left in both dimensions; otherwise a new pool sized at a
//! fixed multiple of the request is created, reusing the slot of a destroyed
//! pool when one exists.
//!
//! Budgets only ever shrink. Descriptors are reclaimed at pool granularity:
//! each pool counts its live allocations and is destroyed when that count
//! drops to zero. Sets are tracked by generation-checked handles, so freeing
//! a set twice is refused instead of releasing another set's charge.

use std::collections::HashSet;
use std::fmt;

use crate::foundation::collections::{Handle, HandlePool};
use crate::render::api::{BufferUsage, DescriptorKind, GpuBackend, LayoutBinding};
use crate::render::resources::buffer_arena::BufferRange;
use crate::render::resources::error::{ResourceError, ResourceResult};

struct PoolRecord<B: GpuBackend> {
    native: B::DescriptorPool,
    uniform_total: u32,
    sampler_total: u32,
    uniform_remaining: u32,
    sampler_remaining: u32,
    live_allocations: u32,
}

/// Budget snapshot of one descriptor pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPoolStats {
    /// Uniform descriptors the pool was created with
    pub uniform_total: u32,
    /// Uniform descriptors not yet handed out
    pub uniform_remaining: u32,
    /// Sampler descriptors the pool was created with
    pub sampler_total: u32,
    /// Sampler descriptors not yet handed out
    pub sampler_remaining: u32,
    /// Allocations still referencing the pool
    pub live_allocations: u32,
}

/// Descriptor set layout together with its binding description
pub struct DescriptorLayout<B: GpuBackend> {
    native: B::DescriptorSetLayout,
    bindings: Vec<LayoutBinding>,
    uniform_count: u32,
    sampler_count: u32,
}

impl<B: GpuBackend> DescriptorLayout<B> {
    /// Native layout handle
    pub fn handle(&self) -> B::DescriptorSetLayout {
        self.native
    }

    /// Bindings the layout was built from
    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    /// Number of uniform buffer bindings
    pub fn uniform_count(&self) -> u32 {
        self.uniform_count
    }

    /// Number of sampler bindings
    pub fn sampler_count(&self) -> u32 {
        self.sampler_count
    }
}

/// Marker for descriptor set handles
#[derive(Debug)]
pub enum DescriptorSetKind {}

struct SetRecord<B: GpuBackend> {
    pool: usize,
    pool_native: B::DescriptorPool,
}

/// Descriptor set allocated through the budget allocator
pub struct DescriptorSet<B: GpuBackend> {
    id: Handle<DescriptorSetKind>,
    native: B::DescriptorSet,
    pool: usize,
}

impl<B: GpuBackend> DescriptorSet<B> {
    /// Native set handle
    pub fn handle(&self) -> B::DescriptorSet {
        self.native
    }

    /// Slot of the pool the set was allocated from
    pub fn pool_index(&self) -> usize {
        self.pool
    }
}

impl<B: GpuBackend> Clone for DescriptorSet<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: GpuBackend> Copy for DescriptorSet<B> {}

impl<B: GpuBackend> fmt::Debug for DescriptorSet<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("id", &self.id)
            .field("native", &self.native)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Growable collection of budget-tracked descriptor pools
pub struct DescriptorAllocator<B: GpuBackend> {
    records: Vec<Option<PoolRecord<B>>>,
    sets: HandlePool<SetRecord<B>, DescriptorSetKind>,
    live_pools: usize,
    multiplier: u32,
}

impl<B: GpuBackend> DescriptorAllocator<B> {
    /// Create an allocator whose new pools hold `multiplier` times the triggering request
    pub fn new(multiplier: u32) -> Self {
        Self {
            records: Vec::new(),
            sets: HandlePool::new(),
            live_pools: 0,
            multiplier: multiplier.max(1),
        }
    }

    /// Debit `uniform_count` uniform and `sampler_count` sampler descriptors from a pool
    ///
    /// Returns the slot index of the pool that was charged. Each successful
    /// call must be balanced by one [`release_pool`](Self::release_pool).
    pub fn acquire_pool(&mut self, backend: &B, uniform_count: u32, sampler_count: u32) -> ResourceResult<usize> {
        if uniform_count == 0 && sampler_count == 0 {
            return Err(ResourceError::precondition("descriptor request for zero descriptors"));
        }

        let existing = self.records.iter_mut().enumerate().find_map(|(index, record)| {
            record
                .as_mut()
                .filter(|r| r.uniform_remaining >= uniform_count && r.sampler_remaining >= sampler_count)
                .map(|r| (index, r))
        });
        if let Some((index, record)) = existing {
            record.uniform_remaining -= uniform_count;
            record.sampler_remaining -= sampler_count;
            record.live_allocations += 1;
            log::trace!(
                "Descriptor pool #{}: debited {}u/{}s, {}u/{}s left",
                index,
                uniform_count,
                sampler_count,
                record.uniform_remaining,
                record.sampler_remaining
            );
            return Ok(index);
        }

        let overflow = || ResourceError::precondition("descriptor request too large to size a pool");
        let uniform_total = uniform_count.checked_mul(self.multiplier).ok_or_else(overflow)?;
        let sampler_total = sampler_count.checked_mul(self.multiplier).ok_or_else(overflow)?;
        let max_sets = uniform_total.checked_add(sampler_total).ok_or_else(overflow)?;
        let native = backend
            .create_descriptor_pool(uniform_total, sampler_total, max_sets)
            .map_err(ResourceError::exhausted("descriptor pool"))?;

        let record = PoolRecord {
            native,
            uniform_total,
            sampler_total,
            uniform_remaining: uniform_total - uniform_count,
            sampler_remaining: sampler_total - sampler_count,
            live_allocations: 1,
        };
        let index = match self.records.iter().position(Option::is_none) {
            Some(hole) => {
                self.records[hole] = Some(record);
                hole
            }
            None => {
                self.records.push(Some(record));
                self.records.len() - 1
            }
        };
        self.live_pools += 1;

        log::debug!(
            "Descriptor pool #{} created with {} uniform / {} sampler descriptors",
            index,
            uniform_total,
            sampler_total
        );
        Ok(index)
    }

    /// Drop one allocation from the pool in slot `index`
    ///
    /// The pool is destroyed once its last allocation is released; when no
    /// pool remains, the record array itself is released.
    pub fn release_pool(&mut self, backend: &B, index: usize) -> ResourceResult<()> {
        let record = self
            .records
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(|| ResourceError::precondition(format!("release of unknown descriptor pool #{index}")))?;

        record.live_allocations -= 1;
        if record.live_allocations > 0 {
            return Ok(());
        }

        backend.destroy_descriptor_pool(record.native);
        self.records[index] = None;
        self.live_pools -= 1;
        log::debug!("Descriptor pool #{} destroyed", index);

        if self.live_pools == 0 {
            self.records = Vec::new();
        }
        Ok(())
    }

    /// Build a descriptor set layout from a binding description
    pub fn create_layout(&self, backend: &B, bindings: &[LayoutBinding]) -> ResourceResult<DescriptorLayout<B>> {
        if bindings.is_empty() {
            return Err(ResourceError::precondition("descriptor layout without bindings"));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = bindings.iter().find(|b| !seen.insert(b.binding)) {
            return Err(ResourceError::precondition(format!(
                "binding {} appears twice in descriptor layout",
                duplicate.binding
            )));
        }

        let count = |kind: DescriptorKind| bindings.iter().filter(|b| b.kind == kind).count() as u32;
        let native = backend
            .create_descriptor_set_layout(bindings)
            .map_err(ResourceError::exhausted("descriptor set layout"))?;

        Ok(DescriptorLayout {
            native,
            bindings: bindings.to_vec(),
            uniform_count: count(DescriptorKind::Uniform),
            sampler_count: count(DescriptorKind::Sampler),
        })
    }

    /// Destroy a layout; sets already allocated with it stay valid
    pub fn destroy_layout(&self, backend: &B, layout: DescriptorLayout<B>) {
        backend.destroy_descriptor_set_layout(layout.native);
    }

    /// Allocate a descriptor set shaped by `layout`
    pub fn allocate_set(&mut self, backend: &B, layout: &DescriptorLayout<B>) -> ResourceResult<DescriptorSet<B>> {
        let pool = self.acquire_pool(backend, layout.uniform_count, layout.sampler_count)?;
        let pool_native = self.native_pool(pool)?;

        let native = match backend.allocate_descriptor_set(pool_native, layout.native) {
            Ok(native) => native,
            Err(err) => {
                self.release_pool(backend, pool)?;
                return Err(ResourceError::exhausted("descriptor set")(err));
            }
        };

        match self.sets.allocate(SetRecord { pool, pool_native }) {
            Ok(id) => Ok(DescriptorSet { id, native, pool }),
            Err(err) => {
                self.release_pool(backend, pool)?;
                Err(err.into())
            }
        }
    }

    /// Return a set's budget charge to its pool
    ///
    /// Each set is freed at most once; a second free of the same set fails
    /// with a handle error and leaves the pool untouched.
    pub fn free_set(&mut self, backend: &B, set: DescriptorSet<B>) -> ResourceResult<()> {
        self.check_set(&set)?;
        let record = self.sets.free(set.id)?;
        self.release_pool(backend, record.pool)
    }

    /// Point uniform `binding` of `set` at an arena range
    pub fn write_uniform(
        &self,
        backend: &B,
        set: &DescriptorSet<B>,
        binding: u32,
        range: &BufferRange<B>,
    ) -> ResourceResult<()> {
        self.check_set(set)?;
        if range.usage != BufferUsage::Uniform {
            return Err(ResourceError::precondition(format!(
                "uniform binding {binding} pointed at a {:?} range",
                range.usage
            )));
        }
        backend.update_uniform_descriptor(set.native, binding, range.buffer, range.offset, range.size);
        Ok(())
    }

    fn native_pool(&self, index: usize) -> ResourceResult<B::DescriptorPool> {
        self.records
            .get(index)
            .and_then(Option::as_ref)
            .map(|record| record.native)
            .ok_or_else(|| ResourceError::precondition(format!("unknown descriptor pool #{index}")))
    }

    fn check_set(&self, set: &DescriptorSet<B>) -> ResourceResult<()> {
        let record = self.sets.get(set.id)?;
        if self.native_pool(record.pool)? == record.pool_native {
            Ok(())
        } else {
            Err(ResourceError::precondition("descriptor set outlived its pool"))
        }
    }

    /// Budget of the pool in slot `index`, if that slot holds a live pool
    pub fn pool_stats(&self, index: usize) -> Option<DescriptorPoolStats> {
        self.records.get(index).and_then(Option::as_ref).map(|r| DescriptorPoolStats {
            uniform_total: r.uniform_total,
            uniform_remaining: r.uniform_remaining,
            sampler_total: r.sampler_total,
            sampler_remaining: r.sampler_remaining,
            live_allocations: r.live_allocations,
        })
    }

    /// Number of live pools
    pub fn pool_count(&self) -> usize {
        self.live_pools
    }

    /// Length of the record array, holes included
    pub fn slot_count(&self) -> usize {
        self.records.len()
    }

    /// Destroy every pool regardless of outstanding allocations
    pub fn destroy_all(&mut self, backend: &B) {
        for record in self.records.drain(..).flatten() {
            if record.live_allocations > 0 {
                log::warn!(
                    "Destroying descriptor pool with {} live allocations",
                    record.live_allocations
                );
            }
            backend.destroy_descriptor_pool(record.native);
        }
        // Free rather than replace, so outstanding set handles stay stale
        let ids: Vec<_> = self.sets.iter().map(|(id, _)| id).collect();
        for id in ids {
            let _ = self.sets.free(id);
        }
        self.live_pools = 0;
    }
}
