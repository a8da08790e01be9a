//! Linear buffer arena
//!
//! Hands out aligned sub-ranges of large device buffers, one list of backing
//! buffers per usage class. Ranges are never freed individually: the arena
//! is meant for data living as long as a frame ring or the application, and
//! is reclaimed as a whole by [`BufferArena::destroy_all`].

use std::collections::HashMap;
use std::fmt;

use bytemuck::Pod;

use crate::config::ArenaConfig;
use crate::foundation::memory::{align_up, is_aligned};
use crate::render::api::{BufferUsage, GpuBackend};
use crate::render::resources::error::{ResourceError, ResourceResult};

/// One backing buffer of the arena
struct ArenaPool<B: GpuBackend> {
    buffer: B::Buffer,
    memory: B::Memory,
    alignment: u64,
    filled_size: u64,
    alloc_size: u64,
}

impl<B: GpuBackend> ArenaPool<B> {
    fn fits(&self, size: u64) -> bool {
        self.filled_size
            .checked_add(size)
            .is_some_and(|end| end <= self.alloc_size)
    }
}

/// Sub-range of an arena buffer
pub struct BufferRange<B: GpuBackend> {
    /// Usage class the range was requested for
    pub usage: BufferUsage,
    /// Backing buffer
    pub buffer: B::Buffer,
    /// Byte offset inside the backing buffer, a multiple of the usage alignment
    pub offset: u64,
    /// Requested size in bytes
    pub size: u64,
    pool: usize,
}

impl<B: GpuBackend> BufferRange<B> {
    /// Index of the backing buffer within its usage class
    pub fn pool_index(&self) -> usize {
        self.pool
    }
}

impl<B: GpuBackend> Clone for BufferRange<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: GpuBackend> Copy for BufferRange<B> {}

impl<B: GpuBackend> PartialEq for BufferRange<B> {
    fn eq(&self, other: &Self) -> bool {
        self.usage == other.usage
            && self.buffer == other.buffer
            && self.offset == other.offset
            && self.size == other.size
            && self.pool == other.pool
    }
}

impl<B: GpuBackend> fmt::Debug for BufferRange<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRange")
            .field("usage", &self.usage)
            .field("buffer", &self.buffer)
            .field("pool", &self.pool)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Occupancy of one usage class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    /// Number of backing buffers
    pub pools: usize,
    /// Total bytes of backing storage
    pub allocated_bytes: u64,
    /// Bytes handed out, including alignment padding
    pub used_bytes: u64,
}

/// Bump allocator over device buffers
pub struct BufferArena<B: GpuBackend> {
    pools: HashMap<BufferUsage, Vec<ArenaPool<B>>>,
    config: ArenaConfig,
}

impl<B: GpuBackend> BufferArena<B> {
    /// Create an empty arena
    pub fn new(config: ArenaConfig) -> Self {
        Self {
            pools: HashMap::new(),
            config,
        }
    }

    /// Reserve `size` bytes of `usage` storage
    ///
    /// Uses the first backing buffer with room for the request, otherwise
    /// creates a new one sized to the larger of the request and the configured
    /// chunk for the usage class.
    pub fn get_range(&mut self, backend: &B, usage: BufferUsage, size: u64) -> ResourceResult<BufferRange<B>> {
        if size == 0 {
            return Err(ResourceError::precondition(format!("zero-sized {usage:?} range requested")));
        }

        let pools = self.pools.entry(usage).or_default();
        let index = match pools.iter().position(|pool| pool.fits(size)) {
            Some(index) => index,
            None => {
                let alignment = backend.buffer_alignment(usage).max(1);
                let aligned = align_up(size, alignment).ok_or_else(|| {
                    ResourceError::precondition(format!("{usage:?} range of {size} bytes overflows"))
                })?;
                let alloc_size = aligned.max(self.config.chunk_size(usage));
                let (buffer, memory) = backend
                    .create_buffer(usage, alloc_size)
                    .map_err(ResourceError::exhausted("arena buffer"))?;

                log::debug!(
                    "Buffer arena: new {:?} pool #{} of {} bytes (alignment {})",
                    usage,
                    pools.len(),
                    alloc_size,
                    alignment
                );
                pools.push(ArenaPool {
                    buffer,
                    memory,
                    alignment,
                    filled_size: 0,
                    alloc_size,
                });
                pools.len() - 1
            }
        };

        let pool = &mut pools[index];
        let offset = pool.filled_size;
        debug_assert!(is_aligned(offset, pool.alignment));
        let bump = align_up(size, pool.alignment).unwrap_or(u64::MAX);
        pool.filled_size = offset.saturating_add(bump);
        log::trace!("Buffer arena: {:?} range {}+{} from pool #{}", usage, offset, size, index);

        Ok(BufferRange {
            usage,
            buffer: pool.buffer,
            offset,
            size,
            pool: index,
        })
    }

    fn pool_for(&self, range: &BufferRange<B>) -> ResourceResult<&ArenaPool<B>> {
        self.pools
            .get(&range.usage)
            .and_then(|pools| pools.get(range.pool))
            .filter(|pool| pool.buffer == range.buffer)
            .ok_or_else(|| ResourceError::precondition("buffer range belongs to a destroyed arena pool"))
    }

    /// Copy `data` into a host-visible range
    pub fn write(&self, backend: &B, range: &BufferRange<B>, data: &[u8]) -> ResourceResult<()> {
        if !range.usage.is_host_visible() {
            return Err(ResourceError::precondition(format!(
                "{:?} ranges are not host visible",
                range.usage
            )));
        }
        if data.len() as u64 > range.size {
            return Err(ResourceError::precondition(format!(
                "write of {} bytes into a {}-byte range",
                data.len(),
                range.size
            )));
        }

        let pool = self.pool_for(range)?;
        backend.write_buffer(pool.memory, range.offset, data)?;
        Ok(())
    }

    /// Copy a plain-old-data value into a host-visible range
    pub fn write_pod<T: Pod>(&self, backend: &B, range: &BufferRange<B>, value: &T) -> ResourceResult<()> {
        self.write(backend, range, bytemuck::bytes_of(value))
    }

    /// Copy a slice of plain-old-data values into a host-visible range
    pub fn write_slice<T: Pod>(&self, backend: &B, range: &BufferRange<B>, values: &[T]) -> ResourceResult<()> {
        self.write(backend, range, bytemuck::cast_slice(values))
    }

    /// Number of backing buffers for `usage`
    pub fn pool_count(&self, usage: BufferUsage) -> usize {
        self.pools.get(&usage).map_or(0, Vec::len)
    }

    /// Occupancy of `usage`
    pub fn stats(&self, usage: BufferUsage) -> ArenaStats {
        self.pools
            .get(&usage)
            .map(|pools| ArenaStats {
                pools: pools.len(),
                allocated_bytes: pools.iter().map(|p| p.alloc_size).sum(),
                used_bytes: pools.iter().map(|p| p.filled_size.min(p.alloc_size)).sum(),
            })
            .unwrap_or_default()
    }

    /// Release every backing buffer of every usage class
    ///
    /// All ranges handed out so far become invalid. The GPU must no longer be
    /// reading any of them.
    pub fn destroy_all(&mut self, backend: &B) {
        let mut destroyed = 0;
        for (_, pools) in self.pools.drain() {
            for pool in pools {
                backend.destroy_buffer(pool.buffer, pool.memory);
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            log::debug!("Buffer arena: destroyed {} backing buffers", destroyed);
        }
    }
}
