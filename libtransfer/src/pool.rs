//! Managed buffer pool.
//!
//! The region `[base_address, base_address + slab_size * slab_count)` is split
//! into equal slabs handed out LIFO. A request larger than one slab is served
//! on its own above the slab region and has to be registered with the
//! transport separately (see [`BufferPool::is_slab_address`]).
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::error::TransferError;

pub const DEFAULT_SLAB_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_SLAB_COUNT: usize = 512;
pub const DEFAULT_BASE_ADDRESS: u64 = 0x7f00_0000_0000;
pub const DEFAULT_MAX_LARGE_SIZE: usize = 1 << 30;
const LARGE_ALIGN: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub base_address: u64,
    pub slab_size: usize,
    pub slab_count: usize,
    /// Largest request served outside the slab region.
    pub max_large_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_address: DEFAULT_BASE_ADDRESS,
            slab_size: DEFAULT_SLAB_SIZE,
            slab_count: DEFAULT_SLAB_COUNT,
            max_large_size: DEFAULT_MAX_LARGE_SIZE,
        }
    }
}

/// A live allocation. Valid until freed with the same length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagedBuffer {
    pub address: u64,
    pub length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub outstanding: usize,
    pub outstanding_bytes: u64,
    pub free_slabs: usize,
}

struct Allocation {
    length: usize,
    bytes: Box<[u8]>,
}

struct PoolState {
    free_slabs: Vec<usize>,
    live: BTreeMap<u64, Allocation>,
    next_large: u64,
}

pub struct BufferPool {
    config: PoolConfig,
    region_end: u64,
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Result<Self, TransferError> {
        let region_len = (config.slab_size as u64).checked_mul(config.slab_count as u64);
        let region_end = region_len.and_then(|len| config.base_address.checked_add(len));
        let region_end = match region_end {
            Some(end) if config.base_address > 0 && config.slab_size > 0 => end,
            _ => {
                return Err(TransferError::Allocation {
                    length: config.slab_size,
                    reason: format!("invalid pool layout {config:?}"),
                });
            }
        };

        // Pop order hands out the lowest slab first.
        let free_slabs = (0..config.slab_count).rev().collect();
        Ok(Self {
            config,
            region_end,
            state: Mutex::new(PoolState {
                free_slabs,
                live: BTreeMap::new(),
                next_large: align_up(region_end, LARGE_ALIGN),
            }),
        })
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Start and length of the slab region.
    pub fn slab_region(&self) -> (u64, usize) {
        (
            self.config.base_address,
            (self.region_end - self.config.base_address) as usize,
        )
    }

    pub fn is_slab_address(&self, address: u64) -> bool {
        address >= self.config.base_address && address < self.region_end
    }

    pub fn allocate(&self, length: usize) -> Result<ManagedBuffer, TransferError> {
        if length == 0 {
            return Err(TransferError::Allocation {
                length,
                reason: "zero-length buffer".to_string(),
            });
        }
        if length > self.config.slab_size && length > self.config.max_large_size {
            return Err(TransferError::Allocation {
                length,
                reason: format!(
                    "larger than the {} byte limit for oversized buffers",
                    self.config.max_large_size
                ),
            });
        }
        let bytes = zeroed(length)?;

        let mut state = self.state();
        let address = if length <= self.config.slab_size {
            let slab = state.free_slabs.pop().ok_or_else(|| TransferError::Allocation {
                length,
                reason: "no free slab left in managed region".to_string(),
            })?;
            self.config.base_address + (slab * self.config.slab_size) as u64
        } else {
            let address = state.next_large;
            state.next_large = address
                .checked_add(length as u64)
                .map(|end| align_up(end, LARGE_ALIGN))
                .ok_or_else(|| TransferError::Allocation {
                    length,
                    reason: "address space exhausted".to_string(),
                })?;
            address
        };
        state.live.insert(address, Allocation { length, bytes });
        debug!("allocated {length} bytes at {address:#x}");
        Ok(ManagedBuffer { address, length })
    }

    pub fn free(&self, address: u64, length: usize) -> Result<(), TransferError> {
        let mut state = self.state();
        match state.live.get(&address) {
            Some(allocation) if allocation.length == length => {}
            _ => return Err(TransferError::InvalidHandle { address, length }),
        }
        state.live.remove(&address);
        if self.is_slab_address(address) {
            let slab = ((address - self.config.base_address) / self.config.slab_size as u64) as usize;
            state.free_slabs.push(slab);
        }
        debug!("freed {length} bytes at {address:#x}");
        Ok(())
    }

    /// Checks that `[address, address + length)` lies inside one live allocation.
    pub fn check_range(&self, address: u64, length: usize) -> Result<(), TransferError> {
        let state = self.state();
        locate(&state, address, length).map(|_| ())
    }

    pub fn write_bytes(&self, address: u64, data: &[u8]) -> Result<(), TransferError> {
        let mut state = self.state();
        let (start, offset) = locate(&state, address, data.len())?;
        if let Some(allocation) = state.live.get_mut(&start) {
            allocation.bytes[offset..offset + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    pub fn read_bytes(&self, address: u64, length: usize) -> Result<Vec<u8>, TransferError> {
        let state = self.state();
        let (start, offset) = locate(&state, address, length)?;
        Ok(state
            .live
            .get(&start)
            .map(|allocation| allocation.bytes[offset..offset + length].to_vec())
            .unwrap_or_default())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            outstanding: state.live.len(),
            outstanding_bytes: state.live.values().map(|a| a.length as u64).sum(),
            free_slabs: state.free_slabs.len(),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        // Every mutation completes before the guard drops; a panicking holder
        // cannot leave the bookkeeping half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns the owning allocation's start address and the offset into it.
fn locate(state: &PoolState, address: u64, length: usize) -> Result<(u64, usize), TransferError> {
    let (&start, allocation) = state
        .live
        .range(..=address)
        .next_back()
        .ok_or(TransferError::InvalidHandle { address, length })?;
    let offset = (address - start) as usize;
    if offset >= allocation.length {
        return Err(TransferError::InvalidHandle { address, length });
    }
    match offset.checked_add(length) {
        Some(end) if end <= allocation.length => Ok((start, offset)),
        _ => Err(TransferError::BufferBounds { address, length }),
    }
}

fn zeroed(length: usize) -> Result<Box<[u8]>, TransferError> {
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(length)
        .map_err(|e| TransferError::Allocation {
            length,
            reason: e.to_string(),
        })?;
    bytes.resize(length, 0);
    Ok(bytes.into_boxed_slice())
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}
