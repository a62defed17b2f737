// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer ownership tracking.
//!
//! Every buffer of a session is owned by exactly one of the driver, the firmware or the client at
//! any time:
//!
//! ```text
//!                    submit_to_firmware()
//!          +--------+ ------------------> +----------+
//!  ------> | Driver |                     | Firmware |
//! register +--------+ <------------------ +----------+
//!            |    ^   return_from_firmware()    |
//!            |    |        (recycled)           | return_from_firmware()
//! release_to |    | reclaim_from                |      (completed)
//!   _client()|    | _client()                   v
//!            |    |                        +--------+
//!            +----+----------------------> | Client |
//!                                          +--------+
//! ```
//!
//! Ownership only ever changes through [`BufferTracker::transfer`], which also adjusts the
//! reference count of the buffer, so the per-owner counts always add up to the number of
//! registered buffers.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use thiserror::Error;

use crate::Port;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u32);

/// Party currently entitled to access a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    Driver,
    Firmware,
    Client,
}

impl Owner {
    pub const ALL: [Owner; 3] = [Owner::Driver, Owner::Firmware, Owner::Client];

    fn index(self) -> usize {
        match self {
            Owner::Driver => 0,
            Owner::Firmware => 1,
            Owner::Client => 2,
        }
    }
}

/// What a buffer is used for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// A client frame or bitstream buffer queued on one of the ports.
    Frame(Port),
    Scratch,
    Persistent,
    /// Reconstruction buffer of an encoder.
    Recon,
    /// Empty buffer carrying an end-of-stream marker.
    Eos,
}

impl BufferKind {
    /// Internal buffers are allocated by the driver and never handed to the client.
    pub fn is_internal(&self) -> bool {
        !matches!(self, BufferKind::Frame(_))
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// The buffer was queued while it could not be submitted and waits in the driver.
        const DEFERRED = 1 << 0;
        /// The firmware returned the buffer but still holds it as a reference.
        const RBR_PENDING = 1 << 1;
    }
}

/// How the firmware gave a buffer back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReturnStatus {
    /// Processing is over, the buffer can go to the client.
    Completed,
    /// The firmware still uses the buffer as a reference. It goes back to the driver until a
    /// release-buffer-reference message arrives.
    Recycled,
}

/// Compression metadata attached to reconstruction buffers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconInfo {
    pub compression_ratio: u32,
    pub compression_format: u32,
}

/// Opaque handle to memory obtained from a [`BufferAllocator`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle(pub u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocFlags {
    pub secure: bool,
    pub kind: BufferKind,
}

/// Memory provider. Only called when buffers are registered and deregistered, never while a
/// buffer changes hands.
pub trait BufferAllocator: Send + Sync {
    fn alloc(&self, size: usize, flags: AllocFlags) -> anyhow::Result<BufferHandle>;
    fn free(&self, handle: BufferHandle);
}

/// [`BufferAllocator`] handing out plain handles and keeping track of the live ones.
#[derive(Debug, Default)]
pub struct TrackingAllocator {
    next: AtomicU64,
    live: Mutex<BTreeSet<BufferHandle>>,
    /// Fails allocations larger than this, if set.
    pub max_size: Option<usize>,
}

impl TrackingAllocator {
    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl BufferAllocator for TrackingAllocator {
    fn alloc(&self, size: usize, flags: AllocFlags) -> anyhow::Result<BufferHandle> {
        if let Some(max) = self.max_size {
            if size > max {
                anyhow::bail!("cannot allocate {size} bytes for {:?} (max {max})", flags.kind);
            }
        }

        let handle = BufferHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle);
        Ok(handle)
    }

    fn free(&self, handle: BufferHandle) {
        if !self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
        {
            log::warn!("Freeing unknown buffer handle {handle:?}");
        }
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("{buffer:?} is owned by {actual:?}, expected {expected:?}")]
    Ownership {
        buffer: BufferId,
        expected: Owner,
        actual: Owner,
    },
    #[error("{0:?} is still referenced ({1} references)")]
    InUse(BufferId, u32),
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),
    #[error("{port:?} port already holds the maximum of {max} buffers")]
    Capacity { port: Port, max: u32 },
    #[error("invalid reference count on {0:?}. This is likely a bug.")]
    InvalidRefCount(BufferId),
    #[error(transparent)]
    Alloc(anyhow::Error),
}

pub type BufferResult<T> = Result<T, BufferError>;

/// Reference count adjustment applied together with an ownership change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RefChange {
    Keep,
    Take,
    Release,
}

#[derive(Clone, Debug)]
pub struct TrackedBuffer {
    pub id: BufferId,
    pub kind: BufferKind,
    /// Index of the buffer within its port or internal list.
    pub index: u32,
    pub size: usize,
    pub handle: BufferHandle,
    pub owner: Owner,
    pub refcount: u32,
    pub flags: BufferFlags,
    pub recon: Option<ReconInfo>,
}

/// Buffer events of a session: empty/fill-this-buffer submissions and their done messages.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufCount {
    pub etb: u64,
    pub ftb: u64,
    pub ebd: u64,
    pub fbd: u64,
}

pub struct BufferTracker {
    allocator: Arc<dyn BufferAllocator>,
    secure: bool,
    max_per_port: [u32; 2],
    next_id: u32,
    buffers: BTreeMap<BufferId, TrackedBuffer>,
    /// Number of buffers held by each owner, indexed by `Owner::index`.
    owned: [usize; 3],
    count: BufCount,
}

impl BufferTracker {
    /// Creates a tracker allocating from `allocator`, accepting at most `max_per_port` frame
    /// buffers on each port (indexed by `Port::index`).
    pub fn new(allocator: Arc<dyn BufferAllocator>, secure: bool, max_per_port: [u32; 2]) -> Self {
        Self {
            allocator,
            secure,
            max_per_port,
            next_id: 0,
            buffers: Default::default(),
            owned: [0; 3],
            count: Default::default(),
        }
    }

    /// Allocates a buffer of `kind` and starts tracking it. New buffers are owned by the driver.
    pub fn register(&mut self, kind: BufferKind, index: u32, size: usize) -> BufferResult<BufferId> {
        if let BufferKind::Frame(port) = kind {
            let max = self.max_per_port[port.index()];
            if self.list(kind).count() >= max as usize {
                return Err(BufferError::Capacity { port, max });
            }
        }

        let handle = self
            .allocator
            .alloc(
                size,
                AllocFlags {
                    secure: self.secure,
                    kind,
                },
            )
            .map_err(BufferError::Alloc)?;

        let id = BufferId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        self.buffers.insert(
            id,
            TrackedBuffer {
                id,
                kind,
                index,
                size,
                handle,
                owner: Owner::Driver,
                refcount: 0,
                flags: Default::default(),
                recon: (kind == BufferKind::Recon).then(ReconInfo::default),
            },
        );
        self.owned[Owner::Driver.index()] += 1;

        log::trace!("Registered {id:?} kind={kind:?} index={index} size={size}");
        Ok(id)
    }

    /// Stops tracking `id` and frees its memory. Referenced buffers cannot be deregistered.
    pub fn deregister(&mut self, id: BufferId) -> BufferResult<()> {
        let buffer = self.get(id)?;
        if buffer.refcount > 0 {
            return Err(BufferError::InUse(id, buffer.refcount));
        }
        if buffer.owner == Owner::Firmware {
            return Err(BufferError::Ownership {
                buffer: id,
                expected: Owner::Driver,
                actual: Owner::Firmware,
            });
        }

        let Some(buffer) = self.buffers.remove(&id) else {
            return Err(BufferError::UnknownBuffer(id));
        };
        self.owned[buffer.owner.index()] -= 1;
        self.allocator.free(buffer.handle);

        log::trace!("Deregistered {id:?} kind={:?}", buffer.kind);
        Ok(())
    }

    pub fn get(&self, id: BufferId) -> BufferResult<&TrackedBuffer> {
        self.buffers.get(&id).ok_or(BufferError::UnknownBuffer(id))
    }

    pub fn owner(&self, id: BufferId) -> BufferResult<Owner> {
        self.get(id).map(|buffer| buffer.owner)
    }

    /// Finds the frame buffer queued at `index` on `port`.
    pub fn find(&self, port: Port, index: u32) -> Option<&TrackedBuffer> {
        self.list(BufferKind::Frame(port))
            .find(|buffer| buffer.index == index)
    }

    /// Moves `id` from `from` to `to`, adjusting its reference count as one operation.
    pub fn transfer(
        &mut self,
        id: BufferId,
        from: Owner,
        to: Owner,
        refs: RefChange,
    ) -> BufferResult<&TrackedBuffer> {
        let buffer = self
            .buffers
            .get_mut(&id)
            .ok_or(BufferError::UnknownBuffer(id))?;

        if buffer.owner != from {
            return Err(BufferError::Ownership {
                buffer: id,
                expected: from,
                actual: buffer.owner,
            });
        }

        let refcount = match refs {
            RefChange::Keep => Some(buffer.refcount),
            RefChange::Take => buffer.refcount.checked_add(1),
            RefChange::Release => buffer.refcount.checked_sub(1),
        }
        .ok_or(BufferError::InvalidRefCount(id))?;

        buffer.refcount = refcount;
        buffer.owner = to;
        self.owned[from.index()] -= 1;
        self.owned[to.index()] += 1;

        log::trace!("{id:?}: {from:?} -> {to:?} refcount={refcount}");
        Ok(buffer)
    }

    /// Hands a driver-owned buffer to the firmware. Buffers the firmware still references cannot
    /// be submitted again.
    pub fn submit_to_firmware(&mut self, id: BufferId) -> BufferResult<&TrackedBuffer> {
        let buffer = self.get(id)?;
        let kind = buffer.kind;
        if buffer.owner == Owner::Driver && buffer.refcount > 0 {
            return Err(BufferError::InUse(id, buffer.refcount));
        }
        self.transfer(id, Owner::Driver, Owner::Firmware, RefChange::Take)?;

        match kind {
            BufferKind::Frame(Port::Output) | BufferKind::Eos => self.count.etb += 1,
            BufferKind::Frame(Port::Capture) => self.count.ftb += 1,
            _ => (),
        }

        self.get(id)
    }

    /// Undoes [`Self::submit_to_firmware`] for a buffer the firmware never received.
    pub fn cancel_submit(&mut self, id: BufferId) -> BufferResult<()> {
        let kind = self.get(id)?.kind;
        self.transfer(id, Owner::Firmware, Owner::Driver, RefChange::Release)?;

        match kind {
            BufferKind::Frame(Port::Output) | BufferKind::Eos => {
                self.count.etb = self.count.etb.saturating_sub(1)
            }
            BufferKind::Frame(Port::Capture) => self.count.ftb = self.count.ftb.saturating_sub(1),
            _ => (),
        }
        Ok(())
    }

    /// Takes back a buffer from the firmware. Completed frame buffers go to the client; recycled
    /// ones and internal buffers stay with the driver. Returns the new owner.
    pub fn return_from_firmware(&mut self, id: BufferId, status: ReturnStatus) -> BufferResult<Owner> {
        let kind = self.get(id)?.kind;
        let (to, refs) = match (kind.is_internal(), status) {
            (true, _) => (Owner::Driver, RefChange::Release),
            (false, ReturnStatus::Completed) => (Owner::Client, RefChange::Release),
            // The firmware's hold on the buffer becomes a reference.
            (false, ReturnStatus::Recycled) => (Owner::Driver, RefChange::Keep),
        };

        self.transfer(id, Owner::Firmware, to, refs)?;

        match kind {
            BufferKind::Frame(Port::Output) | BufferKind::Eos => self.count.ebd += 1,
            BufferKind::Frame(Port::Capture) => self.count.fbd += 1,
            _ => (),
        }

        if to == Owner::Driver && !kind.is_internal() {
            self.set_flag(id, BufferFlags::RBR_PENDING, true)?;
        }

        Ok(to)
    }

    /// Drops the firmware's reference on a recycled buffer, which then goes to the client.
    pub fn release_reference(&mut self, id: BufferId) -> BufferResult<()> {
        let buffer = self.get(id)?;
        if !buffer.flags.contains(BufferFlags::RBR_PENDING) {
            return Err(BufferError::InvalidRefCount(id));
        }

        self.transfer(id, Owner::Driver, Owner::Client, RefChange::Release)?;
        self.set_flag(id, BufferFlags::RBR_PENDING, false)
    }

    pub fn release_to_client(&mut self, id: BufferId) -> BufferResult<()> {
        let buffer = self.get(id)?;
        if buffer.kind.is_internal() || buffer.refcount > 0 {
            return Err(BufferError::InUse(id, buffer.refcount));
        }

        self.transfer(id, Owner::Driver, Owner::Client, RefChange::Keep)?;
        Ok(())
    }

    pub fn reclaim_from_client(&mut self, id: BufferId) -> BufferResult<()> {
        self.transfer(id, Owner::Client, Owner::Driver, RefChange::Keep)?;
        Ok(())
    }

    pub fn set_flag(&mut self, id: BufferId, flag: BufferFlags, set: bool) -> BufferResult<()> {
        let buffer = self
            .buffers
            .get_mut(&id)
            .ok_or(BufferError::UnknownBuffer(id))?;
        buffer.flags.set(flag, set);
        Ok(())
    }

    pub fn set_recon_info(&mut self, id: BufferId, info: ReconInfo) -> BufferResult<()> {
        let buffer = self
            .buffers
            .get_mut(&id)
            .ok_or(BufferError::UnknownBuffer(id))?;
        if buffer.kind != BufferKind::Recon {
            return Err(BufferError::UnknownBuffer(id));
        }
        buffer.recon = Some(info);
        Ok(())
    }

    /// Removes the `DEFERRED` flag from all buffers holding it and returns their ids.
    pub fn take_deferred(&mut self, port: Port) -> Vec<BufferId> {
        let mut deferred = Vec::new();
        for buffer in self.buffers.values_mut() {
            if buffer.kind == BufferKind::Frame(port)
                && buffer.flags.contains(BufferFlags::DEFERRED)
            {
                buffer.flags.remove(BufferFlags::DEFERRED);
                deferred.push(buffer.id);
            }
        }
        deferred
    }

    /// Hands every driver-owned buffer of internal `kind` to the firmware.
    pub fn submit_internal(&mut self, kind: BufferKind) -> BufferResult<Vec<BufferId>> {
        let ids = self
            .list(kind)
            .filter(|buffer| buffer.owner == Owner::Driver)
            .map(|buffer| buffer.id)
            .collect::<Vec<_>>();

        for id in &ids {
            self.transfer(*id, Owner::Driver, Owner::Firmware, RefChange::Take)?;
        }
        Ok(ids)
    }

    /// Takes back every firmware-owned buffer of internal `kind`.
    pub fn reclaim_internal(&mut self, kind: BufferKind) -> BufferResult<usize> {
        let ids = self
            .list(kind)
            .filter(|buffer| buffer.owner == Owner::Firmware)
            .map(|buffer| buffer.id)
            .collect::<Vec<_>>();

        for id in &ids {
            self.transfer(*id, Owner::Firmware, Owner::Driver, RefChange::Release)?;
        }
        Ok(ids.len())
    }

    /// Deregisters every buffer of internal `kind`.
    pub fn free_internal(&mut self, kind: BufferKind) -> BufferResult<usize> {
        let ids = self.list(kind).map(|buffer| buffer.id).collect::<Vec<_>>();
        for id in &ids {
            self.deregister(*id)?;
        }
        Ok(ids.len())
    }

    /// Forcibly ends every hand-off: frame buffers go to the client and internal buffers to the
    /// driver, and all references are dropped. Returns the number of buffers that were not where
    /// an orderly teardown would have left them.
    pub fn force_return_all(&mut self) -> usize {
        let mut moved = 0;
        for buffer in self.buffers.values_mut() {
            let target = if buffer.kind.is_internal() {
                Owner::Driver
            } else {
                Owner::Client
            };

            if buffer.owner != target || buffer.refcount > 0 {
                log::debug!(
                    "Forcing {:?} kind={:?} {:?} -> {target:?} refcount={}",
                    buffer.id,
                    buffer.kind,
                    buffer.owner,
                    buffer.refcount
                );
                moved += 1;
            }

            self.owned[buffer.owner.index()] -= 1;
            self.owned[target.index()] += 1;
            buffer.owner = target;
            buffer.refcount = 0;
            buffer.flags = Default::default();
        }
        moved
    }

    /// Iterates over the buffers of `kind`.
    pub fn list(&self, kind: BufferKind) -> impl Iterator<Item = &TrackedBuffer> {
        self.buffers
            .values()
            .filter(move |buffer| buffer.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedBuffer> {
        self.buffers.values()
    }

    /// Number of buffers held by `owner`.
    pub fn count(&self, owner: Owner) -> usize {
        self.owned[owner.index()]
    }

    /// Number of frame buffers submitted to the firmware and not returned yet.
    pub fn outstanding(&self) -> usize {
        self.buffers
            .values()
            .filter(|buffer| !buffer.kind.is_internal() && buffer.owner == Owner::Firmware)
            .count()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buf_count(&self) -> BufCount {
        self.count
    }

    /// Checks that the per-owner counts match the buffers and add up to the registered set.
    pub fn check_conservation(&self) -> bool {
        let mut actual = [0usize; 3];
        for buffer in self.buffers.values() {
            actual[buffer.owner.index()] += 1;
        }

        actual == self.owned && self.owned.iter().sum::<usize>() == self.buffers.len()
    }
}

impl Drop for BufferTracker {
    fn drop(&mut self) {
        for buffer in self.buffers.values() {
            if buffer.owner == Owner::Firmware {
                log::warn!(
                    "Freeing {:?} kind={:?} still owned by the firmware",
                    buffer.id,
                    buffer.kind
                );
            }
            self.allocator.free(buffer.handle);
        }
    }
}
