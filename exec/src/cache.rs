use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info};
use xlat_backend::{Helper, NativePcResolver};
use xlat_core::{GuestRegs, Result, XlatConfig, XlatError};

use crate::block::TranslatedBlock;
use crate::icache::IcacheSlots;

#[derive(Default)]
struct Inner {
    by_pc: HashMap<u32, Arc<TranslatedBlock>>,
    /// Keyed by entry address.
    by_host: BTreeMap<usize, Arc<TranslatedBlock>>,
}

/// Guest-address to compiled-block map shared by every compiler and
/// executor of one guest.
///
/// Blocks are never mutated once inserted. A replaced or invalidated
/// block moves to the retired list and stays mapped until
/// [`collect_retired`](Self::collect_retired) runs at a point where no
/// thread can be executing it.
pub struct TranslationCache {
    inner: RwLock<Inner>,
    retired: Mutex<Vec<Arc<TranslatedBlock>>>,
    icache: IcacheSlots,
    used_bytes: AtomicUsize,
    capacity: usize,
}

impl TranslationCache {
    /// `insn_width` sets the ICache slot granularity.
    pub fn new(config: &XlatConfig, insn_width: u32) -> Self {
        assert!(insn_width.is_power_of_two(), "instruction width must be a power of two");
        Self {
            inner: RwLock::new(Inner::default()),
            retired: Mutex::new(Vec::new()),
            icache: IcacheSlots::new(
                config.icache_base,
                config.icache_size,
                insn_width.trailing_zeros() as u8,
            ),
            used_bytes: AtomicUsize::new(0),
            capacity: config.cache_capacity,
        }
    }

    pub fn icache(&self) -> &IcacheSlots {
        &self.icache
    }

    /// Publish `block`. A block already cached at the same address is
    /// replaced and returned (it is retired, not freed).
    pub fn insert(&self, block: Arc<TranslatedBlock>) -> Option<Arc<TranslatedBlock>> {
        let pc = block.guest_start_pc;
        let mut inner = self.inner.write();
        self.used_bytes.fetch_add(block.code_size(), Ordering::Relaxed);
        inner
            .by_host
            .insert(block.entry_point() as usize, Arc::clone(&block));
        let old = inner.by_pc.insert(pc, Arc::clone(&block));
        self.icache.set(pc, block.entry_point());
        if let Some(old) = &old {
            inner.by_host.remove(&(old.entry_point() as usize));
            self.retire(Arc::clone(old));
        }
        old
    }

    pub fn lookup(&self, pc: u32) -> Option<Arc<TranslatedBlock>> {
        self.inner.read().by_pc.get(&pc).cloned()
    }

    /// Entry point for `pc`, or null on a miss.
    pub fn lookup_entry(&self, pc: u32) -> *const u8 {
        let hit = self.icache.get(pc);
        if !hit.is_null() {
            return hit;
        }
        match self.inner.read().by_pc.get(&pc) {
            Some(block) => block.entry_point(),
            None => ptr::null(),
        }
    }

    /// Drop every block overlapping the guest range. Returns how many
    /// were removed.
    pub fn invalidate(&self, range: Range<u32>) -> usize {
        let mut inner = self.inner.write();
        let doomed: Vec<u32> = inner
            .by_pc
            .values()
            .filter(|b| b.overlaps(&range))
            .map(|b| b.guest_start_pc)
            .collect();
        for pc in &doomed {
            if let Some(block) = inner.by_pc.remove(pc) {
                inner.by_host.remove(&(block.entry_point() as usize));
                self.icache.clear(*pc);
                self.retire(block);
            }
        }
        self.icache.clear_range(range.clone());
        if !doomed.is_empty() {
            info!(start = range.start, end = range.end, blocks = doomed.len(), "invalidated");
        }
        doomed.len()
    }

    /// Drop every block.
    pub fn flush(&self) {
        let mut inner = self.inner.write();
        let count = inner.by_pc.len();
        inner.by_host.clear();
        self.icache.clear_all();
        for (_, block) in inner.by_pc.drain() {
            self.retire(block);
        }
        info!(blocks = count, "translation cache flushed");
    }

    fn retire(&self, block: Arc<TranslatedBlock>) {
        self.used_bytes.fetch_sub(block.code_size(), Ordering::Relaxed);
        self.retired.lock().push(block);
    }

    /// Free retired blocks. Only call when no thread is inside
    /// generated code obtained from this cache before the call.
    pub fn collect_retired(&self) -> usize {
        let drained = std::mem::take(&mut *self.retired.lock());
        drained.len()
    }

    pub fn retired_len(&self) -> usize {
        self.retired.lock().len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_pc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host-code bytes held by live blocks.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn has_room(&self, bytes: usize) -> bool {
        self.used_bytes() + bytes <= self.capacity
    }

    /// Block (live or retired) whose code contains host address `ip`.
    pub fn block_at_host(&self, ip: usize) -> Option<Arc<TranslatedBlock>> {
        let live = self
            .inner
            .read()
            .by_host
            .range(..=ip)
            .next_back()
            .map(|(_, b)| Arc::clone(b))
            .filter(|b| b.contains_host(ip));
        live.or_else(|| {
            self.retired
                .lock()
                .iter()
                .find(|b| b.contains_host(ip))
                .cloned()
        })
    }

    /// Guest PC of the instruction whose code contains host address `ip`.
    pub fn resolve_native_pc(&self, ip: usize) -> Option<u32> {
        self.block_at_host(ip)?.guest_pc_at(ip)
    }

    /// Guest PC of the instruction that made the call returning to `ret`.
    pub fn resolve_return_address(&self, ret: usize) -> Option<u32> {
        self.block_at_host(ret)?.guest_pc_at_return(ret)
    }

    /// Guest PC of the instruction that called into the current helper.
    ///
    /// Must be called from a helper running on behalf of a block that
    /// was entered with `regs`. Failure means a host trap happened
    /// outside translated code, which callers must treat as fatal.
    #[inline(never)]
    pub fn current_guest_pc(
        &self,
        resolver: &NativePcResolver,
        regs: *const GuestRegs,
    ) -> Result<u32> {
        let ip = resolver.find(regs as usize, |ip| self.block_at_host(ip).is_some());
        match ip.and_then(|ip| self.resolve_return_address(ip)) {
            Some(pc) => Ok(pc),
            None => {
                error!(ip = ?ip, strategy = ?resolver.strategy(), "host trap outside translated code");
                Err(XlatError::NativePcNotFound { ip })
            }
        }
    }

    /// The physical `resolve_block_by_address` helper bound to this
    /// cache. The cache must outlive every block that calls it.
    pub fn resolve_helper(&self) -> Helper {
        Helper::new(
            resolve_block_by_address as *const () as usize,
            self as *const TranslationCache as usize,
        )
    }
}

/// Dispatch helper called from block exits on an ICache miss.
extern "C" fn resolve_block_by_address(cache: *const TranslationCache, pc: u32) -> *const u8 {
    // SAFETY: `cache` is the context baked in by `resolve_helper`.
    let cache = unsafe { &*cache };
    cache.lookup_entry(pc)
}
