use std::sync::Arc;

use tether_mem::{ModuleAllocator, ModuleInstance};
use tracing::debug;

use crate::error::{BootstrapError, Result};
use crate::launcher::{SpawnRequest, ThreadLauncher};

/// Call stack reserved for every spawned thread.
pub const DEFAULT_STACK_SIZE: u32 = 2 << 20;

/// Thread regions are sized and aligned to 64 bits.
pub const REGION_ALIGN: u32 = 8;

const MIN_STACK_SIZE: u32 = 2 * REGION_ALIGN;

/// Where a context is in the bootstrap protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Unbootstrapped,
    MainInitialized,
    AllocatedOnExistingThread,
    InitializedOnNewThread,
}

/// Bytes needed for a TLS block plus a stack, rounded up to [`REGION_ALIGN`].
pub fn region_size(tls_size: u32, stack_size: u32) -> Result<u32> {
    if stack_size < MIN_STACK_SIZE {
        return Err(BootstrapError::StackTooSmall(stack_size));
    }
    tls_size
        .checked_add(stack_size)
        .and_then(|n| n.checked_add(REGION_ALIGN - 1))
        .map(|n| n / REGION_ALIGN * REGION_ALIGN)
        .ok_or(BootstrapError::RegionTooLarge {
            tls_size,
            stack_size,
        })
}

/// A context whose thread-local storage is set up, so it may run module code and allocate.
pub struct InitializedThread<I> {
    module: Arc<dyn ModuleAllocator>,
    instance: I,
    tls_base: u32,
    state: BootstrapState,
    stack_size: u32,
}

impl<I: ModuleInstance> InitializedThread<I> {
    /// Bootstrap the main context. Its stack already exists, so only TLS is allocated.
    pub fn init_main(module: Arc<dyn ModuleAllocator>, mut instance: I) -> Result<Self> {
        let tls_base = module.alloc_message(module.tls_size())?;
        if let Err(err) = instance.init_tls(tls_base) {
            module.dealloc_message(tls_base)?;
            return Err(err.into());
        }
        debug!(tls_base, "initialized main thread");
        Ok(Self {
            module,
            instance,
            tls_base,
            state: BootstrapState::MainInitialized,
            stack_size: DEFAULT_STACK_SIZE,
        })
    }

    /// Stack size given to threads spawned from this one.
    pub fn with_stack_size(mut self, stack_size: u32) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    pub fn tls_base(&self) -> u32 {
        self.tls_base
    }

    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    pub fn module(&self) -> &Arc<dyn ModuleAllocator> {
        &self.module
    }

    pub fn instance(&self) -> &I {
        &self.instance
    }

    pub fn instance_mut(&mut self) -> &mut I {
        &mut self.instance
    }

    /// Allocate TLS and stack for a thread that is about to be spawned.
    pub fn allocate_for_spawn(&self) -> Result<ThreadRegion> {
        let tls_size = self.module.tls_size();
        let size = region_size(tls_size, self.stack_size)?;
        let ptr = self.module.alloc_message(size)?;
        debug!(ptr, size, "allocated thread region");
        Ok(ThreadRegion {
            ptr,
            size,
            tls_size,
        })
    }

    /// Allocate a region and hand it, with the function to run, to `launcher`.
    pub fn spawn(&self, launcher: &dyn ThreadLauncher, ctx_ptr: u32) -> Result<()> {
        let region = self.allocate_for_spawn()?;
        launcher.launch(SpawnRequest { ctx_ptr, region })
    }

    pub fn run_function_pointer(&mut self, ctx_ptr: u32) -> Result<()> {
        self.instance.run_function_pointer(ctx_ptr)?;
        Ok(())
    }
}

/// TLS plus stack for one spawned thread: TLS at the base, the stack growing down from the top.
///
/// The region is never freed, even after its thread exits.
#[derive(Debug, PartialEq, Eq)]
pub struct ThreadRegion {
    ptr: u32,
    size: u32,
    tls_size: u32,
}

impl ThreadRegion {
    /// Rebuild a region sent over from the context that allocated it.
    ///
    /// The parts should come from [`ThreadRegion::into_parts`], and each region may be adopted
    /// by only one thread. Parts that cannot describe an aligned TLS block plus a stack inside
    /// a memory of `memory_len` bytes are rejected.
    pub fn from_parts(ptr: u32, size: u32, tls_size: u32, memory_len: usize) -> Result<Self> {
        let holds_stack = tls_size
            .checked_add(MIN_STACK_SIZE)
            .is_some_and(|min| size >= min);
        let in_memory = u64::from(ptr) + u64::from(size) <= memory_len as u64;
        if !holds_stack || !in_memory || ptr % REGION_ALIGN != 0 {
            return Err(BootstrapError::InvalidRegion {
                ptr,
                size,
                tls_size,
            });
        }
        Ok(Self {
            ptr,
            size,
            tls_size,
        })
    }

    /// `(ptr, size, tls_size)`.
    pub fn into_parts(self) -> (u32, u32, u32) {
        (self.ptr, self.size, self.tls_size)
    }

    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn state(&self) -> BootstrapState {
        BootstrapState::AllocatedOnExistingThread
    }

    /// Initial stack pointer, one aligned slot below the end of the region.
    pub fn stack_top(&self) -> u32 {
        self.ptr + self.size - REGION_ALIGN
    }

    /// Adopt the region on the new thread. Must run before any module code on that thread.
    pub fn initialize_on_new_thread<I: ModuleInstance>(
        self,
        module: Arc<dyn ModuleAllocator>,
        mut instance: I,
    ) -> Result<InitializedThread<I>> {
        instance.set_stack_pointer(self.stack_top());
        instance.init_tls(self.ptr)?;
        debug!(tls_base = self.ptr, stack_top = self.stack_top(), "initialized spawned thread");
        Ok(InitializedThread {
            module,
            instance,
            tls_base: self.ptr,
            state: BootstrapState::InitializedOnNewThread,
            stack_size: self.size - self.tls_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_mem::host_module::MAIN_STACK_BYTES;
    use tether_mem::{HostModule, LinearMemory};

    fn module(tls_size: u32) -> Arc<HostModule> {
        HostModule::new(LinearMemory::new(1 << 20).unwrap(), tls_size).unwrap()
    }

    #[test]
    fn region_size_rounds_up_to_eight() {
        assert_eq!(region_size(0, 16).unwrap(), 16);
        assert_eq!(region_size(13, 1024).unwrap(), 1040);
        assert_eq!(region_size(16, 1024).unwrap(), 1040);
        assert!(matches!(
            region_size(u32::MAX - 4, 16),
            Err(BootstrapError::RegionTooLarge { .. })
        ));
        assert!(matches!(
            region_size(0, 4),
            Err(BootstrapError::StackTooSmall(4))
        ));
    }

    #[test]
    fn main_thread_only_gets_tls() {
        let m = module(24);
        let before = m.live_allocations();
        let main = InitializedThread::init_main(m.clone(), m.main_instance()).unwrap();
        assert_eq!(main.state(), BootstrapState::MainInitialized);
        assert_eq!(m.live_allocations(), before + 1);
        assert_eq!(main.instance().tls_base(), Some(main.tls_base()));
        // The main context keeps the stack it started with.
        assert!(main.instance().stack_pointer() > MAIN_STACK_BYTES);
    }

    #[test]
    fn spawned_thread_adopts_its_region() {
        let m = module(20);
        let main = InitializedThread::init_main(m.clone(), m.main_instance())
            .unwrap()
            .with_stack_size(4096);

        let region = main.allocate_for_spawn().unwrap();
        assert_eq!(region.state(), BootstrapState::AllocatedOnExistingThread);
        assert_eq!(region.size(), 4120);
        assert_eq!(region.ptr() % REGION_ALIGN, 0);
        assert_eq!(region.stack_top(), region.ptr() + 4112);
        let (ptr, top) = (region.ptr(), region.stack_top());

        let thread = region
            .initialize_on_new_thread(m.clone(), m.new_instance())
            .unwrap();
        assert_eq!(thread.state(), BootstrapState::InitializedOnNewThread);
        assert_eq!(thread.tls_base(), ptr);
        assert_eq!(thread.instance().stack_pointer(), top);
        assert_eq!(thread.stack_size(), 4100);
        assert!(m.is_live_allocation(ptr));
    }

    #[test]
    fn regions_from_parts_must_fit_memory_and_hold_a_stack() {
        let region = ThreadRegion::from_parts(0x8000, 4120, 24, 1 << 20).unwrap();
        assert_eq!(region.stack_top(), 0x8000 + 4112);

        for (ptr, size, tls_size) in [
            (0x8000, 16, 24),
            (0x8000, 0, 0),
            (0x8000, 64, u32::MAX),
            (0x8004, 4120, 24),
            ((1 << 20) - 8, 4120, 24),
            (u32::MAX - 7, 16, 0),
        ] {
            assert!(
                matches!(
                    ThreadRegion::from_parts(ptr, size, tls_size, 1 << 20),
                    Err(BootstrapError::InvalidRegion { .. })
                ),
                "accepted ({ptr:#x}, {size}, {tls_size})"
            );
        }
    }

    #[test]
    fn function_pointers_run_once_on_spawned_threads() {
        let m = module(8);
        let ctx = m.register_function(|_| {}).unwrap();
        let main = InitializedThread::init_main(m.clone(), m.main_instance()).unwrap();
        let region = main.allocate_for_spawn().unwrap();
        let mut thread = region
            .initialize_on_new_thread(m.clone(), m.new_instance())
            .unwrap();
        thread.run_function_pointer(ctx).unwrap();
        assert!(matches!(
            thread.run_function_pointer(ctx),
            Err(BootstrapError::Module(_))
        ));
    }
}
