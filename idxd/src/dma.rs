//! Host buffers and device-address mapping.
//!
//! The benchmark treats memory allocation and virtual-to-device address
//! translation as collaborators behind [`HostAllocator`] and [`DmaMapper`].
//! Every acquisition is wrapped in a guard ([`HostBuffer`], [`DmaMapping`])
//! that releases it on drop, so a sequence of guards declared in acquisition
//! order is released in exactly the reverse order.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Device-visible address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DmaAddr(pub u64);

impl std::fmt::LowerHex for DmaAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

/// DMA transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    Bidirectional,
    ToDevice,
    FromDevice,
}

// =============================================================================
// Host memory
// =============================================================================

/// Allocator for host buffers that will be mapped for device access.
pub trait HostAllocator: Send + Sync {
    /// Allocate `layout.size()` zeroed bytes.
    fn alloc(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// Release memory returned by [`alloc`](Self::alloc).
    ///
    /// # Safety
    /// `ptr` must come from `alloc` on this allocator with the same layout.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Global-allocator backed [`HostAllocator`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl HostAllocator for SystemAllocator {
    fn alloc(&self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.size() == 0 {
            return Err(Error::InvalidArgument("zero-sized host buffer".into()));
        }
        // SAFETY: non-zero size checked above.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(Error::OutOfMemory { size: layout.size() })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

/// Owned, zero-initialized host buffer. Freed on drop.
pub struct HostBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    allocator: Arc<dyn HostAllocator>,
}

unsafe impl Send for HostBuffer {}

impl HostBuffer {
    /// Cache-line alignment used for transfer buffers.
    pub const ALIGN: usize = 64;

    pub fn new(allocator: Arc<dyn HostAllocator>, size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, Self::ALIGN)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let ptr = allocator.alloc(layout)?;
        Ok(Self {
            ptr,
            layout,
            allocator,
        })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn fill(&mut self, pattern: u8) {
        self.as_mut_slice().fill(pattern);
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        unsafe { self.allocator.free(self.ptr, self.layout) };
    }
}

// =============================================================================
// Device mapping
// =============================================================================

/// Host-to-device address translation.
///
/// Mappings must be released in strict LIFO order relative to creation;
/// [`DmaMapping`] guards make that the natural drop order.
pub trait DmaMapper: Send + Sync {
    /// Map a host buffer for device access.
    fn map_single(&self, host: NonNull<u8>, len: usize, dir: DmaDirection) -> Result<DmaAddr>;

    /// Map a fixed hardware resource window (e.g. a peer device BAR) by
    /// physical address.
    fn map_resource(&self, phys: u64, len: usize, dir: DmaDirection) -> Result<DmaAddr>;

    fn unmap_single(&self, addr: DmaAddr, len: usize, dir: DmaDirection);

    fn unmap_resource(&self, addr: DmaAddr, len: usize, dir: DmaDirection);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MappingKind {
    Single,
    Resource,
}

/// A live device mapping. Unmapped on drop.
pub struct DmaMapping {
    mapper: Arc<dyn DmaMapper>,
    addr: DmaAddr,
    len: usize,
    dir: DmaDirection,
    kind: MappingKind,
}

impl DmaMapping {
    /// Map `len` bytes at `host`.
    ///
    /// The memory must stay allocated and must not move while the mapping
    /// lives.
    pub fn single(
        mapper: Arc<dyn DmaMapper>,
        host: NonNull<u8>,
        len: usize,
        dir: DmaDirection,
    ) -> Result<Self> {
        let addr = mapper.map_single(host, len, dir)?;
        Ok(Self {
            mapper,
            addr,
            len,
            dir,
            kind: MappingKind::Single,
        })
    }

    /// Map `len` bytes of the resource window at physical address `phys`.
    pub fn resource(
        mapper: Arc<dyn DmaMapper>,
        phys: u64,
        len: usize,
        dir: DmaDirection,
    ) -> Result<Self> {
        let addr = mapper.map_resource(phys, len, dir)?;
        Ok(Self {
            mapper,
            addr,
            len,
            dir,
            kind: MappingKind::Resource,
        })
    }

    pub fn addr(&self) -> DmaAddr {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        match self.kind {
            MappingKind::Single => self.mapper.unmap_single(self.addr, self.len, self.dir),
            MappingKind::Resource => self.mapper.unmap_resource(self.addr, self.len, self.dir),
        }
    }
}

// =============================================================================
// Shared virtual addressing
// =============================================================================

enum WindowBacking {
    Mmap,
    Heap(Layout),
}

/// A physical resource window made addressable to the process.
///
/// With shared virtual addressing the device walks the process page tables,
/// so a window mapped into the address space is device-visible at its
/// virtual address.
pub struct ResourceWindow {
    phys_base: u64,
    len: usize,
    va: NonNull<u8>,
    backing: WindowBacking,
}

unsafe impl Send for ResourceWindow {}
unsafe impl Sync for ResourceWindow {}

impl ResourceWindow {
    /// Map `len` bytes of a resource file (e.g.
    /// `/sys/bus/pci/devices/<bdf>/resource1`) whose offset 0 corresponds
    /// to physical address `phys_base`.
    pub fn open(path: &std::path::Path, phys_base: u64, len: usize) -> Result<Self> {
        use std::os::fd::AsRawFd;

        window_end(phys_base, len)?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Resource {
                path: path.display().to_string(),
                source: e,
            })?;
        let va = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if va == libc::MAP_FAILED {
            return Err(Error::Resource {
                path: path.display().to_string(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self {
            phys_base,
            len,
            // mmap never returns null on success.
            va: NonNull::new(va as *mut u8).ok_or(Error::OutOfMemory { size: len })?,
            backing: WindowBacking::Mmap,
        })
    }

    /// Heap memory standing in for a resource window, for the software
    /// device.
    pub fn emulated(phys_base: u64, len: usize) -> Result<Self> {
        window_end(phys_base, len)?;
        let layout = Layout::from_size_align(len.max(1), 4096)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        Ok(Self {
            phys_base,
            len,
            va: NonNull::new(ptr).ok_or(Error::OutOfMemory { size: len })?,
            backing: WindowBacking::Heap(layout),
        })
    }

    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Translate a physical range inside the window.
    fn translate(&self, phys: u64, len: usize) -> Result<DmaAddr> {
        let end = phys.checked_add(len as u64);
        let window_end = self.phys_base.checked_add(self.len as u64);
        match (end, window_end) {
            (Some(end), Some(window_end)) if phys >= self.phys_base && end <= window_end => {
                Ok(DmaAddr(self.va.as_ptr() as u64 + (phys - self.phys_base)))
            }
            _ => Err(Error::WindowOutOfRange { phys, len }),
        }
    }
}

/// End of a physical window, if it fits the address space.
fn window_end(phys_base: u64, len: usize) -> Result<u64> {
    phys_base
        .checked_add(len as u64)
        .ok_or(Error::WindowOutOfRange { phys: phys_base, len })
}

impl Drop for ResourceWindow {
    fn drop(&mut self) {
        match self.backing {
            WindowBacking::Mmap => unsafe {
                libc::munmap(self.va.as_ptr() as *mut libc::c_void, self.len);
            },
            WindowBacking::Heap(layout) => unsafe {
                std::alloc::dealloc(self.va.as_ptr(), layout);
            },
        }
    }
}

/// [`DmaMapper`] for shared virtual addressing (PASID-enabled work queues).
///
/// Host buffers are device-visible at their virtual address. Resource
/// ranges are translated through an optional [`ResourceWindow`].
#[derive(Default)]
pub struct SvaMapper {
    window: Option<ResourceWindow>,
}

impl SvaMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(window: ResourceWindow) -> Self {
        Self {
            window: Some(window),
        }
    }

    pub fn window(&self) -> Option<&ResourceWindow> {
        self.window.as_ref()
    }
}

impl DmaMapper for SvaMapper {
    fn map_single(&self, host: NonNull<u8>, _len: usize, _dir: DmaDirection) -> Result<DmaAddr> {
        Ok(DmaAddr(host.as_ptr() as u64))
    }

    fn map_resource(&self, phys: u64, len: usize, _dir: DmaDirection) -> Result<DmaAddr> {
        match &self.window {
            Some(w) => w.translate(phys, len),
            None => Err(Error::WindowOutOfRange { phys, len }),
        }
    }

    fn unmap_single(&self, _addr: DmaAddr, _len: usize, _dir: DmaDirection) {}

    fn unmap_resource(&self, _addr: DmaAddr, _len: usize, _dir: DmaDirection) {}
}
