// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{
    ffi::c_void,
    io,
    num::NonZeroUsize,
    ops::{Deref, DerefMut},
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use drm_fourcc::DrmFourcc;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use parking_lot::{Mutex, MutexGuard};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlaneMetadata {
    pub offset: u32,
    pub stride: u32,
}

/// A graphics buffer shared between the window system, the composer and
/// the display. Cloning is cheap and yields another handle to the same
/// memory.
#[derive(Clone)]
pub struct GraphicsBuffer(Arc<Inner>);

struct Inner {
    id: u64,
    width: u32,
    height: u32,
    format: DrmFourcc,
    planes: Vec<PlaneMetadata>,
    memory: Memory,
}

enum Memory {
    Heap(Mutex<Vec<u8>>),
    Dmabuf {
        fd: OwnedFd,
        ptr: NonNull<c_void>,
        len: usize,
        lock: Mutex<()>,
    },
}

// The mapping is only touched through `lock`.
unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl Drop for Memory {
    fn drop(&mut self) {
        if let Memory::Dmabuf { ptr, len, .. } = self {
            if let Err(err) = unsafe { munmap(*ptr, *len) } {
                tracing::error!(?err, "munmap failed");
            }
        }
    }
}

impl std::fmt::Debug for GraphicsBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsBuffer")
            .field("id", &self.0.id)
            .field("width", &self.0.width)
            .field("height", &self.0.height)
            .field("format", &self.0.format)
            .finish()
    }
}

impl PartialEq for GraphicsBuffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for GraphicsBuffer {}

impl GraphicsBuffer {
    /// Wraps CPU memory. The planes must fit inside `data`.
    pub fn from_heap(
        width: u32,
        height: u32,
        format: DrmFourcc,
        planes: Vec<PlaneMetadata>,
        data: Vec<u8>,
    ) -> Self {
        Self(Arc::new(Inner {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            format,
            planes,
            memory: Memory::Heap(Mutex::new(data)),
        }))
    }

    /// Maps a dmabuf for CPU access.
    pub fn from_dmabuf(
        width: u32,
        height: u32,
        format: DrmFourcc,
        planes: Vec<PlaneMetadata>,
        fd: OwnedFd,
        len: usize,
    ) -> io::Result<Self> {
        let Some(size) = NonZeroUsize::new(len) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-sized buffer",
            ));
        };

        let ptr = unsafe {
            mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };

        Ok(Self(Arc::new(Inner {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            format,
            planes,
            memory: Memory::Dmabuf {
                fd,
                ptr,
                len,
                lock: Mutex::new(()),
            },
        })))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn width(&self) -> u32 {
        self.0.width
    }

    pub fn height(&self) -> u32 {
        self.0.height
    }

    pub fn format(&self) -> DrmFourcc {
        self.0.format
    }

    pub fn planes(&self) -> &[PlaneMetadata] {
        &self.0.planes
    }

    /// The dmabuf backing the buffer, if there is one.
    pub fn dmabuf(&self) -> Option<BorrowedFd<'_>> {
        match &self.0.memory {
            Memory::Heap(_) => None,
            Memory::Dmabuf { fd, .. } => Some(fd.as_fd()),
        }
    }

    /// Locks the buffer for CPU access.
    pub fn lock(&self) -> MappedBuffer<'_> {
        match &self.0.memory {
            Memory::Heap(data) => MappedBuffer::Heap(data.lock()),
            Memory::Dmabuf { ptr, len, lock, .. } => MappedBuffer::Dmabuf {
                _guard: lock.lock(),
                data: unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr() as *mut u8, *len) },
            },
        }
    }
}

/// CPU access to a locked buffer.
pub enum MappedBuffer<'a> {
    Heap(MutexGuard<'a, Vec<u8>>),
    Dmabuf {
        _guard: MutexGuard<'a, ()>,
        data: &'a mut [u8],
    },
}

impl Deref for MappedBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            MappedBuffer::Heap(v) => v.as_slice(),
            MappedBuffer::Dmabuf { data, .. } => data,
        }
    }
}

impl DerefMut for MappedBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            MappedBuffer::Heap(v) => v.as_mut_slice(),
            MappedBuffer::Dmabuf { data, .. } => data,
        }
    }
}

pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, width: u32, height: u32, format: DrmFourcc) -> io::Result<GraphicsBuffer>;
}

/// Allocates buffers in regular memory. They can be composed into, but
/// only a fake display can scan them out.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, width: u32, height: u32, format: DrmFourcc) -> io::Result<GraphicsBuffer> {
        let (planes, len) = layout(format, width, height)?;
        Ok(GraphicsBuffer::from_heap(
            width,
            height,
            format,
            planes,
            vec![0; len],
        ))
    }
}

pub fn align(v: u32, to: u32) -> u32 {
    (v + to - 1) & !(to - 1)
}

/// Computes a tightly packed plane layout for a format, returning the
/// planes and the total size in bytes.
pub fn layout(
    format: DrmFourcc,
    width: u32,
    height: u32,
) -> io::Result<(Vec<PlaneMetadata>, usize)> {
    use DrmFourcc::*;

    let plane = |offset: u32, stride: u32| PlaneMetadata { offset, stride };

    let (planes, len) = match format {
        Abgr8888 | Xbgr8888 | Argb8888 | Xrgb8888 => {
            let stride = width * 4;
            (vec![plane(0, stride)], stride * height)
        }
        Rgb565 => {
            let stride = align(width * 2, 4);
            (vec![plane(0, stride)], stride * height)
        }
        Yvu420 | Yuv420 => {
            let y_stride = align(width, 16);
            let c_stride = align(width.div_ceil(2), 16);
            let y_len = y_stride * height;
            let c_len = c_stride * height.div_ceil(2);
            (
                vec![
                    plane(0, y_stride),
                    plane(y_len, c_stride),
                    plane(y_len + c_len, c_stride),
                ],
                y_len + c_len * 2,
            )
        }
        Nv12 | Nv16 => {
            let stride = align(width, 16);
            let y_len = stride * height;
            let c_height = if format == Nv12 {
                height.div_ceil(2)
            } else {
                height
            };
            (
                vec![plane(0, stride), plane(y_len, stride)],
                y_len + stride * c_height,
            )
        }
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("no layout for {format:?}"),
            ))
        }
    };

    Ok((planes, len as usize))
}
