use super::{out_of_memory, Error};
use std::{
    alloc::{alloc, dealloc, Layout},
    ptr::NonNull,
};

/// 内存对齐，覆盖主流 SIMD 宽度和缓存行。
pub const ALIGNMENT: usize = 64;

/// 按 [ALIGNMENT] 对齐的主机存储区域。
pub(crate) struct Blob {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Blob {}
unsafe impl Sync for Blob {}

impl Blob {
    pub fn new(size: usize) -> Result<Self, Error> {
        let layout = layout(size)?;
        match NonNull::new(unsafe { alloc(layout) }) {
            Some(ptr) => Ok(Self { ptr, len: size }),
            None => Err(out_of_memory(format!("failed to allocate {size} bytes"))),
        }
    }

    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Blob {
    #[inline]
    fn drop(&mut self) {
        let &mut Blob { ptr, len } = self;
        if let Ok(layout) = layout(len) {
            unsafe { dealloc(ptr.as_ptr(), layout) }
        }
    }
}

#[inline]
fn layout(size: usize) -> Result<Layout, Error> {
    Layout::from_size_align(size.max(1), ALIGNMENT)
        .map_err(|_| out_of_memory(format!("{size} bytes exceeds the address space")))
}
