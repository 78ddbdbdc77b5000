use std::{
    alloc::{alloc, dealloc, Layout},
    ptr::NonNull,
    slice::{from_raw_parts, from_raw_parts_mut},
};

/// 显存分配按 256 字节对齐，模拟时保持一致。
const ALIGN: usize = 256;

pub(crate) struct Blob {
    ptr: NonNull<u8>,
    len: usize,
}

// 裸指针独占其指向的堆内存。
unsafe impl Send for Blob {}
unsafe impl Sync for Blob {}

impl Blob {
    /// 分配 `size` 字节，`size` 不能为 0。
    pub fn new(size: usize) -> Option<Self> {
        assert_ne!(size, 0);
        let layout = Layout::from_size_align(size, ALIGN).ok()?;
        NonNull::new(unsafe { alloc(layout) }).map(|ptr| Self { ptr, len: size })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Blob {
    #[inline]
    fn drop(&mut self) {
        let &mut Blob { ptr, len } = self;
        unsafe { dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(len, ALIGN)) }
    }
}

#[test]
fn test_alignment() {
    for size in [1, 3, 255, 4096] {
        let mut blob = Blob::new(size).unwrap();
        assert_eq!(blob.as_ptr() as usize % ALIGN, 0);
        blob.as_mut_slice().fill(0xa5);
        assert!(blob.as_slice().iter().all(|&b| b == 0xa5));
        assert_eq!(blob.as_slice().len(), size);
    }
}
