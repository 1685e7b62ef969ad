use super::{invalid_argument, Error, Image, ImageDesc, Tensor, TensorDesc};
use std::{collections::BTreeMap, ptr::NonNull};

/// 存储类别，决定哪些处理器可以访问一块存储。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Storage {
    /// 未知或不属于本设备，不是合法的分配目标，分配时按 [Storage::Host] 处理。
    Undefined,
    /// 主机驻留的锁页存储，加速器可能直接访问。
    Host,
    /// 仅加速器可访问，主机不得访问。
    Device,
    /// 主机和加速器均可访问，运行时可能迁移页面。
    Managed,
}

impl TryFrom<u32> for Storage {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Undefined),
            1 => Ok(Self::Host),
            2 => Ok(Self::Device),
            3 => Ok(Self::Managed),
            _ => Err(invalid_argument(format!("invalid storage mode {value}"))),
        }
    }
}

/// 引擎分配的存储区域。
///
/// 所有权属于分配它的引擎，必须通过同一个引擎释放。没有析构释放。
#[must_use]
#[derive(Debug)]
pub struct Allocation {
    ptr: NonNull<u8>,
    len: usize,
    storage: Storage,
}

unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    #[inline]
    pub(crate) fn new(ptr: NonNull<u8>, len: usize, storage: Storage) -> Self {
        Self { ptr, len, storage }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 分配时请求的存储类别。
    #[inline]
    pub fn storage(&self) -> Storage {
        self.storage
    }

    /// 在 `offset` 处按 `desc` 解释为图像，越界时报错。
    pub fn image(&self, offset: usize, desc: ImageDesc) -> Result<Image, Error> {
        self.check_range("image", offset, desc.byte_size())?;
        Ok(unsafe { Image::new(self.as_mut_ptr().add(offset), desc) })
    }

    /// 在 `offset` 处按 `desc` 解释为张量，越界时报错。
    pub fn tensor(&self, offset: usize, desc: TensorDesc) -> Result<Tensor, Error> {
        self.check_range("tensor", offset, desc.byte_size())?;
        Ok(unsafe { Tensor::new(self.as_mut_ptr().add(offset), desc) })
    }

    fn check_range(&self, what: &str, offset: usize, size: usize) -> Result<(), Error> {
        match offset.checked_add(size) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(invalid_argument(format!(
                "{what} of {size} bytes at offset {offset} exceeds allocation of {} bytes",
                self.len
            ))),
        }
    }
}

/// 按起始地址索引的分配记录，支持查询区间内部地址。
#[derive(Debug)]
pub(crate) struct AllocTable<T>(BTreeMap<usize, (usize, T)>);

impl<T> Default for AllocTable<T> {
    #[inline]
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<T> AllocTable<T> {
    #[inline]
    pub fn insert(&mut self, ptr: NonNull<u8>, len: usize, value: T) {
        self.0.insert(ptr.as_ptr() as usize, (len, value));
    }

    /// 按起始地址移除记录。
    #[inline]
    pub fn remove(&mut self, ptr: NonNull<u8>) -> Option<(usize, T)> {
        self.0.remove(&(ptr.as_ptr() as usize))
    }

    /// 查找包含 `ptr` 的记录。
    pub fn find(&self, ptr: *const u8) -> Option<&T> {
        let addr = ptr as usize;
        let (&start, (len, value)) = self.0.range(..=addr).next_back()?;
        (addr < start + (*len).max(1)).then_some(value)
    }

    #[inline]
    pub fn retain(&mut self, mut f: impl FnMut(&T) -> bool) {
        self.0.retain(|_, (_, value)| f(value))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod test {
    use super::{AllocTable, Storage};
    use crate::ErrorKind;
    use std::ptr::NonNull;

    #[test]
    fn test_raw_storage() {
        assert_eq!(Storage::try_from(0).unwrap(), Storage::Undefined);
        assert_eq!(Storage::try_from(2).unwrap(), Storage::Device);
        let err = Storage::try_from(7).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_table_interior() {
        let mut buf = [0u8; 64];
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        let mut table = AllocTable::default();
        table.insert(base, 32, Storage::Managed);

        assert_eq!(table.find(base.as_ptr()), Some(&Storage::Managed));
        assert_eq!(table.find(unsafe { base.as_ptr().add(31) }), Some(&Storage::Managed));
        assert_eq!(table.find(unsafe { base.as_ptr().add(32) }), None);
        assert_eq!(table.remove(base).map(|(len, _)| len), Some(32));
        assert_eq!(table.len(), 0);
    }
}
