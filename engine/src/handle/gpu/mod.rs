//! 加速器后端。
//!
//! 底层驱动绑定通过 [Driver] 接入；[soft] 提供一个软件实现的参考设备。

pub mod soft;

use crate::{
    conv::gpu::{Scheme, SchemeKey},
    invalid_argument,
    stream::Queue,
    Allocation, Error, SchemeCacheSize, SchemeDiversity, Storage,
};
use lru::LruCache;
use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc, Mutex,
    },
};

/// 设备队列上执行的工作。
pub type Job = Box<dyn FnOnce() + Send>;

/// 加速器架构。
///
/// 只用于在功能等价、性能不同的算子实现之间选择，不改变算子的数值约定。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Arch {
    /// 未识别的架构，使用基线实现。
    Unknown,
    Gen9,
    XeLp,
    /// 带 8 深度矩阵单元。
    XeHpg,
    /// 带 16 深度矩阵单元。
    XeHpc,
}

/// 统一共享内存的分配类型。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Usm {
    Host,
    Device,
    Shared,
}

/// 平台内的物理设备标识。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DeviceId(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PointerInfo {
    pub usm: Usm,
    /// 分配所在的设备。
    pub device: DeviceId,
}

/// 已打开的加速器上下文和队列。
///
/// 由外部的驱动绑定层实现。一个实现对应一个物理设备和一条按序执行的队列。
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;
    fn id(&self) -> DeviceId;
    fn arch(&self) -> Arch;
    /// 工作组的最大工作项数。
    fn max_work_group_size(&self) -> usize;

    fn malloc(&self, size: usize, usm: Usm) -> Result<NonNull<u8>, Error>;
    fn free(&self, ptr: NonNull<u8>) -> Result<(), Error>;
    /// 查询地址所属的分配；不属于平台上任何分配时返回 `None`。
    fn pointer_info(&self, ptr: *const u8) -> Option<PointerInfo>;

    /// 在设备队列上复制，只能在队列上的工作中调用。
    ///
    /// # Safety
    ///
    /// 两个区域都必须是设备可访问的有效存储。
    unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<(), Error>;

    /// 将工作追加到设备队列，按追加顺序执行。不阻塞。
    fn enqueue(&self, job: Job);
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub scheme_cache: SchemeCacheSize,
}

/// 加速器引擎的硬件句柄。
pub struct Gpu {
    driver: Arc<dyn Driver>,
    arch: Arch,
    max_work_group_size: usize,
    conv_schemes: Mutex<LruCache<SchemeKey, Scheme>>,
    fallback_warned: AtomicBool,
}

impl Gpu {
    pub(crate) fn new(driver: Arc<dyn Driver>, config: &Config) -> Self {
        // 设备生命周期内不变，只查询一次
        let arch = driver.arch();
        let max_work_group_size = driver.max_work_group_size();
        Self {
            driver,
            arch,
            max_work_group_size,
            conv_schemes: config.scheme_cache.new_cache(SchemeDiversity::Medium),
            fallback_warned: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    #[inline]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    #[inline]
    pub fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    #[inline]
    pub(crate) fn queue(&self) -> Queue {
        Queue::Device(self.driver.clone())
    }

    pub(crate) fn malloc(&self, size: usize, storage: Storage) -> Result<Allocation, Error> {
        let usm = match storage {
            Storage::Undefined | Storage::Host => Usm::Host,
            Storage::Device => Usm::Device,
            Storage::Managed => Usm::Shared,
        };
        let ptr = self.driver.malloc(size, usm)?;
        let storage = match storage {
            Storage::Undefined => Storage::Host,
            s => s,
        };
        Ok(Allocation::new(ptr, size, storage))
    }

    pub(crate) fn free(&self, alloc: Allocation) -> Result<(), Error> {
        let ptr = NonNull::new(alloc.as_mut_ptr())
            .ok_or_else(|| invalid_argument("freeing null allocation"))?;
        self.driver.free(ptr)
    }

    pub(crate) fn pointer_storage(&self, ptr: *const u8) -> Storage {
        match self.driver.pointer_info(ptr) {
            Some(PointerInfo { usm: Usm::Host, .. }) => Storage::Host,
            Some(PointerInfo {
                usm: Usm::Device,
                device,
            }) if device == self.driver.id() => Storage::Device,
            Some(PointerInfo { usm: Usm::Shared, .. }) => Storage::Managed,
            _ => Storage::Undefined,
        }
    }

    /// 分配算子私有的设备存储。
    pub(crate) fn scratch(&self, size: usize) -> Result<Scratch, Error> {
        let ptr = self.driver.malloc(size, Usm::Device)?;
        Ok(Scratch {
            driver: self.driver.clone(),
            ptr,
        })
    }

    /// 查询卷积发射方案，未命中时计算并缓存。
    pub(crate) fn conv_scheme(&self, key: SchemeKey, f: impl FnOnce() -> Scheme) -> Scheme {
        let mut cache = self.conv_schemes.lock().unwrap();
        if let Some(scheme) = cache.get(&key) {
            return *scheme;
        }
        log::debug!("conv scheme miss on {}: {key:?}", self.driver.name());
        *cache.get_or_insert(key, f)
    }

    /// 在未识别的架构上使用基线实现时提示一次。
    pub(crate) fn warn_fallback(&self, what: &str) {
        if self.arch == Arch::Unknown && !self.fallback_warned.swap(true, Relaxed) {
            log::warn!(
                "{}: architecture not recognized, {what} uses the baseline kernel",
                self.driver.name()
            )
        }
    }
}

/// 算子私有的设备存储，析构时归还驱动。
pub(crate) struct Scratch {
    driver: Arc<dyn Driver>,
    ptr: NonNull<u8>,
}

unsafe impl Send for Scratch {}
unsafe impl Sync for Scratch {}

impl Scratch {
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Err(e) = self.driver.free(self.ptr) {
            log::warn!("{}: failed to release scratch: {e}", self.driver.name())
        }
    }
}
