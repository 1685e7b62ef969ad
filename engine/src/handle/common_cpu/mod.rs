//! CPU 后端：专用线程池和主机存储。

use crate::{
    execution_failed, invalid_argument, stream::Queue, AllocTable, Allocation, Blob, Error,
    Storage,
};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    ptr::NonNull,
    sync::{Arc, Mutex},
};

#[derive(Clone, Debug, Default)]
pub struct Config {
    /// 线程池线程数，0 表示每个逻辑核一个线程。
    pub num_threads: usize,
}

/// CPU 引擎的硬件句柄。
pub struct Cpu {
    pool: Arc<ThreadPool>,
    table: Mutex<AllocTable<(Blob, Storage)>>,
}

impl Cpu {
    pub(crate) fn new(config: &Config) -> Result<Self, Error> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .thread_name(|i| format!("denoise-cpu-{i}"))
            .build()
            .map_err(|e| execution_failed(format!("failed to build thread pool: {e}")))?;
        Ok(Self {
            pool: Arc::new(pool),
            table: Default::default(),
        })
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    #[inline]
    pub(crate) fn queue(&self) -> Queue {
        Queue::Pool(self.pool.clone())
    }

    /// 所有存储类别都分配在主机上，只记录请求的类别。
    pub(crate) fn malloc(&self, size: usize, storage: Storage) -> Result<Allocation, Error> {
        let storage = match storage {
            Storage::Undefined => Storage::Host,
            s => s,
        };
        let blob = Blob::new(size)?;
        let ptr = blob.ptr();
        self.table
            .lock()
            .unwrap()
            .insert(ptr, size, (blob, storage));
        Ok(Allocation::new(ptr, size, storage))
    }

    pub(crate) fn free(&self, alloc: Allocation) -> Result<(), Error> {
        let ptr = NonNull::new(alloc.as_mut_ptr())
            .ok_or_else(|| invalid_argument("freeing null allocation"))?;
        match self.table.lock().unwrap().remove(ptr) {
            Some(_) => Ok(()),
            None => Err(invalid_argument(format!(
                "{ptr:?} was not allocated by this engine"
            ))),
        }
    }

    /// CPU 能访问任何主机地址，未登记的地址视为主机存储。
    pub(crate) fn pointer_storage(&self, ptr: *const u8) -> Storage {
        self.table
            .lock()
            .unwrap()
            .find(ptr)
            .map_or(Storage::Host, |(_, storage)| *storage)
    }
}

impl Drop for Cpu {
    fn drop(&mut self) {
        let n = self.table.lock().map(|t| t.len()).unwrap_or(0);
        if n > 0 {
            log::warn!("cpu engine dropped with {n} live allocations")
        }
    }
}
