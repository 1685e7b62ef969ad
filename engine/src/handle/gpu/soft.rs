//! 软件加速器。
//!
//! 在主机上模拟加速器的存储和队列：同一平台上的设备共享一张指针登记表，
//! 每个设备有独立的堆和一个按序执行工作的队列线程。

use super::{Arch, DeviceId, Driver, Job, PointerInfo, Usm};
use crate::{
    execution_failed, invalid_argument, AllocTable, Blob, Error, OffsetCalculator, ALIGNMENT,
};
use std::{
    ptr::{copy, NonNull},
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        mpsc::{channel, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle, ThreadId},
};

#[derive(Clone, Debug)]
pub struct SoftDeviceConfig {
    pub name: String,
    pub arch: Arch,
    pub max_work_group_size: usize,
    /// 堆每次扩张的最小字节数。
    pub heap_chunk: usize,
}

impl Default for SoftDeviceConfig {
    fn default() -> Self {
        Self {
            name: "soft-gpu".into(),
            arch: Arch::Unknown,
            max_work_group_size: 1024,
            heap_chunk: 16 << 20,
        }
    }
}

/// 一组共享指针空间的软件设备。
#[derive(Clone, Default)]
pub struct SoftPlatform(Arc<Registry>);

#[derive(Default)]
struct Registry {
    records: Mutex<AllocTable<PointerInfo>>,
    next_id: AtomicUsize,
}

impl SoftPlatform {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 在平台上创建一个设备，启动它的队列线程。
    pub fn new_device(&self, config: SoftDeviceConfig) -> Result<Arc<SoftDevice>, Error> {
        let id = DeviceId(self.0.next_id.fetch_add(1, Relaxed));
        let executed = Arc::new(AtomicUsize::new(0));

        let (sender, receiver) = channel::<Job>();
        let counter = executed.clone();
        let worker = thread::Builder::new()
            .name(format!("{}-queue", config.name))
            .spawn(move || {
                for job in receiver {
                    counter.fetch_add(1, Relaxed);
                    job();
                }
            })
            .map_err(|e| execution_failed(format!("failed to start device queue: {e}")))?;

        log::info!(
            "soft device {} #{} ({:?}, max work group {})",
            config.name,
            id.0,
            config.arch,
            config.max_work_group_size
        );
        Ok(Arc::new(SoftDevice {
            id,
            registry: self.0.clone(),
            heap: Mutex::new(Heap {
                chunks: Vec::new(),
                free: OffsetCalculator::new(ALIGNMENT),
            }),
            sender: Mutex::new(Some(sender)),
            worker_id: worker.thread().id(),
            worker: Some(worker),
            executed,
            config,
        }))
    }
}

/// 软件设备。
pub struct SoftDevice {
    id: DeviceId,
    config: SoftDeviceConfig,
    registry: Arc<Registry>,
    heap: Mutex<Heap>,
    sender: Mutex<Option<Sender<Job>>>,
    worker_id: ThreadId,
    worker: Option<JoinHandle<()>>,
    executed: Arc<AtomicUsize>,
}

struct Heap {
    chunks: Vec<Blob>,
    free: OffsetCalculator,
}

impl Heap {
    fn take(&mut self, size: usize, chunk: usize) -> Result<NonNull<u8>, Error> {
        let range = match self.free.take(size) {
            Some(range) => range,
            None => {
                let blob = Blob::new(size.max(chunk).next_multiple_of(ALIGNMENT))?;
                let start = blob.ptr().as_ptr() as usize;
                log::debug!(
                    "device heap grows by {} bytes, {} bytes free before",
                    blob.len(),
                    self.free.free_bytes()
                );
                self.free.put(start..start + blob.len());
                self.chunks.push(blob);
                self.free
                    .take(size)
                    .ok_or_else(|| execution_failed("device heap corrupted"))?
            }
        };
        NonNull::new(range.start as *mut u8).ok_or_else(|| execution_failed("null device address"))
    }
}

impl SoftDevice {
    /// 队列线程已经取出执行的工作数。
    #[inline]
    pub fn executed_jobs(&self) -> usize {
        self.executed.load(Relaxed)
    }

    #[inline]
    pub fn config(&self) -> &SoftDeviceConfig {
        &self.config
    }
}

impl Driver for SoftDevice {
    #[inline]
    fn name(&self) -> &str {
        &self.config.name
    }

    #[inline]
    fn id(&self) -> DeviceId {
        self.id
    }

    #[inline]
    fn arch(&self) -> Arch {
        self.config.arch
    }

    #[inline]
    fn max_work_group_size(&self) -> usize {
        self.config.max_work_group_size
    }

    fn malloc(&self, size: usize, usm: Usm) -> Result<NonNull<u8>, Error> {
        if size == 0 {
            return Err(invalid_argument("zero-sized device allocation"));
        }
        let ptr = self.heap.lock().unwrap().take(size, self.config.heap_chunk)?;
        self.registry.records.lock().unwrap().insert(
            ptr,
            size,
            PointerInfo {
                usm,
                device: self.id,
            },
        );
        Ok(ptr)
    }

    fn free(&self, ptr: NonNull<u8>) -> Result<(), Error> {
        let mut records = self.registry.records.lock().unwrap();
        match records.remove(ptr) {
            Some((len, info)) if info.device == self.id => {
                drop(records);
                let start = ptr.as_ptr() as usize;
                self.heap.lock().unwrap().free.put(start..start + len);
                Ok(())
            }
            Some((len, info)) => {
                records.insert(ptr, len, info);
                Err(invalid_argument(format!(
                    "{ptr:?} belongs to device #{}, not #{}",
                    info.device.0, self.id.0
                )))
            }
            None => Err(invalid_argument(format!("{ptr:?} is not a device allocation"))),
        }
    }

    #[inline]
    fn pointer_info(&self, ptr: *const u8) -> Option<PointerInfo> {
        self.registry.records.lock().unwrap().find(ptr).copied()
    }

    unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<(), Error> {
        copy(src, dst, size);
        Ok(())
    }

    fn enqueue(&self, job: Job) {
        if let Some(sender) = &*self.sender.lock().unwrap() {
            // 队列线程只在设备析构时退出
            let _ = sender.send(job);
        }
    }
}

impl Drop for SoftDevice {
    fn drop(&mut self) {
        drop(self.sender.lock().unwrap().take());
        if let Some(worker) = self.worker.take() {
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
        self.registry
            .records
            .lock()
            .unwrap()
            .retain(|info| info.device != self.id);
    }
}
