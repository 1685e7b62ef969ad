use crate::{
    autoexposure::Autoexposure,
    common_cpu::{self, Cpu},
    conv::{Conv, ConvDesc},
    gpu::{self, Arch, Driver, Gpu},
    handle::{Backend, Grid},
    image_copy::ImageCopy,
    input_process::{InputProcess, InputProcessDesc},
    invalid_argument,
    output_process::{OutputProcess, OutputProcessDesc},
    pool::{Pool, PoolDesc},
    stream::{CommandStream, Queue, Task},
    upsample::{Upsample, UpsampleDesc},
    Allocation, Error, ImageDesc, SendPtr, Storage, TensorLayout,
};
use digit_layout::{types as ty, DigitLayout};
use std::sync::Arc;

/// 设备家族。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Family {
    Cpu,
    Gpu,
}

/// 引擎构造时查询并缓存的设备信息。
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub family: Family,
    /// CPU 没有架构标签。
    pub arch: Option<Arch>,
    /// 工作组的最大工作项数；CPU 为线程数。
    pub max_work_group_size: usize,
}

/// 单个物理设备上的执行引擎。
///
/// 引擎拥有设备的命令流，提供存储分配、复制、主机回调、屏障和算子工厂。
/// 克隆只增加引用，所有克隆共享同一条命令流。
#[derive(Clone)]
pub struct Engine(pub(crate) Arc<Inner>);

pub(crate) struct Inner {
    backend: Backend,
    stream: CommandStream,
    info: DeviceInfo,
}

impl Engine {
    /// 在 CPU 上创建引擎。
    pub fn cpu(config: &common_cpu::Config) -> Result<Self, Error> {
        let cpu = Cpu::new(config)?;
        let info = DeviceInfo {
            name: "cpu".into(),
            family: Family::Cpu,
            arch: None,
            max_work_group_size: cpu.num_threads(),
        };
        Ok(Self::new(Backend::Cpu(cpu), info))
    }

    /// 在驱动绑定的加速器上创建引擎。
    pub fn gpu(driver: Arc<dyn Driver>, config: &gpu::Config) -> Self {
        let gpu = Gpu::new(driver, config);
        let info = DeviceInfo {
            name: gpu.driver().name().into(),
            family: Family::Gpu,
            arch: Some(gpu.arch()),
            max_work_group_size: gpu.max_work_group_size(),
        };
        Self::new(Backend::Gpu(gpu), info)
    }

    fn new(backend: Backend, info: DeviceInfo) -> Self {
        log::info!(
            "engine on {} ({:?}, arch {:?}, max work group {})",
            info.name,
            info.family,
            info.arch,
            info.max_work_group_size
        );
        Self(Arc::new(Inner {
            backend,
            stream: CommandStream::default(),
            info,
        }))
    }

    #[inline]
    pub fn device(&self) -> &DeviceInfo {
        &self.0.info
    }

    /// 设备原生的张量排布。
    #[inline]
    pub fn tensor_layout(&self) -> TensorLayout {
        match self.0.backend {
            Backend::Cpu(_) => TensorLayout::Chw8c,
            Backend::Gpu(_) => TensorLayout::Chw16c,
        }
    }

    /// 设备原生的张量元素类型。
    #[inline]
    pub fn tensor_dt(&self) -> DigitLayout {
        match self.0.backend {
            Backend::Cpu(_) => ty::F32,
            Backend::Gpu(_) => ty::F16,
        }
    }

    #[inline]
    pub(crate) fn backend(&self) -> &Backend {
        &self.0.backend
    }

    #[inline]
    pub(crate) fn grid(&self) -> Grid {
        self.0.backend.grid()
    }

    fn queue(&self) -> Queue {
        match &self.0.backend {
            Backend::Cpu(cpu) => cpu.queue(),
            Backend::Gpu(gpu) => gpu.queue(),
        }
    }

    /// 将任务挂到命令流上，在设备上执行。
    #[inline]
    pub(crate) fn submit(&self, task: Task) {
        self.0.stream.submit(&self.queue(), task);
    }

    // 存储

    /// 分配 `size` 字节的 `storage` 类存储。[Storage::Undefined] 按 [Storage::Host] 分配。
    pub fn malloc(&self, size: usize, storage: Storage) -> Result<Allocation, Error> {
        if size == 0 {
            return Err(invalid_argument("zero-sized allocation"));
        }
        match &self.0.backend {
            Backend::Cpu(cpu) => cpu.malloc(size, storage),
            Backend::Gpu(gpu) => gpu.malloc(size, storage),
        }
    }

    /// 释放本引擎分配的存储。不是本引擎的分配时返回错误，存储保持有效。
    ///
    /// # Safety
    ///
    /// 从 `alloc` 取得的 [crate::Image]、[crate::Tensor] 或地址不能再被使用：
    /// 不能仍绑定在将要提交的算子上，也不能被尚未完成的任务引用。
    /// 先调用 [Engine::wait] 再释放。
    pub unsafe fn free(&self, alloc: Allocation) -> Result<(), Error> {
        match &self.0.backend {
            Backend::Cpu(cpu) => cpu.free(alloc),
            Backend::Gpu(gpu) => gpu.free(alloc),
        }
    }

    /// 查询地址的存储类别。
    ///
    /// 其他物理设备上的设备存储返回 [Storage::Undefined]。
    pub fn pointer_storage(&self, ptr: *const u8) -> Storage {
        match &self.0.backend {
            Backend::Cpu(cpu) => cpu.pointer_storage(ptr),
            Backend::Gpu(gpu) => gpu.pointer_storage(ptr),
        }
    }

    /// 异步复制，不等待完成。
    ///
    /// # Safety
    ///
    /// 两个区域在复制完成前都必须有效并且可被本设备访问。
    pub unsafe fn submit_memcpy(&self, dst: *mut u8, src: *const u8, size: usize) {
        let dst = SendPtr::new(dst);
        let src = SendPtr::new(src.cast_mut());
        let task: Task = match &self.0.backend {
            Backend::Cpu(_) => Box::new(move || {
                unsafe { std::ptr::copy(src.ptr(), dst.ptr(), size) };
                Ok(())
            }),
            Backend::Gpu(gpu) => {
                let driver = gpu.driver().clone();
                Box::new(move || unsafe { driver.memcpy(dst.ptr(), src.ptr(), size) })
            }
        };
        self.submit(task)
    }

    /// 复制并等待完成，是一个同步点。
    ///
    /// # Safety
    ///
    /// 同 [Engine::submit_memcpy]。
    pub unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, size: usize) -> Result<(), Error> {
        self.submit_memcpy(dst, src, size);
        self.wait()
    }

    // 同步

    /// 之前提交的工作全部完成后在主机线程上执行 `f`。不阻塞，也不在调用线程上执行。
    pub fn submit_host_func(&self, f: impl FnOnce() + Send + 'static) {
        self.0.stream.submit(
            &Queue::Host,
            Box::new(move || {
                f();
                Ok(())
            }),
        );
    }

    /// 提交一个屏障，之后提交的工作等待之前的工作完成。
    pub fn submit_barrier(&self) {
        self.submit(Box::new(|| Ok(())))
    }

    /// 阻塞直到所有已提交的工作完成，返回期间发生的第一个执行错误。
    pub fn wait(&self) -> Result<(), Error> {
        let result = self.0.stream.wait();
        if let Err(e) = &result {
            log::error!("{}: {e}", self.0.info.name)
        }
        result
    }

    // 算子

    pub fn new_conv(&self, desc: &ConvDesc) -> Result<Conv, Error> {
        Conv::new(self, desc)
    }

    pub fn new_pool(&self, desc: &PoolDesc) -> Result<Pool, Error> {
        Pool::new(self, desc)
    }

    pub fn new_upsample(&self, desc: &UpsampleDesc) -> Result<Upsample, Error> {
        Upsample::new(self, desc)
    }

    pub fn new_autoexposure(&self, src: &ImageDesc) -> Result<Autoexposure, Error> {
        Autoexposure::new(self, src)
    }

    pub fn new_input_process(&self, desc: &InputProcessDesc) -> Result<InputProcess, Error> {
        InputProcess::new(self, desc)
    }

    pub fn new_output_process(&self, desc: &OutputProcessDesc) -> Result<OutputProcess, Error> {
        OutputProcess::new(self, desc)
    }

    pub fn new_image_copy(&self) -> ImageCopy {
        ImageCopy::new(self)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.stream.is_idle() {
            return;
        }
        if let Err(e) = self.stream.wait() {
            log::warn!("{} dropped with unreported failure: {e}", self.info.name)
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Engine, Family};
    use crate::{
        common_cpu,
        gpu::{self, soft::SoftDeviceConfig, soft::SoftPlatform, Arch},
        input_process::InputProcessDesc,
        transfer::Transfer,
        Allocation, ErrorKind, Format, ImageDesc, Operator, Scale, SendPtr, Storage, TensorDesc,
        TensorLayout,
    };
    use digit_layout::types as ty;
    use std::{
        ptr::NonNull,
        sync::{
            atomic::{AtomicUsize, Ordering::SeqCst},
            Arc,
        },
        thread::sleep,
        time::Duration,
    };

    fn engines() -> Vec<Engine> {
        let device = SoftPlatform::new()
            .new_device(SoftDeviceConfig {
                arch: Arch::XeHpg,
                ..Default::default()
            })
            .unwrap();
        vec![
            Engine::cpu(&common_cpu::Config { num_threads: 2 }).unwrap(),
            Engine::gpu(device, &gpu::Config::default()),
        ]
    }

    #[test]
    fn test_device_info() {
        let engines = engines();
        let (cpu, gpu) = (&engines[0], &engines[1]);
        assert_eq!(cpu.device().family, Family::Cpu);
        assert_eq!(cpu.device().arch, None);
        assert_eq!(cpu.device().max_work_group_size, 2);
        assert_eq!(cpu.tensor_layout(), TensorLayout::Chw8c);
        assert_eq!(cpu.tensor_dt(), ty::F32);

        assert_eq!(gpu.device().family, Family::Gpu);
        assert_eq!(gpu.device().name, "soft-gpu");
        assert_eq!(gpu.device().arch, Some(Arch::XeHpg));
        assert_eq!(gpu.device().max_work_group_size, 1024);
        assert_eq!(gpu.tensor_layout(), TensorLayout::Chw16c);
        assert_eq!(gpu.tensor_dt(), ty::F16);
    }

    #[test]
    fn test_alloc_query() {
        for engine in engines() {
            for (request, expect) in [
                (Storage::Undefined, Storage::Host),
                (Storage::Host, Storage::Host),
                (Storage::Device, Storage::Device),
                (Storage::Managed, Storage::Managed),
            ] {
                for size in [1, 100, 4096] {
                    let alloc = engine.malloc(size, request).unwrap();
                    assert_eq!(alloc.storage(), expect);
                    assert_eq!(alloc.len(), size);
                    assert_eq!(engine.pointer_storage(alloc.as_ptr()), expect);
                    let last = unsafe { alloc.as_ptr().add(size - 1) };
                    assert_eq!(engine.pointer_storage(last), expect);
                    unsafe { engine.free(alloc) }.unwrap();
                }
            }
            let err = engine.malloc(0, Storage::Host).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument);
        }
        assert!(Storage::try_from(4).is_err());
    }

    #[test]
    fn test_cross_device() {
        let platform = SoftPlatform::new();
        let a = Engine::gpu(
            platform.new_device(Default::default()).unwrap(),
            &gpu::Config::default(),
        );
        let b = Engine::gpu(
            platform.new_device(Default::default()).unwrap(),
            &gpu::Config::default(),
        );
        let device = a.malloc(64, Storage::Device).unwrap();
        let shared = a.malloc(64, Storage::Managed).unwrap();
        assert_eq!(a.pointer_storage(device.as_ptr()), Storage::Device);
        assert_eq!(b.pointer_storage(device.as_ptr()), Storage::Undefined);
        assert_eq!(b.pointer_storage(shared.as_ptr()), Storage::Managed);
        assert_eq!(b.pointer_storage(std::ptr::null()), Storage::Undefined);

        // 只能由分配它的引擎释放，失败的释放不影响原分配
        let handle = |m: &Allocation| {
            Allocation::new(NonNull::new(m.as_mut_ptr()).unwrap(), m.len(), m.storage())
        };
        let err = unsafe { b.free(handle(&device)) }.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        let cpu = Engine::cpu(&common_cpu::Config::default()).unwrap();
        let err = unsafe { cpu.free(handle(&shared)) }.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert_eq!(a.pointer_storage(device.as_ptr()), Storage::Device);
        unsafe { a.free(device) }.unwrap();
        unsafe { a.free(shared) }.unwrap();
    }

    #[test]
    fn test_submission_order() {
        for engine in engines() {
            let mem = engine.malloc(size_of::<usize>(), Storage::Managed).unwrap();
            let slot = SendPtr::new(mem.as_mut_ptr().cast::<usize>());
            unsafe { slot.ptr().write(usize::MAX) };
            let log = Arc::new(AtomicUsize::new(0));
            for i in 0..64 {
                let log = log.clone();
                engine.submit_host_func(move || {
                    if i % 9 == 0 {
                        sleep(Duration::from_millis(1))
                    }
                    // 前一个写入必须已经完成
                    let prev = unsafe { slot.ptr().read() };
                    if prev.wrapping_add(1) != i {
                        log.fetch_add(1, SeqCst);
                    }
                    unsafe { slot.ptr().write(i) }
                });
                if i % 16 == 0 {
                    engine.submit_barrier()
                }
            }
            engine.wait().unwrap();
            assert_eq!(unsafe { slot.ptr().read() }, 63);
            assert_eq!(log.load(SeqCst), 0);
            unsafe { engine.free(mem) }.unwrap();
        }
    }

    #[test]
    fn test_memcpy_sync() {
        for engine in engines() {
            let src = engine.malloc(1024, Storage::Managed).unwrap();
            let dst = engine.malloc(1024, Storage::Managed).unwrap();
            let s = SendPtr::new(src.as_mut_ptr());
            engine.submit_host_func(move || {
                sleep(Duration::from_millis(5));
                unsafe { s.ptr().write_bytes(0x5a, 1024) }
            });
            unsafe { engine.memcpy(dst.as_mut_ptr(), src.as_ptr(), 1024).unwrap() };
            let bytes = unsafe { std::slice::from_raw_parts(dst.as_ptr(), 1024) };
            assert!(bytes.iter().all(|&b| b == 0x5a));

            // 异步复制在等待后可见
            unsafe { engine.submit_memcpy(src.as_mut_ptr(), dst.as_ptr().add(512), 16) };
            engine.wait().unwrap();
            unsafe { engine.free(src) }.unwrap();
            unsafe { engine.free(dst) }.unwrap();
        }
    }

    #[test]
    fn test_failure_once() {
        for engine in engines() {
            let ran = Arc::new(AtomicUsize::new(0));
            engine.submit_host_func(|| panic!("callback failed"));
            {
                let ran = ran.clone();
                engine.submit_host_func(move || {
                    ran.fetch_add(1, SeqCst);
                });
            }
            let err = engine.wait().unwrap_err();
            assert_eq!(err.kind, ErrorKind::ExecutionFailed);
            assert!(err.info.contains("callback failed"));
            assert_eq!(ran.load(SeqCst), 0);

            // 链已清空，后续提交不受影响
            engine.wait().unwrap();
            {
                let ran = ran.clone();
                engine.submit_host_func(move || {
                    ran.fetch_add(1, SeqCst);
                });
            }
            engine.wait().unwrap();
            assert_eq!(ran.load(SeqCst), 1);
        }
    }

    #[test]
    fn test_exposure_feeds_input() {
        for engine in engines() {
            let (w, h) = (24, 20);
            let image = ImageDesc::new(Format::Float3, w, h).unwrap();
            let tensor = TensorDesc::chw(
                engine.tensor_layout().block(),
                h,
                w,
                engine.tensor_layout(),
                engine.tensor_dt(),
            )
            .unwrap();
            let mem = engine
                .malloc(64 + image.byte_size() + tensor.byte_size(), Storage::Managed)
                .unwrap();
            let color = mem.image(64, image).unwrap();
            let dst = mem.tensor(64 + image.byte_size(), tensor.clone()).unwrap();
            for y in 0..h {
                for x in 0..w {
                    unsafe { color.store(y, x, [0.5; 3]) }
                }
            }

            let mut exposure = engine.new_autoexposure(&image).unwrap();
            exposure.set_src(color).unwrap();
            exposure.set_dst(&mem, 0).unwrap();

            let mut input = engine
                .new_input_process(&InputProcessDesc {
                    dst: tensor,
                    transfer: Transfer::Linear,
                })
                .unwrap();
            input.set_color(color).unwrap();
            input.set_dst(dst.clone()).unwrap();
            input.set_scale(Scale::Pointer(mem.as_ptr().cast()));

            exposure.submit().unwrap();
            input.submit().unwrap();
            engine.wait().unwrap();

            // 0.5 * (0.18 / 0.5)
            let ans = crate::test_utils::dump(&dst);
            assert!((ans[0] - 0.18).abs() < 1e-3, "{}", ans[0]);
            assert!((ans[h * w * 2 + 5] - 0.18).abs() < 1e-3);
            unsafe { engine.free(mem) }.unwrap();
        }
    }
}
