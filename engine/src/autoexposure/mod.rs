//! 自动曝光：由图像的平均对数亮度估计曝光系数。
//!
//! 图像按固定的二维网格分箱，每箱降采样为一个亮度值，
//! 再对超过下限的箱求 `log2` 和与计数。归约的划分只取决于箱数，与并行度无关，
//! 因此结果逐位可复现。

mod common_cpu;
mod gpu;

use crate::{
    handle::Backend,
    invalid_argument,
    utils::{check_access, required},
    Allocation, Engine, Error, Image, ImageDesc, Operator, SendPtr,
};
use std::{
    ops::{Add, Range},
    sync::Arc,
};

/// 曝光后的目标平均亮度。
pub const KEY: f32 = 0.18;
/// 亮度下限，不超过它的箱不参与统计。
pub const EPS: f32 = 1e-8;
/// 箱的最大边长。
pub const MAX_BIN_SIZE: usize = 16;

/// 分箱网格。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Bins {
    pub h: usize,
    pub w: usize,
    height: usize,
    width: usize,
}

impl Bins {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            h: height.div_ceil(MAX_BIN_SIZE),
            w: width.div_ceil(MAX_BIN_SIZE),
            height,
            width,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.h * self.w
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 第 `i` 行箱覆盖的像素行，按比例整除划分，相邻箱首尾相接。
    #[inline]
    pub fn rows(&self, i: usize) -> Range<usize> {
        i * self.height / self.h..(i + 1) * self.height / self.h
    }

    #[inline]
    pub fn cols(&self, j: usize) -> Range<usize> {
        j * self.width / self.w..(j + 1) * self.width / self.w
    }
}

/// 对数亮度的部分和。按分量相加合并。
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub(crate) struct LogSum {
    pub sum: f32,
    pub count: u32,
}

impl LogSum {
    #[inline]
    pub fn of(l: f32) -> Self {
        if l > EPS {
            Self {
                sum: l.log2(),
                count: 1,
            }
        } else {
            Self::default()
        }
    }

    #[inline]
    pub fn exposure(self) -> f32 {
        if self.count > 0 {
            KEY / (self.sum / self.count as f32).exp2()
        } else {
            1.
        }
    }
}

impl Add for LogSum {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self {
            sum: self.sum + rhs.sum,
            count: self.count + rhs.count,
        }
    }
}

#[inline]
pub(crate) fn luminance([r, g, b]: [f32; 3]) -> f32 {
    let c = |x: f32| if x.is_finite() { x.max(0.) } else { 0. };
    0.212671 * c(r) + 0.715160 * c(g) + 0.072169 * c(b)
}

/// 一个箱的平均亮度，按行优先顺序累加。
pub(crate) unsafe fn downsample(src: &Image, bins: &Bins, i: usize, j: usize) -> f32 {
    let (rows, cols) = (bins.rows(i), bins.cols(j));
    let n = rows.len() * cols.len();
    let mut sum = 0.;
    for h in rows {
        for w in cols.clone() {
            sum += luminance(src.load(h, w))
        }
    }
    sum / n as f32
}

enum Imp {
    Tree,
    Grouped(Arc<gpu::Workspace>),
}

pub struct Autoexposure {
    engine: Engine,
    desc: ImageDesc,
    bins: Bins,
    imp: Imp,
    src: Option<Image>,
    dst: Option<SendPtr<f32>>,
}

impl Autoexposure {
    pub(crate) fn new(engine: &Engine, desc: &ImageDesc) -> Result<Self, Error> {
        if desc.format.channels() != 3 {
            return Err(invalid_argument(format!(
                "autoexposure needs color, got {:?}",
                desc.format
            )));
        }
        let bins = Bins::new(desc.height, desc.width);
        let imp = match engine.backend() {
            Backend::Cpu(_) => Imp::Tree,
            Backend::Gpu(gpu) => Imp::Grouped(Arc::new(gpu::Workspace::new(gpu, &bins)?)),
        };
        log::debug!(
            "autoexposure {}x{} in {}x{} bins, group {:?}",
            desc.width,
            desc.height,
            bins.w,
            bins.h,
            match &imp {
                Imp::Tree => None,
                Imp::Grouped(ws) => Some(ws.group_size()),
            }
        );
        Ok(Self {
            engine: engine.clone(),
            desc: *desc,
            bins,
            imp,
            src: None,
            dst: None,
        })
    }

    #[inline]
    pub fn bins(&self) -> &Bins {
        &self.bins
    }

    /// 加速器上一个工作组归约的箱数，CPU 上为 `None`。
    #[inline]
    pub fn group_size(&self) -> Option<usize> {
        match &self.imp {
            Imp::Tree => None,
            Imp::Grouped(ws) => Some(ws.group_size()),
        }
    }

    pub fn set_src(&mut self, src: Image) -> Result<(), Error> {
        let (a, b) = (src.desc(), &self.desc);
        if (a.format, a.width, a.height) != (b.format, b.width, b.height) {
            return Err(invalid_argument(format!(
                "autoexposure src is {:?} {}x{}, expected {:?} {}x{}",
                a.format, a.width, a.height, b.format, b.width, b.height
            )));
        }
        check_access(&self.engine, "autoexposure src", src.as_ptr())?;
        self.src = Some(src);
        Ok(())
    }

    /// 结果写入 `alloc` 的 `offset` 处。
    pub fn set_dst(&mut self, alloc: &Allocation, offset: usize) -> Result<(), Error> {
        let fits = offset
            .checked_add(size_of::<f32>())
            .is_some_and(|end| end <= alloc.len());
        if offset % align_of::<f32>() != 0 || !fits {
            return Err(invalid_argument(format!(
                "autoexposure result at {offset} does not fit {} bytes",
                alloc.len()
            )));
        }
        unsafe { self.set_dst_ptr(alloc.as_mut_ptr().add(offset).cast()) }
    }

    /// # Safety
    ///
    /// `dst` 在算子执行完成前必须有效，并且可被本设备访问。
    pub unsafe fn set_dst_ptr(&mut self, dst: *mut f32) -> Result<(), Error> {
        check_access(&self.engine, "autoexposure dst", dst.cast())?;
        self.dst = Some(SendPtr::new(dst));
        Ok(())
    }
}

impl Operator for Autoexposure {
    type Desc = ImageDesc;

    #[inline]
    fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    fn submit(&self) -> Result<(), Error> {
        let src = *required("autoexposure", "src", &self.src)?;
        let dst = *required("autoexposure", "dst", &self.dst)?;
        match &self.imp {
            Imp::Tree => common_cpu::submit(&self.engine, self.bins, src, dst),
            Imp::Grouped(ws) => gpu::submit(&self.engine, self.bins, ws, src, dst),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{Bins, LogSum, KEY};
    use crate::{
        common_cpu,
        gpu::{self, soft::SoftDeviceConfig, soft::SoftPlatform},
        Engine, ErrorKind, Format, ImageDesc, Operator, Storage,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// 在引擎上对 `pixels` 运行一次自动曝光。
    fn run(engine: &Engine, w: usize, h: usize, pixels: &[[f32; 3]]) -> f32 {
        let desc = ImageDesc::new(Format::Float3, w, h).unwrap();
        let mem = engine
            .malloc(desc.byte_size() + 4, Storage::Managed)
            .unwrap();
        let src = mem.image(4, desc).unwrap();
        for y in 0..h {
            for x in 0..w {
                unsafe { src.store(y, x, pixels[y * w + x]) }
            }
        }
        let mut op = engine.new_autoexposure(&desc).unwrap();
        op.set_src(src).unwrap();
        op.set_dst(&mem, 0).unwrap();
        op.submit().unwrap();
        engine.wait().unwrap();
        let ans = unsafe { mem.as_ptr().cast::<f32>().read() };
        unsafe { engine.free(mem) }.unwrap();
        ans
    }

    fn soft_gpu(max_work_group_size: usize) -> Engine {
        let device = SoftPlatform::new()
            .new_device(SoftDeviceConfig {
                max_work_group_size,
                ..Default::default()
            })
            .unwrap();
        Engine::gpu(device, &gpu::Config::default())
    }

    fn random_image(w: usize, h: usize) -> Vec<[f32; 3]> {
        let mut rng = StdRng::seed_from_u64(1234);
        (0..w * h)
            .map(|_| {
                let scale = rng.gen_range(0.0f32..4.0).exp2();
                [(); 3].map(|_| rng.gen_range(0.0..scale))
            })
            .collect()
    }

    #[test]
    fn test_bins_cover() {
        for (height, width) in [(1, 1), (16, 16), (17, 33), (37, 100), (255, 3)] {
            let bins = Bins::new(height, width);
            assert_eq!(bins.h, height.div_ceil(16));
            assert_eq!(bins.w, width.div_ceil(16));
            let mut next = 0;
            for i in 0..bins.h {
                let rows = bins.rows(i);
                assert_eq!(rows.start, next);
                assert!(!rows.is_empty() && rows.len() <= 16);
                next = rows.end;
            }
            assert_eq!(next, height);
            let mut next = 0;
            for j in 0..bins.w {
                let cols = bins.cols(j);
                assert_eq!(cols.start, next);
                assert!(!cols.is_empty() && cols.len() <= 16);
                next = cols.end;
            }
            assert_eq!(next, width);
        }
    }

    #[test]
    fn test_log_sum() {
        assert_eq!(LogSum::of(0.).count, 0);
        assert_eq!(LogSum::of(1e-9).count, 0);
        assert_eq!(LogSum::of(0.25), LogSum { sum: -2., count: 1 });
        assert_eq!(LogSum::default().exposure(), 1.);
        let total = LogSum::of(0.5) + LogSum::of(0.5) + LogSum::of(0.5) + LogSum::of(0.5);
        assert_eq!(total, LogSum { sum: -4., count: 4 });
        assert!((total.exposure() - KEY / 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_black() {
        let pixels = vec![[0.; 3]; 40 * 20];
        let cpu = Engine::cpu(&common_cpu::Config::default()).unwrap();
        assert_eq!(run(&cpu, 40, 20, &pixels), 1.);
        assert_eq!(run(&soft_gpu(1024), 40, 20, &pixels), 1.);
        // 负值和非有限值按 0 计
        let pixels = vec![[-1., f32::NAN, 0.]; 40 * 20];
        assert_eq!(run(&cpu, 40, 20, &pixels), 1.);
    }

    #[test]
    fn test_uniform() {
        let pixels = vec![[0.5; 3]; 32 * 32];
        let cpu = Engine::cpu(&common_cpu::Config::default()).unwrap();
        for ans in [run(&cpu, 32, 32, &pixels), run(&soft_gpu(256), 32, 32, &pixels)] {
            assert!((ans - KEY / 0.5).abs() < 1e-5, "{ans}");
        }
    }

    #[test]
    fn test_deterministic() {
        let (w, h) = (301, 157);
        let pixels = random_image(w, h);
        let results = [1, 2, 7]
            .map(|num_threads| {
                let engine = Engine::cpu(&common_cpu::Config { num_threads }).unwrap();
                [run(&engine, w, h, &pixels), run(&engine, w, h, &pixels)]
            })
            .concat();
        let bits = results[0].to_bits();
        assert!(results.iter().all(|r| r.to_bits() == bits), "{results:?}");

        for group in [1024, 512, 256] {
            let engine = soft_gpu(group);
            let a = run(&engine, w, h, &pixels);
            let b = run(&engine, w, h, &pixels);
            assert_eq!(a.to_bits(), b.to_bits());
            assert!((a - results[0]).abs() <= 1e-4 * results[0], "{a} {}", results[0]);
        }
    }

    #[test]
    fn test_tiers() {
        let desc = ImageDesc::new(Format::Float3Srgb, 64, 64).unwrap();
        // 低于最小一档的设备仍使用最小一档
        for (limit, group) in [(4096, 1024), (1024, 1024), (1000, 512), (300, 256), (128, 256)] {
            let op = soft_gpu(limit).new_autoexposure(&desc).unwrap();
            assert_eq!(op.group_size(), Some(group));
        }
        let pixels = vec![[0.5; 3]; 64 * 64];
        let ans = run(&soft_gpu(128), 64, 64, &pixels);
        assert!((ans - KEY / 0.5).abs() < 1e-5, "{ans}");

        let cpu = Engine::cpu(&common_cpu::Config::default()).unwrap();
        assert_eq!(cpu.new_autoexposure(&desc).unwrap().group_size(), None);
        let gray = ImageDesc::new(Format::Float, 64, 64).unwrap();
        let err = cpu.new_autoexposure(&gray).err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_unbound() {
        let device = SoftPlatform::new().new_device(Default::default()).unwrap();
        let engine = Engine::gpu(device.clone(), &gpu::Config::default());
        let desc = ImageDesc::new(Format::Float3, 16, 16).unwrap();
        let mem = engine.malloc(desc.byte_size(), Storage::Device).unwrap();

        let mut op = engine.new_autoexposure(&desc).unwrap();
        op.set_src(mem.image(0, desc).unwrap()).unwrap();
        let err = op.submit().unwrap_err();
        assert_eq!(err.kind, ErrorKind::UsageError);
        engine.wait().unwrap();
        assert_eq!(device.executed_jobs(), 0);

        // 结果放不下
        assert!(op.set_dst(&mem, mem.len() - 2).is_err());
        drop(op);
        unsafe { engine.free(mem) }.unwrap();
    }
}
