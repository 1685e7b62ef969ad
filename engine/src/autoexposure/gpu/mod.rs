//! 加速器上的三段归约：分箱降采样、组内归约、组间归约。

use super::{downsample, Bins, LogSum};
use crate::{
    gpu::{Gpu, Scratch},
    Engine, Error, Image, SendPtr,
};
use std::sync::Arc;

/// 可选的工作组大小，从大到小。
const TIERS: [usize; 3] = [1024, 512, 256];

/// 算子私有的中间结果：每箱亮度，以及每组的部分和与计数。
pub(super) struct Workspace {
    memory: Scratch,
    group_size: usize,
    bins: usize,
    groups: usize,
}

impl Workspace {
    pub fn new(gpu: &Gpu, bins: &Bins) -> Result<Self, Error> {
        // 最小一档是所有设备都保证支持的组大小
        let limit = gpu.max_work_group_size();
        let group_size = TIERS
            .into_iter()
            .find(|&g| g <= limit)
            .unwrap_or(TIERS[TIERS.len() - 1]);
        let n = bins.len();
        let groups = n.div_ceil(group_size);
        let size = n * size_of::<f32>() + groups * (size_of::<f32>() + size_of::<u32>());
        Ok(Self {
            memory: gpu.scratch(size)?,
            group_size,
            bins: n,
            groups,
        })
    }

    #[inline]
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    #[inline]
    fn luminance(&self) -> SendPtr<f32> {
        SendPtr::new(self.memory.as_mut_ptr().cast())
    }

    #[inline]
    fn sums(&self) -> SendPtr<f32> {
        SendPtr::new(unsafe { self.luminance().ptr().add(self.bins) })
    }

    #[inline]
    fn counts(&self) -> SendPtr<u32> {
        SendPtr::new(unsafe { self.sums().ptr().add(self.groups).cast() })
    }
}

pub(super) fn submit(
    engine: &Engine,
    bins: Bins,
    ws: &Arc<Workspace>,
    src: Image,
    dst: SendPtr<f32>,
) {
    let grid = engine.grid();

    let ws_ = ws.clone();
    engine.submit(Box::new(move || {
        let out = ws_.luminance();
        grid.for_each(bins.h, bins.w, |i, j| unsafe {
            out.ptr()
                .add(i * bins.w + j)
                .write(downsample(&src, &bins, i, j))
        });
        Ok(())
    }));

    let ws_ = ws.clone();
    engine.submit(Box::new(move || {
        let (lum, sums, counts) = (ws_.luminance(), ws_.sums(), ws_.counts());
        let (n, g) = (ws_.bins, ws_.group_size);
        grid.for_each(1, ws_.groups, |_, k| {
            let mut local = vec![LogSum::default(); g];
            for (i, v) in local.iter_mut().enumerate() {
                let idx = k * g + i;
                if idx < n {
                    *v = LogSum::of(unsafe { lum.ptr().add(idx).read() })
                }
            }
            let part = tree(&mut local);
            unsafe {
                sums.ptr().add(k).write(part.sum);
                counts.ptr().add(k).write(part.count)
            }
        });
        Ok(())
    }));

    let ws_ = ws.clone();
    engine.submit(Box::new(move || {
        let (sums, counts) = (ws_.sums(), ws_.counts());
        let mut local = vec![LogSum::default(); ws_.group_size];
        let mut total = LogSum::default();
        for start in (0..ws_.groups).step_by(ws_.group_size) {
            for (i, v) in local.iter_mut().enumerate() {
                let k = start + i;
                *v = if k < ws_.groups {
                    unsafe {
                        LogSum {
                            sum: sums.ptr().add(k).read(),
                            count: counts.ptr().add(k).read(),
                        }
                    }
                } else {
                    LogSum::default()
                }
            }
            total = total + tree(&mut local);
        }
        unsafe { dst.ptr().write(total.exposure()) };
        Ok(())
    }));
}

/// 工作组内的二分树归约，`local` 的长度为 2 的幂。
fn tree(local: &mut [LogSum]) -> LogSum {
    let mut stride = local.len() / 2;
    while stride > 0 {
        for i in 0..stride {
            local[i] = local[i] + local[i + stride]
        }
        stride /= 2
    }
    local[0]
}
