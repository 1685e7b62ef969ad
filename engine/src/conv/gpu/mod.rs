//! 加速器上的直接卷积。
//!
//! 每个工作项计算若干行中一个像素的一组输出通道。各变体只在每次累加的输出通道数上不同，
//! 单个输出的累加顺序都是偏置、输入通道、卷积核行、卷积核列，因此结果逐位相同。

use super::{args::Meta, Args};
use crate::{
    gpu::{Arch, Gpu},
    handle::Grid,
    Element, Error, TensorLayout, TensorView,
};

/// 直接卷积的核函数变体。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Kernel {
    /// 基线实现，每次计算一个输出通道。
    Generic,
    /// 每次计算 8 个输出通道，仅 3x3。
    Tiled8,
    /// 每次计算 16 个输出通道，仅 3x3、16 通道分块。
    Tiled16,
}

impl Kernel {
    /// 架构可用的变体，从快到慢。
    fn ladder(arch: Arch) -> &'static [Self] {
        match arch {
            Arch::XeHpc => &[Self::Tiled16, Self::Tiled8, Self::Generic],
            Arch::XeHpg => &[Self::Tiled8, Self::Generic],
            Arch::Unknown | Arch::Gen9 | Arch::XeLp => &[Self::Generic],
        }
    }

    #[inline]
    pub const fn block(self) -> usize {
        match self {
            Self::Generic => 1,
            Self::Tiled8 => 8,
            Self::Tiled16 => 16,
        }
    }

    fn supports(self, meta: &Meta) -> bool {
        let k3 = meta.kh == 3 && meta.kw == 3;
        match self {
            Self::Generic => true,
            Self::Tiled8 => k3 && meta.layout.block() >= 8,
            Self::Tiled16 => k3 && meta.layout == TensorLayout::Chw16c,
        }
    }

    pub(super) fn select(gpu: &Gpu, meta: &Meta) -> Self {
        let ladder = Self::ladder(gpu.arch());
        let kernel = ladder
            .iter()
            .copied()
            .find(|k| k.supports(meta))
            .unwrap_or(Self::Generic);
        if kernel != ladder[0] {
            log::debug!(
                "conv {}x{} {:?} cannot use {:?}, falls back to {kernel:?}",
                meta.kh,
                meta.kw,
                meta.layout,
                ladder[0]
            )
        }
        if kernel == Self::Generic {
            gpu.warn_fallback("conv")
        }
        kernel
    }
}

/// 发射方案的缓存键。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct SchemeKey {
    pub kernel: Kernel,
    pub ic: usize,
    pub oc: usize,
    pub h: usize,
    pub w: usize,
}

/// 直接卷积的发射方案。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Scheme {
    /// 每个工作项计算的行数。
    pub rows: usize,
}

impl Scheme {
    pub(super) fn plan(gpu: &Gpu, kernel: Kernel, meta: &Meta) -> Self {
        let key = SchemeKey {
            kernel,
            ic: meta.ic,
            oc: meta.oc,
            h: meta.h,
            w: meta.w,
        };
        gpu.conv_scheme(key, || {
            // 一个工作组大致覆盖整行的全部输出通道块
            let items = meta.w * meta.oc.div_ceil(kernel.block());
            let rows = (gpu.max_work_group_size() / items.max(1)).clamp(1, meta.h.min(8));
            Self { rows }
        })
    }
}

pub(super) fn direct<T: Element>(
    grid: Grid,
    kernel: Kernel,
    scheme: Scheme,
    args: &Args,
) -> Result<(), Error> {
    let views = Views::<T> {
        x: args.src.view(),
        w: args.weight.view(),
        b: args.bias.view(),
        y: args.dst.view(),
        relu: args.relu,
    };
    let (h, w) = (views.y.desc.h(), views.y.desc.w());
    let rows = scheme.rows;
    grid.for_each(h.div_ceil(rows), w, |tile, ox| {
        for oy in tile * rows..((tile + 1) * rows).min(h) {
            match kernel {
                Kernel::Generic => views.pixel::<1>(oy, ox),
                Kernel::Tiled8 => views.pixel::<8>(oy, ox),
                Kernel::Tiled16 => views.pixel::<16>(oy, ox),
            }
        }
    });
    Ok(())
}

struct Views<T> {
    x: TensorView<T>,
    w: TensorView<T>,
    b: TensorView<T>,
    y: TensorView<T>,
    relu: bool,
}

impl<T: Element> Views<T> {
    /// 计算 `(oy, ox)` 处的全部输出通道，每次 `B` 个。
    fn pixel<const B: usize>(&self, oy: usize, ox: usize) {
        let &[oc, ic, kh, kw] = &*self.w.desc.dims else {
            return;
        };
        let (h, w) = (self.x.desc.h(), self.x.desc.w());
        for o0 in (0..oc).step_by(B) {
            let mut acc = [0f32; B];
            for (j, acc) in acc.iter_mut().enumerate() {
                *acc = unsafe { self.b.get(o0 + j) };
            }
            for i in 0..ic {
                for ky in 0..kh {
                    let Some(iy) = (oy + ky).checked_sub(kh / 2).filter(|&y| y < h) else {
                        continue;
                    };
                    for kx in 0..kw {
                        let Some(ix) = (ox + kx).checked_sub(kw / 2).filter(|&x| x < w) else {
                            continue;
                        };
                        let v = unsafe { self.x.load(i, iy, ix) };
                        for (j, acc) in acc.iter_mut().enumerate() {
                            let k = (((o0 + j) * ic + i) * kh + ky) * kw + kx;
                            *acc += v * unsafe { self.w.get(k) };
                        }
                    }
                }
            }
            for (j, acc) in acc.into_iter().enumerate() {
                let y = if self.relu { acc.max(0.) } else { acc };
                unsafe { self.y.store(o0 + j, oy, ox, y) }
            }
        }
    }
}
