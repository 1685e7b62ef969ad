mod blob;
mod calculator;
mod diversity;
mod error;
mod image;
mod storage;
mod tensor;
mod tile;

pub use blob::ALIGNMENT;
pub use diversity::{SchemeCacheSize, SchemeDiversity};
pub use error::{functions::*, Error, ErrorKind};
pub use image::{Format, Image, ImageDesc};
pub use storage::{Allocation, Storage};
pub use tensor::{Element, Tensor, TensorDesc, TensorLayout};
pub use tile::{Scale, Tile};

pub(crate) use blob::Blob;
pub(crate) use calculator::OffsetCalculator;
pub(crate) use image::{linear_to_srgb, srgb_to_linear};
pub(crate) use storage::AllocTable;
pub(crate) use tensor::{dispatch_dt, TensorView};
pub(crate) use tile::ScaleSrc;

/// 可以跨线程移动的裸指针，由提交者保证生命周期。
///
/// 闭包内通过 [SendPtr::ptr] 取指针，使闭包捕获整个包装而不是裸指针字段。
#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub(crate) struct SendPtr<T>(*mut T);

unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

impl<T> SendPtr<T> {
    #[inline]
    pub const fn new(ptr: *mut T) -> Self {
        Self(ptr)
    }

    #[inline]
    pub const fn ptr(self) -> *mut T {
        self.0
    }
}

#[cfg(test)]
#[allow(dead_code)]
pub(crate) mod test_utils {
    use super::Tensor;
    use digit_layout::types as ty;
    use half::f16;
    use std::fmt;

    /// 元素的逻辑序号到存储序号，图像类张量按 CHW 顺序。
    fn positions(t: &Tensor) -> Vec<usize> {
        let desc = t.desc();
        if !desc.layout.is_image() {
            return (0..desc.num_elements()).collect();
        }
        let mut ans = Vec::with_capacity(desc.num_elements());
        for c in 0..desc.c() {
            for h in 0..desc.h() {
                for w in 0..desc.w() {
                    ans.push(desc.index(c, h, w))
                }
            }
        }
        ans
    }

    /// 按逻辑顺序写入张量。
    pub fn fill(t: &Tensor, data: &[f32]) {
        let positions = positions(t);
        assert_eq!(positions.len(), data.len());
        for (i, &v) in positions.into_iter().zip(data) {
            unsafe {
                if t.desc().dt == ty::F16 {
                    t.view::<f16>().set(i, v)
                } else {
                    t.view::<f32>().set(i, v)
                }
            }
        }
    }

    /// 按逻辑顺序读出张量。
    pub fn dump(t: &Tensor) -> Vec<f32> {
        positions(t)
            .into_iter()
            .map(|i| unsafe {
                if t.desc().dt == ty::F16 {
                    t.view::<f16>().get(i)
                } else {
                    t.view::<f32>().get(i)
                }
            })
            .collect()
    }

    pub struct Diff {
        pub abs: f64,
        pub rel: f64,
    }

    impl Diff {
        pub fn new(a: f64, b: f64) -> Self {
            let abs = (a - b).abs();
            let rel = abs / (a.abs() + b.abs() + f64::EPSILON);
            Self { abs, rel }
        }
    }

    /// 统计两组结果的误差，超过两个阈值的元素计为离群。
    pub struct ErrorCollector {
        threshold: Diff,
        max_diff: Diff,
        outliers: Vec<usize>,
        count: usize,
    }

    impl ErrorCollector {
        pub fn new(abs: f64, rel: f64) -> Self {
            Self {
                threshold: Diff { abs, rel },
                max_diff: Diff { abs: 0., rel: 0. },
                outliers: vec![],
                count: 0,
            }
        }

        pub fn push(&mut self, diff: Diff) {
            self.max_diff.abs = f64::max(self.max_diff.abs, diff.abs);
            self.max_diff.rel = f64::max(self.max_diff.rel, diff.rel);
            if diff.abs > self.threshold.abs && diff.rel > self.threshold.rel {
                self.outliers.push(self.count);
            }
            self.count += 1;
        }

        pub fn summary(self) -> (usize, usize) {
            (self.outliers.len(), self.count)
        }
    }

    impl fmt::Display for ErrorCollector {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(
                f,
                "abs: {:.3e}, rel: {:.3e}, outliers: {}/{}",
                self.max_diff.abs,
                self.max_diff.rel,
                self.outliers.len(),
                self.count,
            )
        }
    }
}
