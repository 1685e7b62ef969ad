//! CPU 上的二维二分归约树。

use super::{downsample, Bins, LogSum};
use crate::{Engine, Image, SendPtr};
use std::ops::Range;

/// 叶子上顺序归约的箱数。
const GRAIN: usize = 8;

pub(super) fn submit(engine: &Engine, bins: Bins, src: Image, dst: SendPtr<f32>) {
    engine.submit(Box::new(move || {
        let total = reduce(&src, &bins, 0..bins.h, 0..bins.w);
        unsafe { dst.ptr().write(total.exposure()) };
        Ok(())
    }))
}

/// 归约 `rows x cols` 范围内的箱。
///
/// 较长的一维从中点二分，分裂点只取决于范围，与线程数和任务窃取无关。
pub(super) fn reduce(src: &Image, bins: &Bins, rows: Range<usize>, cols: Range<usize>) -> LogSum {
    if rows.len() * cols.len() <= GRAIN {
        let mut sum = LogSum::default();
        for i in rows {
            for j in cols.clone() {
                sum = sum + LogSum::of(unsafe { downsample(src, bins, i, j) })
            }
        }
        return sum;
    }
    let (a, b) = if rows.len() >= cols.len() {
        let mid = rows.start + rows.len() / 2;
        rayon::join(
            || reduce(src, bins, rows.start..mid, cols.clone()),
            || reduce(src, bins, mid..rows.end, cols.clone()),
        )
    } else {
        let mid = cols.start + cols.len() / 2;
        rayon::join(
            || reduce(src, bins, rows.clone(), cols.start..mid),
            || reduce(src, bins, rows.clone(), mid..cols.end),
        )
    };
    a + b
}

#[cfg(test)]
mod test {
    use super::reduce;
    use crate::{autoexposure::Bins, Format, Image, ImageDesc};

    #[test]
    fn test_uniform_bins() {
        let desc = ImageDesc::new(Format::Float3, 32, 32).unwrap();
        let mut data = vec![0.5f32; 32 * 32 * 3];
        let src = unsafe { Image::new(data.as_mut_ptr().cast(), desc) };
        let bins = Bins::new(32, 32);
        assert_eq!((bins.h, bins.w), (2, 2));

        let total = reduce(&src, &bins, 0..bins.h, 0..bins.w);
        assert_eq!(total.count, 4);
        assert!((total.sum - 4. * 0.5f32.log2()).abs() < 1e-5);
        assert!((total.exposure() - 0.36).abs() < 1e-5);
    }

    #[test]
    fn test_split_points() {
        let desc = ImageDesc::new(Format::Float3, 200, 120).unwrap();
        let mut data = (0..200 * 120 * 3)
            .map(|i| ((i * 37 % 101) as f32 / 25.).exp2() / 16.)
            .collect::<Vec<_>>();
        let src = unsafe { Image::new(data.as_mut_ptr().cast(), desc) };
        let bins = Bins::new(120, 200);

        let expect = reduce(&src, &bins, 0..bins.h, 0..bins.w);
        let pools = [1, 3, 8].map(|n| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .unwrap()
        });
        for pool in pools {
            let ans = pool.install(|| reduce(&src, &bins, 0..bins.h, 0..bins.w));
            assert_eq!(ans.count, expect.count);
            assert_eq!(ans.sum.to_bits(), expect.sum.to_bits());
        }
    }
}
