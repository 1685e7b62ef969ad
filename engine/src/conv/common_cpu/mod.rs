//! CPU 上的 im2col + GEMM 卷积。

use super::{args::Meta, Args};
use crate::{unsupported, Error};
use digit_layout::types as ty;
use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::{ParallelSlice, ParallelSliceMut},
};

pub(super) fn check(meta: &Meta) -> Result<(), Error> {
    if meta.dt == ty::F32 {
        Ok(())
    } else {
        Err(unsupported(format!(
            "cpu conv computes in f32, got {:?}",
            meta.dt
        )))
    }
}

pub(super) fn launch(args: &Args) -> Result<(), Error> {
    let x = args.src.view::<f32>();
    let b = args.bias.view::<f32>();
    let y = args.dst.view::<f32>();
    let &[oc, ic, kh, kw] = &*args.weight.desc().dims else {
        return Err(unsupported("conv weight is not 4-d"));
    };
    let (h, w) = (x.desc.h(), x.desc.w());
    let n = h * w;
    let k = ic * kh * kw;

    // [ic * kh * kw, h * w]
    let mut col = vec![0f32; k * n];
    col.par_chunks_mut(n).enumerate().for_each(|(row, col)| {
        let (i, ky, kx) = (row / (kh * kw), row / kw % kh, row % kw);
        for oy in 0..h {
            let Some(iy) = (oy + ky).checked_sub(kh / 2).filter(|&y| y < h) else {
                continue;
            };
            for ox in 0..w {
                if let Some(ix) = (ox + kx).checked_sub(kw / 2).filter(|&x| x < w) {
                    col[oy * w + ox] = unsafe { x.load(i, iy, ix) }
                }
            }
        }
    });

    // [oc, ic * kh * kw] x [ic * kh * kw, h * w]
    let mut out = vec![0f32; oc * n];
    unsafe {
        gemm::gemm(
            oc,
            n,
            k,
            out.as_mut_ptr(),
            1,
            n as isize,
            false,
            args.weight.as_ptr().cast::<f32>(),
            1,
            k as isize,
            col.as_ptr(),
            1,
            n as isize,
            0.,
            1.,
            false,
            false,
            false,
            gemm::Parallelism::Rayon(0),
        )
    }

    out.par_chunks(n).enumerate().for_each(|(o, row)| {
        let bias = unsafe { b.get(o) };
        for (i, &v) in row.iter().enumerate() {
            let v = v + bias;
            let v = if args.relu { v.max(0.) } else { v };
            unsafe { y.store(o, i / w, i % w, v) }
        }
    });
    Ok(())
}
