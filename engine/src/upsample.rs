//! 2 倍最近邻上采样。

use crate::{
    dispatch_dt,
    handle::Grid,
    invalid_argument,
    utils::{check_access, check_tensor, required},
    Element, Engine, Error, Operator, Tensor, TensorDesc,
};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct UpsampleDesc {
    pub src: TensorDesc,
}

impl UpsampleDesc {
    pub fn dst_desc(&self) -> Result<TensorDesc, Error> {
        let src = &self.src;
        if !src.layout.is_image() {
            return Err(invalid_argument(format!(
                "upsample source is {:?}",
                src.layout
            )));
        }
        src.with_chw(src.c(), src.h() * 2, src.w() * 2)
    }
}

pub struct Upsample {
    engine: Engine,
    desc: UpsampleDesc,
    dst_desc: TensorDesc,
    src: Option<Tensor>,
    dst: Option<Tensor>,
}

impl Upsample {
    pub(crate) fn new(engine: &Engine, desc: &UpsampleDesc) -> Result<Self, Error> {
        let dst_desc = desc.dst_desc()?;
        Ok(Self {
            engine: engine.clone(),
            desc: desc.clone(),
            dst_desc,
            src: None,
            dst: None,
        })
    }

    pub fn set_src(&mut self, src: Tensor) -> Result<(), Error> {
        check_tensor("upsample src", &src, &self.desc.src)?;
        check_access(&self.engine, "upsample src", src.as_ptr())?;
        self.src = Some(src);
        Ok(())
    }

    pub fn set_dst(&mut self, dst: Tensor) -> Result<(), Error> {
        check_tensor("upsample dst", &dst, &self.dst_desc)?;
        check_access(&self.engine, "upsample dst", dst.as_ptr())?;
        self.dst = Some(dst);
        Ok(())
    }
}

impl Operator for Upsample {
    type Desc = UpsampleDesc;

    #[inline]
    fn desc(&self) -> &UpsampleDesc {
        &self.desc
    }

    fn submit(&self) -> Result<(), Error> {
        let src = required("upsample", "src", &self.src)?.clone();
        let dst = required("upsample", "dst", &self.dst)?.clone();
        let grid = self.engine.grid();
        let dt = self.desc.src.dt;
        self.engine
            .submit(Box::new(move || dispatch_dt!(dt, upsample(grid, &src, &dst))));
        Ok(())
    }
}

fn upsample<T: Element>(grid: Grid, src: &Tensor, dst: &Tensor) -> Result<(), Error> {
    let src = src.view::<T>();
    let dst = dst.view::<T>();
    let c = dst.desc.c();
    grid.for_each(dst.desc.h(), dst.desc.w(), |h, w| {
        for i in 0..c {
            // 同类型之间搬运，不经过舍入
            unsafe { dst.store(i, h, w, src.load(i, h / 2, w / 2)) }
        }
    });
    Ok(())
}
