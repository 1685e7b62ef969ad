//! 2x2 最大池化，步长 2。

use crate::{
    dispatch_dt,
    handle::Grid,
    invalid_argument,
    utils::{check_access, check_tensor, required},
    Element, Engine, Error, Operator, Tensor, TensorDesc,
};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PoolDesc {
    pub src: TensorDesc,
}

impl PoolDesc {
    /// 输出张量的描述。
    pub fn dst_desc(&self) -> Result<TensorDesc, Error> {
        let src = &self.src;
        if !src.layout.is_image() {
            return Err(invalid_argument(format!("pool source is {:?}", src.layout)));
        }
        if src.h() < 2 || src.w() < 2 {
            return Err(invalid_argument(format!(
                "pool source {}x{} is smaller than the window",
                src.h(),
                src.w()
            )));
        }
        src.with_chw(src.c(), src.h() / 2, src.w() / 2)
    }
}

pub struct Pool {
    engine: Engine,
    desc: PoolDesc,
    dst_desc: TensorDesc,
    src: Option<Tensor>,
    dst: Option<Tensor>,
}

impl Pool {
    pub(crate) fn new(engine: &Engine, desc: &PoolDesc) -> Result<Self, Error> {
        let dst_desc = desc.dst_desc()?;
        log::debug!("pool {:?} -> {:?}", desc.src.dims, dst_desc.dims);
        Ok(Self {
            engine: engine.clone(),
            desc: desc.clone(),
            dst_desc,
            src: None,
            dst: None,
        })
    }

    pub fn set_src(&mut self, src: Tensor) -> Result<(), Error> {
        check_tensor("pool src", &src, &self.desc.src)?;
        check_access(&self.engine, "pool src", src.as_ptr())?;
        self.src = Some(src);
        Ok(())
    }

    pub fn set_dst(&mut self, dst: Tensor) -> Result<(), Error> {
        check_tensor("pool dst", &dst, &self.dst_desc)?;
        check_access(&self.engine, "pool dst", dst.as_ptr())?;
        self.dst = Some(dst);
        Ok(())
    }
}

impl Operator for Pool {
    type Desc = PoolDesc;

    #[inline]
    fn desc(&self) -> &PoolDesc {
        &self.desc
    }

    fn submit(&self) -> Result<(), Error> {
        let src = required("pool", "src", &self.src)?.clone();
        let dst = required("pool", "dst", &self.dst)?.clone();
        let grid = self.engine.grid();
        let dt = self.desc.src.dt;
        self.engine
            .submit(Box::new(move || dispatch_dt!(dt, pool(grid, &src, &dst))));
        Ok(())
    }
}

fn pool<T: Element>(grid: Grid, src: &Tensor, dst: &Tensor) -> Result<(), Error> {
    let src = src.view::<T>();
    let dst = dst.view::<T>();
    let c = dst.desc.c();
    grid.for_each(dst.desc.h(), dst.desc.w(), |h, w| {
        for i in 0..c {
            unsafe {
                let y = src
                    .load(i, 2 * h, 2 * w)
                    .max(src.load(i, 2 * h, 2 * w + 1))
                    .max(src.load(i, 2 * h + 1, 2 * w))
                    .max(src.load(i, 2 * h + 1, 2 * w + 1));
                dst.store(i, h, w, y)
            }
        }
    });
    Ok(())
}
