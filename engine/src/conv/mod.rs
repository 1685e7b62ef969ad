//! 卷积。
//!
//! CPU 上使用 im2col + GEMM；加速器上按架构在直接卷积的几个变体中选择最快的可用变体。

mod args;
mod common_cpu;
pub(crate) mod gpu;

pub use args::{Activation, ConvDesc};
pub use gpu::{Kernel, Scheme};

use crate::{
    dispatch_dt,
    handle::Backend,
    utils::{check_access, check_tensor, required},
    Engine, Error, Operator, Tensor, TensorDesc,
};
use gpu::direct;

/// 工厂选定的卷积实现。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConvImpl {
    Im2Col,
    Direct(Kernel, Scheme),
}

pub struct Conv {
    engine: Engine,
    desc: ConvDesc,
    dst_desc: TensorDesc,
    imp: ConvImpl,
    src: Option<Tensor>,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    dst: Option<Tensor>,
}

/// 一次发射绑定的全部张量。
struct Args {
    src: Tensor,
    weight: Tensor,
    bias: Tensor,
    dst: Tensor,
    relu: bool,
}

impl Conv {
    pub(crate) fn new(engine: &Engine, desc: &ConvDesc) -> Result<Self, Error> {
        let meta = desc.meta()?;
        let dst_desc = desc.dst_desc()?;
        let imp = match engine.backend() {
            Backend::Cpu(_) => {
                common_cpu::check(&meta)?;
                ConvImpl::Im2Col
            }
            Backend::Gpu(gpu) => {
                let kernel = Kernel::select(gpu, &meta);
                ConvImpl::Direct(kernel, Scheme::plan(gpu, kernel, &meta))
            }
        };
        log::debug!(
            "conv {}->{} {}x{} on {}x{}: {imp:?}",
            meta.ic,
            meta.oc,
            meta.kh,
            meta.kw,
            meta.h,
            meta.w
        );
        Ok(Self {
            engine: engine.clone(),
            desc: desc.clone(),
            dst_desc,
            imp,
            src: None,
            weight: None,
            bias: None,
            dst: None,
        })
    }

    #[inline]
    pub fn implementation(&self) -> ConvImpl {
        self.imp
    }

    #[inline]
    pub fn dst_desc(&self) -> &TensorDesc {
        &self.dst_desc
    }

    pub fn set_src(&mut self, src: Tensor) -> Result<(), Error> {
        self.src = Some(self.bind("conv src", src, &self.desc.src)?);
        Ok(())
    }

    pub fn set_weight(&mut self, weight: Tensor) -> Result<(), Error> {
        self.weight = Some(self.bind("conv weight", weight, &self.desc.weight)?);
        Ok(())
    }

    pub fn set_bias(&mut self, bias: Tensor) -> Result<(), Error> {
        self.bias = Some(self.bind("conv bias", bias, &self.desc.bias)?);
        Ok(())
    }

    pub fn set_dst(&mut self, dst: Tensor) -> Result<(), Error> {
        self.dst = Some(self.bind("conv dst", dst, &self.dst_desc)?);
        Ok(())
    }

    fn bind(&self, name: &str, tensor: Tensor, desc: &TensorDesc) -> Result<Tensor, Error> {
        check_tensor(name, &tensor, desc)?;
        check_access(&self.engine, name, tensor.as_ptr())?;
        Ok(tensor)
    }
}

impl Operator for Conv {
    type Desc = ConvDesc;

    #[inline]
    fn desc(&self) -> &ConvDesc {
        &self.desc
    }

    fn submit(&self) -> Result<(), Error> {
        let args = Args {
            src: required("conv", "src", &self.src)?.clone(),
            weight: required("conv", "weight", &self.weight)?.clone(),
            bias: required("conv", "bias", &self.bias)?.clone(),
            dst: required("conv", "dst", &self.dst)?.clone(),
            relu: self.desc.activation == Activation::Relu,
        };
        match self.imp {
            ConvImpl::Im2Col => self.engine.submit(Box::new(move || common_cpu::launch(&args))),
            ConvImpl::Direct(kernel, scheme) => {
                let grid = self.engine.grid();
                let dt = self.desc.src.dt;
                self.engine.submit(Box::new(move || {
                    dispatch_dt!(dt, direct(grid, kernel, scheme, &args))
                }))
            }
        }
        Ok(())
    }
}
