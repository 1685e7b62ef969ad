use crate::{invalid_argument, Error, TensorDesc, TensorLayout};
use digit_layout::DigitLayout;

/// 卷积输出的激活函数。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Activation {
    #[default]
    None,
    Relu,
}

/// 同尺寸填充、步长 1 的二维卷积。
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ConvDesc {
    pub src: TensorDesc,
    /// `[O, I, KH, KW]`。
    pub weight: TensorDesc,
    /// `[O]`。
    pub bias: TensorDesc,
    pub activation: Activation,
}

pub(crate) struct Meta {
    pub dt: DigitLayout,
    pub layout: TensorLayout,
    pub ic: usize,
    pub oc: usize,
    pub h: usize,
    pub w: usize,
    pub kh: usize,
    pub kw: usize,
}

impl ConvDesc {
    pub(super) fn meta(&self) -> Result<Meta, Error> {
        let Self {
            src, weight, bias, ..
        } = self;

        if !src.layout.is_image() || src.dims.len() != 3 {
            return Err(invalid_argument(format!(
                "conv src is {:?} {:?}",
                src.layout, src.dims
            )));
        }
        if weight.layout != TensorLayout::Oihw {
            return Err(invalid_argument(format!(
                "conv weight is {:?}",
                weight.layout
            )));
        }
        if bias.layout != TensorLayout::X {
            return Err(invalid_argument(format!("conv bias is {:?}", bias.layout)));
        }
        if src.dt != weight.dt || src.dt != bias.dt {
            return Err(invalid_argument(format!(
                "conv types differ: {:?} {:?} {:?}",
                src.dt, weight.dt, bias.dt
            )));
        }

        let &[oc, ic, kh, kw] = &*weight.dims else {
            return Err(invalid_argument(format!("conv weight dims {:?}", weight.dims)));
        };
        let &[ob] = &*bias.dims else {
            return Err(invalid_argument(format!("conv bias dims {:?}", bias.dims)));
        };
        if ic != src.c() {
            return Err(invalid_argument(format!(
                "conv weight expects {ic} channels, src has {}",
                src.c()
            )));
        }
        if ob != oc {
            return Err(invalid_argument(format!(
                "conv bias has {ob} channels, weight has {oc}"
            )));
        }
        if kh % 2 == 0 || kw % 2 == 0 {
            return Err(invalid_argument(format!(
                "conv kernel {kh}x{kw} has no center"
            )));
        }

        Ok(Meta {
            dt: src.dt,
            layout: src.layout,
            ic,
            oc,
            h: src.h(),
            w: src.w(),
            kh,
            kw,
        })
    }

    /// 输出张量的描述，与输入同排布、同尺寸。
    pub fn dst_desc(&self) -> Result<TensorDesc, Error> {
        let meta = self.meta()?;
        self.src.with_chw(meta.oc, meta.h, meta.w)
    }
}
