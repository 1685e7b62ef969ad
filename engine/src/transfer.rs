//! 颜色的传输函数，把线性值映射到网络输入的值域。

use crate::{linear_to_srgb, srgb_to_linear};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum Transfer {
    #[default]
    Linear,
    /// sRGB 伽马曲线。
    Srgb,
    /// `ln(1 + x)`，用于高动态范围输入。
    Log,
}

impl Transfer {
    /// 线性值到网络值域，负值截断为 0。
    #[inline]
    pub fn forward(self, x: f32) -> f32 {
        let x = x.max(0.);
        match self {
            Self::Linear => x,
            Self::Srgb => linear_to_srgb(x),
            Self::Log => x.ln_1p(),
        }
    }

    #[inline]
    pub fn inverse(self, y: f32) -> f32 {
        let y = y.max(0.);
        match self {
            Self::Linear => y,
            Self::Srgb => srgb_to_linear(y),
            Self::Log => y.exp_m1(),
        }
    }
}
