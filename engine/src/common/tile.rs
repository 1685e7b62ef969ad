use super::{invalid_argument, Error, SendPtr};

/// 图像和张量之间搬运的矩形区域。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Tile {
    /// 区域在源中的起点。
    pub h_src: usize,
    pub w_src: usize,
    /// 区域在目标中的起点。
    pub h_dst: usize,
    pub w_dst: usize,
    pub h: usize,
    pub w: usize,
}

impl Tile {
    /// 从两侧原点开始的 `h x w` 区域。
    #[inline]
    pub const fn origin(h: usize, w: usize) -> Self {
        Self {
            h_src: 0,
            w_src: 0,
            h_dst: 0,
            w_dst: 0,
            h,
            w,
        }
    }

    /// 检查区域是否同时落在两侧内，`src` 和 `dst` 为 `(高, 宽)`。
    pub(crate) fn check(&self, src: (usize, usize), dst: (usize, usize)) -> Result<(), Error> {
        let fits = |start: usize, len: usize, bound: usize| {
            start.checked_add(len).is_some_and(|end| end <= bound)
        };
        if fits(self.h_src, self.h, src.0)
            && fits(self.w_src, self.w, src.1)
            && fits(self.h_dst, self.h, dst.0)
            && fits(self.w_dst, self.w, dst.1)
        {
            Ok(())
        } else {
            Err(invalid_argument(format!(
                "{self:?} exceeds {}x{} source or {}x{} destination",
                src.0, src.1, dst.0, dst.1
            )))
        }
    }

    /// 目标坐标对应的源坐标，不在区域内时返回 `None`。
    #[inline]
    pub(crate) fn map(&self, h: usize, w: usize) -> Option<(usize, usize)> {
        let y = h.checked_sub(self.h_dst).filter(|&y| y < self.h)?;
        let x = w.checked_sub(self.w_dst).filter(|&x| x < self.w)?;
        Some((self.h_src + y, self.w_src + x))
    }
}

/// 输入缩放系数。
#[derive(Clone, Copy, Debug)]
pub enum Scale {
    Value(f32),
    /// 执行时从地址读取，例如自动曝光的结果。
    Pointer(*const f32),
}

unsafe impl Send for Scale {}
unsafe impl Sync for Scale {}

impl Default for Scale {
    #[inline]
    fn default() -> Self {
        Self::Value(1.)
    }
}

impl Scale {
    #[inline]
    pub(crate) fn send(self) -> ScaleSrc {
        match self {
            Self::Value(v) => ScaleSrc::Value(v),
            Self::Pointer(p) => ScaleSrc::Pointer(SendPtr::new(p.cast_mut())),
        }
    }
}

/// 可以移进任务的 [Scale]。
#[derive(Clone, Copy)]
pub(crate) enum ScaleSrc {
    Value(f32),
    Pointer(SendPtr<f32>),
}

impl ScaleSrc {
    /// # Safety
    ///
    /// 指针形式的系数在任务执行时必须有效。
    #[inline]
    pub unsafe fn get(self) -> f32 {
        match self {
            Self::Value(v) => v,
            Self::Pointer(p) => p.ptr().read(),
        }
    }
}
