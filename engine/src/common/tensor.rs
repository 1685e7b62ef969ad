use super::{invalid_argument, Error};
use digit_layout::{types as ty, DigitLayout};
use half::f16;

/// 张量的内存排布。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TensorLayout {
    /// 一维向量，例如偏置。
    X,
    Chw,
    /// 通道按 8 分块，块内通道连续。
    Chw8c,
    /// 通道按 16 分块，块内通道连续。
    Chw16c,
    /// 卷积权重 `[O, I, KH, KW]`。
    Oihw,
}

impl TensorLayout {
    #[inline]
    pub const fn ndim(self) -> usize {
        match self {
            Self::X => 1,
            Self::Chw | Self::Chw8c | Self::Chw16c => 3,
            Self::Oihw => 4,
        }
    }

    /// 通道块大小。
    #[inline]
    pub const fn block(self) -> usize {
        match self {
            Self::Chw8c => 8,
            Self::Chw16c => 16,
            _ => 1,
        }
    }

    #[inline]
    pub const fn is_image(self) -> bool {
        matches!(self, Self::Chw | Self::Chw8c | Self::Chw16c)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct TensorDesc {
    pub dims: Vec<usize>,
    pub layout: TensorLayout,
    pub dt: DigitLayout,
}

impl TensorDesc {
    pub fn new(dims: &[usize], layout: TensorLayout, dt: DigitLayout) -> Result<Self, Error> {
        if dims.len() != layout.ndim() {
            return Err(invalid_argument(format!(
                "{layout:?} expects {} dims, got {dims:?}",
                layout.ndim()
            )));
        }
        if dims.contains(&0) {
            return Err(invalid_argument(format!("tensor dims {dims:?} are empty")));
        }
        if layout.is_image() && dims[0] % layout.block() != 0 {
            return Err(invalid_argument(format!(
                "{} channels are not padded to {layout:?}",
                dims[0]
            )));
        }
        if dt != ty::F32 && dt != ty::F16 {
            return Err(invalid_argument(format!("tensor type {dt:?} not supported")));
        }
        Ok(Self {
            dims: dims.to_vec(),
            layout,
            dt,
        })
    }

    #[inline]
    pub fn chw(
        c: usize,
        h: usize,
        w: usize,
        layout: TensorLayout,
        dt: DigitLayout,
    ) -> Result<Self, Error> {
        Self::new(&[c, h, w], layout, dt)
    }

    #[inline]
    pub fn c(&self) -> usize {
        self.dims[0]
    }

    #[inline]
    pub fn h(&self) -> usize {
        self.dims[1]
    }

    #[inline]
    pub fn w(&self) -> usize {
        self.dims[2]
    }

    #[inline]
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        if self.dt == ty::F16 {
            size_of::<f16>()
        } else {
            size_of::<f32>()
        }
    }

    #[inline]
    pub fn byte_size(&self) -> usize {
        self.num_elements() * self.elem_size()
    }

    /// 同一张量换一个通道数、高、宽。
    pub(crate) fn with_chw(&self, c: usize, h: usize, w: usize) -> Result<Self, Error> {
        Self::chw(c, h, w, self.layout, self.dt)
    }

    /// 图像类张量中 `(c, h, w)` 的元素序号。
    #[inline]
    pub(crate) fn index(&self, c: usize, h: usize, w: usize) -> usize {
        let hw = self.h() * self.w();
        match self.layout.block() {
            1 => c * hw + h * self.w() + w,
            b => ((c / b) * hw + h * self.w() + w) * b + c % b,
        }
    }
}

/// 绑定到算子的张量：基址和布局。
#[derive(Clone, Debug)]
pub struct Tensor {
    ptr: *mut u8,
    desc: TensorDesc,
}

unsafe impl Send for Tensor {}
unsafe impl Sync for Tensor {}

impl Tensor {
    /// # Safety
    ///
    /// `ptr` 开始的 `desc.byte_size()` 字节必须在算子执行完成前保持有效，
    /// 并且可以被执行算子的设备访问。
    #[inline]
    pub unsafe fn new(ptr: *mut u8, desc: TensorDesc) -> Self {
        Self { ptr, desc }
    }

    #[inline]
    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub(crate) fn view<T: Element>(&self) -> TensorView<T> {
        TensorView {
            ptr: self.ptr.cast(),
            desc: self.desc.clone(),
        }
    }
}

/// 与 f32 双向转换的张量元素。
pub trait Element: Copy + Send + Sync + 'static {
    fn from_f32(f: f32) -> Self;
    fn to_f32(self) -> f32;
}

impl Element for f32 {
    #[inline]
    fn from_f32(f: f32) -> Self {
        f
    }
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

impl Element for f16 {
    #[inline]
    fn from_f32(f: f32) -> Self {
        f16::from_f32(f)
    }
    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}

/// 确定元素类型的张量访问器，供核函数使用。
#[derive(Clone)]
pub(crate) struct TensorView<T> {
    ptr: *mut T,
    pub desc: TensorDesc,
}

unsafe impl<T> Send for TensorView<T> {}
unsafe impl<T> Sync for TensorView<T> {}

impl<T: Element> TensorView<T> {
    #[inline]
    pub unsafe fn get(&self, i: usize) -> f32 {
        self.ptr.add(i).read().to_f32()
    }

    #[inline]
    pub unsafe fn set(&self, i: usize, val: f32) {
        self.ptr.add(i).write(T::from_f32(val))
    }

    #[inline]
    pub unsafe fn load(&self, c: usize, h: usize, w: usize) -> f32 {
        self.get(self.desc.index(c, h, w))
    }

    #[inline]
    pub unsafe fn store(&self, c: usize, h: usize, w: usize, val: f32) {
        self.set(self.desc.index(c, h, w), val)
    }
}

/// 按张量元素类型展开泛型核函数。
macro_rules! dispatch_dt {
    ($dt:expr, $f:ident ( $($arg:expr),* )) => {{
        use digit_layout::types as ty;
        match $dt {
            ty::F16 => $f::<half::f16>($($arg),*),
            ty::F32 => $f::<f32>($($arg),*),
            dt => Err($crate::unsupported(format!("tensor type {dt:?} not supported"))),
        }
    }};
}

pub(crate) use dispatch_dt;
