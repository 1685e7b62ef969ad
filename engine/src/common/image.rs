use super::{invalid_argument, Error};

/// 图像像素格式，通道均为 f32。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Format {
    Undefined,
    Float,
    Float2,
    Float3,
    /// 3 通道，值经过 sRGB 伽马编码。
    Float3Srgb,
}

impl Format {
    #[inline]
    pub const fn channels(self) -> usize {
        match self {
            Self::Undefined => 0,
            Self::Float => 1,
            Self::Float2 => 2,
            Self::Float3 | Self::Float3Srgb => 3,
        }
    }

    #[inline]
    pub const fn nbytes(self) -> usize {
        self.channels() * size_of::<f32>()
    }

    #[inline]
    pub const fn is_srgb(self) -> bool {
        matches!(self, Self::Float3Srgb)
    }
}

impl TryFrom<u32> for Format {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Undefined),
            1 => Ok(Self::Float),
            2 => Ok(Self::Float2),
            3 => Ok(Self::Float3),
            4 => Ok(Self::Float3Srgb),
            _ => Err(invalid_argument(format!("invalid image format {value}"))),
        }
    }
}

/// 二维图像的布局。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ImageDesc {
    pub format: Format,
    pub width: usize,
    pub height: usize,
    /// 相邻像素的字节距离。
    pub pixel_stride: usize,
    /// 相邻行的字节距离。
    pub row_stride: usize,
}

impl ImageDesc {
    /// 紧密排布的图像。
    pub fn new(format: Format, width: usize, height: usize) -> Result<Self, Error> {
        Self::with_strides(format, width, height, 0, 0)
    }

    /// 步长为 0 表示紧密排布。
    pub fn with_strides(
        format: Format,
        width: usize,
        height: usize,
        pixel_stride: usize,
        row_stride: usize,
    ) -> Result<Self, Error> {
        if format == Format::Undefined {
            return Err(invalid_argument("image format is undefined"));
        }
        if width == 0 || height == 0 {
            return Err(invalid_argument(format!(
                "image size {width}x{height} is empty"
            )));
        }
        let pixel_stride = if pixel_stride == 0 {
            format.nbytes()
        } else {
            pixel_stride
        };
        if pixel_stride < format.nbytes() || pixel_stride % size_of::<f32>() != 0 {
            return Err(invalid_argument(format!(
                "pixel stride {pixel_stride} does not fit {format:?}"
            )));
        }
        let row_stride = if row_stride == 0 {
            width * pixel_stride
        } else {
            row_stride
        };
        if row_stride < width * pixel_stride || row_stride % size_of::<f32>() != 0 {
            return Err(invalid_argument(format!(
                "row stride {row_stride} is smaller than {width} pixels"
            )));
        }
        Ok(Self {
            format,
            width,
            height,
            pixel_stride,
            row_stride,
        })
    }

    /// 图像覆盖的字节数。
    #[inline]
    pub fn byte_size(&self) -> usize {
        (self.height - 1) * self.row_stride + (self.width - 1) * self.pixel_stride + self.format.nbytes()
    }

    #[inline]
    pub(crate) fn offset(&self, h: usize, w: usize) -> usize {
        h * self.row_stride + w * self.pixel_stride
    }
}

/// 绑定到算子的图像：基址和布局。
#[derive(Clone, Copy, Debug)]
pub struct Image {
    ptr: *mut u8,
    desc: ImageDesc,
}

unsafe impl Send for Image {}
unsafe impl Sync for Image {}

impl Image {
    /// # Safety
    ///
    /// `ptr` 开始的 `desc.byte_size()` 字节必须在算子执行完成前保持有效，
    /// 并且可以被执行算子的设备访问。
    #[inline]
    pub unsafe fn new(ptr: *mut u8, desc: ImageDesc) -> Self {
        Self { ptr, desc }
    }

    #[inline]
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// 读取像素，缺少的通道为 0，sRGB 格式解码为线性值。
    #[inline]
    pub(crate) unsafe fn load(&self, h: usize, w: usize) -> [f32; 3] {
        let p = self.ptr.add(self.desc.offset(h, w)).cast::<f32>();
        let mut ans = [0.; 3];
        for (c, v) in ans.iter_mut().enumerate().take(self.desc.format.channels()) {
            *v = p.add(c).read_unaligned();
        }
        if self.desc.format.is_srgb() {
            ans = ans.map(srgb_to_linear);
        }
        ans
    }

    /// 写入像素，多余的通道丢弃，sRGB 格式先编码。
    #[inline]
    pub(crate) unsafe fn store(&self, h: usize, w: usize, mut val: [f32; 3]) {
        if self.desc.format.is_srgb() {
            val = val.map(linear_to_srgb);
        }
        let p = self.ptr.add(self.desc.offset(h, w)).cast::<f32>();
        for (c, v) in val.iter().enumerate().take(self.desc.format.channels()) {
            p.add(c).write_unaligned(*v);
        }
    }

    /// 按原始字节复制一个像素。
    #[inline]
    pub(crate) unsafe fn copy_pixel(&self, dst: &Image, h: usize, w: usize) {
        std::ptr::copy_nonoverlapping(
            self.ptr.add(self.desc.offset(h, w)),
            dst.ptr.add(dst.desc.offset(h, w)),
            self.desc.format.nbytes(),
        )
    }
}

pub(crate) fn srgb_to_linear(x: f32) -> f32 {
    if x <= 0.04045 {
        x / 12.92
    } else {
        ((x + 0.055) / 1.055).powf(2.4)
    }
}

pub(crate) fn linear_to_srgb(x: f32) -> f32 {
    if x <= 0.0031308 {
        x * 12.92
    } else {
        1.055 * x.powf(1. / 2.4) - 0.055
    }
}
