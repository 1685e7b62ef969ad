//! 把颜色和辅助特征图像整理成网络输入张量。

use crate::{
    dispatch_dt,
    handle::Grid,
    invalid_argument,
    transfer::Transfer,
    utils::{check_access, check_tensor, required},
    Element, Engine, Error, Format, Image, Operator, Scale, ScaleSrc, Tensor, TensorDesc, Tile,
};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InputProcessDesc {
    pub dst: TensorDesc,
    /// 颜色通道的传输函数。
    pub transfer: Transfer,
}

pub struct InputProcess {
    engine: Engine,
    desc: InputProcessDesc,
    color: Option<Image>,
    albedo: Option<Image>,
    normal: Option<Image>,
    dst: Option<Tensor>,
    tile: Option<Tile>,
    scale: Scale,
}

impl InputProcess {
    pub(crate) fn new(engine: &Engine, desc: &InputProcessDesc) -> Result<Self, Error> {
        if !desc.dst.layout.is_image() || desc.dst.c() < 3 {
            return Err(invalid_argument(format!(
                "input tensor {:?} {:?} cannot hold color",
                desc.dst.layout, desc.dst.dims
            )));
        }
        Ok(Self {
            engine: engine.clone(),
            desc: desc.clone(),
            color: None,
            albedo: None,
            normal: None,
            dst: None,
            tile: None,
            scale: Scale::default(),
        })
    }

    pub fn set_color(&mut self, color: Image) -> Result<(), Error> {
        self.color = Some(self.feature("color", color, false)?);
        Ok(())
    }

    pub fn set_albedo(&mut self, albedo: Option<Image>) -> Result<(), Error> {
        self.albedo = albedo
            .map(|image| self.feature("albedo", image, false))
            .transpose()?;
        Ok(())
    }

    pub fn set_normal(&mut self, normal: Option<Image>) -> Result<(), Error> {
        self.normal = normal
            .map(|image| self.feature("normal", image, true))
            .transpose()?;
        Ok(())
    }

    pub fn set_dst(&mut self, dst: Tensor) -> Result<(), Error> {
        check_tensor("input dst", &dst, &self.desc.dst)?;
        check_access(&self.engine, "input dst", dst.as_ptr())?;
        self.dst = Some(dst);
        Ok(())
    }

    /// 不设置时搬运整幅颜色图像。
    #[inline]
    pub fn set_tile(&mut self, tile: Tile) {
        self.tile = Some(tile)
    }

    #[inline]
    pub fn set_scale(&mut self, scale: Scale) {
        self.scale = scale
    }

    fn feature(&self, name: &str, image: Image, linear: bool) -> Result<Image, Error> {
        let format = image.desc().format;
        if format.channels() != 3 || (linear && format != Format::Float3) {
            return Err(invalid_argument(format!("{name} image cannot be {format:?}")));
        }
        check_access(&self.engine, name, image.as_ptr())?;
        Ok(image)
    }
}

impl Operator for InputProcess {
    type Desc = InputProcessDesc;

    #[inline]
    fn desc(&self) -> &InputProcessDesc {
        &self.desc
    }

    fn submit(&self) -> Result<(), Error> {
        let color = *required("input process", "color", &self.color)?;
        let dst = required("input process", "dst", &self.dst)?.clone();
        let (h, w) = (color.desc().height, color.desc().width);

        for (name, image) in [("albedo", &self.albedo), ("normal", &self.normal)] {
            if let Some(image) = image {
                if (image.desc().height, image.desc().width) != (h, w) {
                    return Err(invalid_argument(format!(
                        "{name} size differs from color {w}x{h}"
                    )));
                }
            }
        }
        let channels = 3 * (1 + self.albedo.is_some() as usize + self.normal.is_some() as usize);
        if channels > dst.desc().c() {
            return Err(invalid_argument(format!(
                "{channels} input channels do not fit {} tensor channels",
                dst.desc().c()
            )));
        }
        let tile = self.tile.unwrap_or(Tile::origin(h, w));
        tile.check((h, w), (dst.desc().h(), dst.desc().w()))?;

        let kernel = Kernel {
            grid: self.engine.grid(),
            color,
            albedo: self.albedo,
            normal: self.normal,
            tile,
            scale: self.scale.send(),
            transfer: self.desc.transfer,
        };
        let dt = self.desc.dst.dt;
        self.engine
            .submit(Box::new(move || dispatch_dt!(dt, input(&kernel, &dst))));
        Ok(())
    }
}

struct Kernel {
    grid: Grid,
    color: Image,
    albedo: Option<Image>,
    normal: Option<Image>,
    tile: Tile,
    scale: ScaleSrc,
    transfer: Transfer,
}

#[inline]
fn sanitize(x: f32) -> f32 {
    if x.is_finite() {
        x
    } else {
        0.
    }
}

fn input<T: Element>(k: &Kernel, dst: &Tensor) -> Result<(), Error> {
    let dst = dst.view::<T>();
    let scale = unsafe { k.scale.get() };
    let c = dst.desc.c();
    k.grid.for_each(dst.desc.h(), dst.desc.w(), |h, w| {
        let mut values = [0f32; 9];
        let mut n = 0;
        if let Some((y, x)) = k.tile.map(h, w) {
            let mut push = |v: f32| {
                values[n] = v;
                n += 1
            };
            for v in unsafe { k.color.load(y, x) } {
                push(k.transfer.forward(sanitize(v * scale)))
            }
            if let Some(albedo) = &k.albedo {
                for v in unsafe { albedo.load(y, x) } {
                    push(sanitize(v).clamp(0., 1.))
                }
            }
            if let Some(normal) = &k.normal {
                for v in unsafe { normal.load(y, x) } {
                    push(sanitize(v).clamp(-1., 1.) * 0.5 + 0.5)
                }
            }
        }
        for i in 0..c {
            let v = if i < n { values[i] } else { 0. };
            unsafe { dst.store(i, h, w, v) }
        }
    });
    Ok(())
}
