//! 把网络输出张量写回颜色图像。

use crate::{
    dispatch_dt,
    handle::Grid,
    invalid_argument,
    transfer::Transfer,
    utils::{check_access, check_tensor, required},
    Element, Engine, Error, Image, Operator, Scale, ScaleSrc, Tensor, TensorDesc, Tile,
};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OutputProcessDesc {
    pub src: TensorDesc,
    pub transfer: Transfer,
}

pub struct OutputProcess {
    engine: Engine,
    desc: OutputProcessDesc,
    src: Option<Tensor>,
    dst: Option<Image>,
    tile: Option<Tile>,
    scale: Scale,
}

impl OutputProcess {
    pub(crate) fn new(engine: &Engine, desc: &OutputProcessDesc) -> Result<Self, Error> {
        if !desc.src.layout.is_image() || desc.src.c() < 3 {
            return Err(invalid_argument(format!(
                "output tensor {:?} {:?} does not hold color",
                desc.src.layout, desc.src.dims
            )));
        }
        Ok(Self {
            engine: engine.clone(),
            desc: desc.clone(),
            src: None,
            dst: None,
            tile: None,
            scale: Scale::default(),
        })
    }

    pub fn set_src(&mut self, src: Tensor) -> Result<(), Error> {
        check_tensor("output src", &src, &self.desc.src)?;
        check_access(&self.engine, "output src", src.as_ptr())?;
        self.src = Some(src);
        Ok(())
    }

    pub fn set_dst(&mut self, dst: Image) -> Result<(), Error> {
        let format = dst.desc().format;
        if format.channels() != 3 {
            return Err(invalid_argument(format!("output image cannot be {format:?}")));
        }
        check_access(&self.engine, "output dst", dst.as_ptr())?;
        self.dst = Some(dst);
        Ok(())
    }

    /// 不设置时写满整幅图像。
    #[inline]
    pub fn set_tile(&mut self, tile: Tile) {
        self.tile = Some(tile)
    }

    /// 与输入处理使用同一个系数。
    #[inline]
    pub fn set_scale(&mut self, scale: Scale) {
        self.scale = scale
    }
}

impl Operator for OutputProcess {
    type Desc = OutputProcessDesc;

    #[inline]
    fn desc(&self) -> &OutputProcessDesc {
        &self.desc
    }

    fn submit(&self) -> Result<(), Error> {
        let src = required("output process", "src", &self.src)?.clone();
        let dst = *required("output process", "dst", &self.dst)?;
        let (h, w) = (dst.desc().height, dst.desc().width);
        let tile = self.tile.unwrap_or(Tile::origin(h, w));
        tile.check((src.desc().h(), src.desc().w()), (h, w))?;

        let grid = self.engine.grid();
        let scale = self.scale.send();
        let transfer = self.desc.transfer;
        let dt = self.desc.src.dt;
        self.engine.submit(Box::new(move || {
            dispatch_dt!(dt, output(grid, &src, &dst, tile, scale, transfer))
        }));
        Ok(())
    }
}

fn output<T: Element>(
    grid: Grid,
    src: &Tensor,
    dst: &Image,
    tile: Tile,
    scale: ScaleSrc,
    transfer: Transfer,
) -> Result<(), Error> {
    let src = src.view::<T>();
    let scale = unsafe { scale.get() };
    let max = if dst.desc().format.is_srgb() {
        1.
    } else {
        f32::MAX
    };
    grid.for_each(tile.h, tile.w, |y, x| {
        let (h, w) = (tile.h_src + y, tile.w_src + x);
        let rgb = [0, 1, 2].map(|c| {
            let v = transfer.inverse(unsafe { src.load(c, h, w) }) / scale;
            if v.is_finite() {
                v.clamp(0., max)
            } else {
                0.
            }
        });
        unsafe { dst.store(tile.h_dst + y, tile.w_dst + x, rgb) }
    });
    Ok(())
}

#[cfg(test)]
mod test {
    use super::OutputProcessDesc;
    use crate::{
        common_cpu,
        gpu::{self, soft::SoftPlatform},
        test_utils::fill,
        transfer::Transfer,
        Engine, ErrorKind, Format, ImageDesc, Operator, Scale, Storage, TensorDesc, Tile,
    };

    fn check(engine: &Engine, format: Format) {
        let src_desc = TensorDesc::chw(
            engine.tensor_layout().block(),
            2,
            2,
            engine.tensor_layout(),
            engine.tensor_dt(),
        )
        .unwrap();
        let image = ImageDesc::new(format, 3, 3).unwrap();
        let mem = engine
            .malloc(src_desc.byte_size() + image.byte_size(), Storage::Managed)
            .unwrap();
        let src = mem.tensor(0, src_desc.clone()).unwrap();
        let dst = mem.image(src_desc.byte_size(), image).unwrap();

        let mut data = vec![0.; src_desc.num_elements()];
        data[..12].copy_from_slice(&[0.5, 0.5, 0.5, 0.5, 4., 4., 4., 4., -1., -1., -1., -1.]);
        fill(&src, &data);
        for h in 0..3 {
            for w in 0..3 {
                unsafe { dst.store(h, w, [0.25; 3]) }
            }
        }

        let mut op = engine
            .new_output_process(&OutputProcessDesc {
                src: src_desc,
                transfer: Transfer::Linear,
            })
            .unwrap();
        op.set_src(src).unwrap();
        op.set_dst(dst).unwrap();
        op.set_scale(Scale::Value(2.));
        op.set_tile(Tile {
            h_src: 0,
            w_src: 0,
            h_dst: 1,
            w_dst: 1,
            h: 2,
            w: 2,
        });
        op.submit().unwrap();
        engine.wait().unwrap();

        let max = if format.is_srgb() { 1. } else { 2. };
        for h in 0..3 {
            for w in 0..3 {
                let expect = if h >= 1 && w >= 1 { [0.25, max, 0.] } else { [0.25; 3] };
                let ans = unsafe { dst.load(h, w) };
                for (a, b) in ans.iter().zip(expect) {
                    assert!((a - b).abs() < 1e-5, "{h} {w}: {ans:?}");
                }
            }
        }
        unsafe { engine.free(mem) }.unwrap();
    }

    #[test]
    fn test_write_back() {
        let cpu = Engine::cpu(&common_cpu::Config::default()).unwrap();
        check(&cpu, Format::Float3);
        check(&cpu, Format::Float3Srgb);
        let device = SoftPlatform::new().new_device(Default::default()).unwrap();
        let gpu = Engine::gpu(device, &gpu::Config::default());
        check(&gpu, Format::Float3);
        check(&gpu, Format::Float3Srgb);
    }

    #[test]
    fn test_tile_bounds() {
        let engine = Engine::cpu(&common_cpu::Config::default()).unwrap();
        let src_desc = TensorDesc::chw(8, 2, 2, engine.tensor_layout(), engine.tensor_dt()).unwrap();
        let image = ImageDesc::new(Format::Float3, 3, 3).unwrap();
        let mem = engine
            .malloc(src_desc.byte_size() + image.byte_size(), Storage::Host)
            .unwrap();
        let mut op = engine
            .new_output_process(&OutputProcessDesc {
                src: src_desc.clone(),
                transfer: Transfer::Log,
            })
            .unwrap();
        op.set_dst(mem.image(src_desc.byte_size(), image).unwrap()).unwrap();
        assert_eq!(op.submit().unwrap_err().kind, ErrorKind::UsageError);
        op.set_src(mem.tensor(0, src_desc).unwrap()).unwrap();
        // 默认区域是整幅图像，超出 2x2 的张量
        assert_eq!(op.submit().unwrap_err().kind, ErrorKind::InvalidArgument);
        unsafe { engine.free(mem) }.unwrap();
    }
}
