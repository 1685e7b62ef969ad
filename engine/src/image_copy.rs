//! 同格式、同尺寸图像之间的复制，步长可以不同。

use crate::{
    invalid_argument,
    utils::{check_access, required},
    Engine, Error, Image, Operator,
};

pub struct ImageCopy {
    engine: Engine,
    src: Option<Image>,
    dst: Option<Image>,
}

impl ImageCopy {
    pub(crate) fn new(engine: &Engine) -> Self {
        Self {
            engine: engine.clone(),
            src: None,
            dst: None,
        }
    }

    pub fn set_src(&mut self, src: Image) -> Result<(), Error> {
        check_access(&self.engine, "image copy src", src.as_ptr())?;
        self.src = Some(src);
        Ok(())
    }

    pub fn set_dst(&mut self, dst: Image) -> Result<(), Error> {
        check_access(&self.engine, "image copy dst", dst.as_ptr())?;
        self.dst = Some(dst);
        Ok(())
    }
}

impl Operator for ImageCopy {
    type Desc = ();

    #[inline]
    fn desc(&self) -> &() {
        &()
    }

    fn submit(&self) -> Result<(), Error> {
        let src = *required("image copy", "src", &self.src)?;
        let dst = *required("image copy", "dst", &self.dst)?;
        let (s, d) = (src.desc(), dst.desc());
        if (s.format, s.width, s.height) != (d.format, d.width, d.height) {
            return Err(invalid_argument(format!(
                "cannot copy {:?} {}x{} into {:?} {}x{}",
                s.format, s.width, s.height, d.format, d.width, d.height
            )));
        }
        let grid = self.engine.grid();
        let (h, w) = (s.height, s.width);
        self.engine.submit(Box::new(move || {
            grid.for_each(h, w, |y, x| unsafe { src.copy_pixel(&dst, y, x) });
            Ok(())
        }));
        Ok(())
    }
}
