use crate::{
    handle::Backend, invalid_argument, usage_error, Engine, Error, Storage, Tensor, TensorDesc,
};

/// 取出必需的绑定。
pub(crate) fn required<'a, T>(op: &str, name: &str, binding: &'a Option<T>) -> Result<&'a T, Error> {
    binding
        .as_ref()
        .ok_or_else(|| usage_error(format!("{op}: {name} is not bound")))
}

pub(crate) fn check_tensor(name: &str, tensor: &Tensor, expected: &TensorDesc) -> Result<(), Error> {
    if tensor.desc() == expected {
        Ok(())
    } else {
        Err(invalid_argument(format!(
            "{name} is {:?}, expected {expected:?}",
            tensor.desc()
        )))
    }
}

/// 加速器不能访问的地址不能绑定到算子。
pub(crate) fn check_access(engine: &Engine, name: &str, ptr: *const u8) -> Result<(), Error> {
    match engine.backend() {
        Backend::Cpu(_) => Ok(()),
        Backend::Gpu(_) => match engine.pointer_storage(ptr) {
            Storage::Undefined => Err(invalid_argument(format!(
                "{name} at {ptr:?} is not accessible from {}",
                engine.device().name
            ))),
            _ => Ok(()),
        },
    }
}
