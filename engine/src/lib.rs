//! 图像降噪管线的异构执行引擎。
//!
//! [Engine] 绑定一个物理设备，提供存储分配、按提交顺序执行的命令流和算子工厂。

mod common;
mod engine;
mod handle;
mod stream;
mod utils;

pub mod autoexposure;
pub mod conv;
pub mod image_copy;
pub mod input_process;
pub mod output_process;
pub mod pool;
pub mod transfer;
pub mod upsample;

pub use common::*;
pub use engine::{DeviceInfo, Engine, Family};
pub use handle::{common_cpu, gpu};

/// 算子。
///
/// 算子由引擎的工厂方法创建，创建后描述不可变；绑定缓冲后调用 [Operator::submit]
/// 将计算挂到引擎的命令流上。
pub trait Operator {
    /// 算子的形状和参数描述。
    type Desc;

    fn desc(&self) -> &Self::Desc;

    /// 发射算子，不阻塞。
    ///
    /// 必需的绑定缺失时返回 [ErrorKind::UsageError]，不会有任何工作入队。
    fn submit(&self) -> Result<(), Error>;
}
