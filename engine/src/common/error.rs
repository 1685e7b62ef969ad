use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    InvalidArgument,
    UsageError,
    ExecutionFailed,
    UnsupportedConfiguration,
    OutOfMemory,
}

/// 引擎错误。
///
/// 构造期错误同步返回；执行期错误记录在完成令牌上，在下一个同步点返回。
#[derive(Clone, Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub info: String,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.info)
    }
}

impl std::error::Error for Error {}

pub(super) mod functions {
    use super::{Error, ErrorKind::*};

    macro_rules! builder {
        ($ty:ident: $name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> $ty {
                $ty {
                    kind: $kind,
                    info: info.into(),
                }
            }
        };
    }

    builder!(Error: invalid_argument  InvalidArgument         );
    builder!(Error: usage_error       UsageError              );
    builder!(Error: execution_failed  ExecutionFailed         );
    builder!(Error: unsupported       UnsupportedConfiguration);
    builder!(Error: out_of_memory     OutOfMemory             );
}
