pub mod common_cpu;
pub mod gpu;

use common_cpu::Cpu;
use gpu::Gpu;
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};

/// 引擎的后端，封闭集合。
pub(crate) enum Backend {
    Cpu(Cpu),
    Gpu(Gpu),
}

/// 核函数在二维网格上的发射方式。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Grid {
    /// 每行一个任务，行内顺序执行。
    Rows,
    /// 每个工作项一个位置，按工作组大小成组调度。
    Items { group: usize },
}

impl Grid {
    pub fn for_each(self, h: usize, w: usize, f: impl Fn(usize, usize) + Send + Sync) {
        match self {
            Self::Rows => (0..h).into_par_iter().for_each(|y| {
                for x in 0..w {
                    f(y, x)
                }
            }),
            Self::Items { group } => (0..h * w)
                .into_par_iter()
                .with_min_len(group.max(1))
                .for_each(|i| f(i / w, i % w)),
        }
    }
}

impl Backend {
    #[inline]
    pub fn grid(&self) -> Grid {
        match self {
            Self::Cpu(_) => Grid::Rows,
            Self::Gpu(gpu) => Grid::Items {
                group: gpu.max_work_group_size(),
            },
        }
    }
}
