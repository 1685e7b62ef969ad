use lru::LruCache;
use std::{hash::Hash, num::NonZeroUsize, sync::Mutex};

/// 发射方案缓存的容量，按方案多样性分级。
///
/// 容量为 0 的级别按 1 处理，缓存至少保留最近一个方案。
#[derive(Clone, Debug)]
pub struct SchemeCacheSize {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

impl Default for SchemeCacheSize {
    fn default() -> Self {
        Self {
            low: 4,
            medium: 16,
            high: 64,
        }
    }
}

/// 一类算子的方案随形状变化的剧烈程度。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchemeDiversity {
    /// 方案几乎不随形状变化。
    Low,
    /// 方案随少数几个维度变化，例如卷积的通道数和图像尺寸。
    Medium,
    High,
}

impl SchemeCacheSize {
    pub fn capacity(&self, level: SchemeDiversity) -> NonZeroUsize {
        let n = match level {
            SchemeDiversity::Low => self.low,
            SchemeDiversity::Medium => self.medium,
            SchemeDiversity::High => self.high,
        };
        NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
    }

    pub(crate) fn new_cache<K: Hash + Eq, V>(&self, level: SchemeDiversity) -> Mutex<LruCache<K, V>> {
        Mutex::new(LruCache::new(self.capacity(level)))
    }
}
