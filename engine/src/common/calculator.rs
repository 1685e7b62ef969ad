use std::{
    collections::{BTreeSet, HashMap},
    ops::Range,
};

/// 地址空间的最佳适配空闲表。
///
/// 只记录地址区间，不持有存储；相邻的空闲区间在归还时合并。
#[derive(Debug)]
pub(crate) struct OffsetCalculator {
    alignment: usize,
    /// 按 (长度, 起点) 排序，用于最佳适配查找。
    by_len: BTreeSet<(usize, usize)>,
    /// 起点 -> 长度。
    heads: HashMap<usize, usize>,
    /// 终点 -> 长度。
    tails: HashMap<usize, usize>,
}

impl OffsetCalculator {
    pub fn new(alignment: usize) -> Self {
        assert!(alignment.is_power_of_two());
        Self {
            alignment,
            by_len: BTreeSet::new(),
            heads: HashMap::new(),
            tails: HashMap::new(),
        }
    }

    #[inline]
    fn round(&self, len: usize) -> usize {
        len.div_ceil(self.alignment) * self.alignment
    }

    /// 归还区间，与前后相邻的空闲区间合并。
    pub fn put(&mut self, range: Range<usize>) {
        let len = self.round(range.len());
        if len == 0 {
            return;
        }

        let mut start = range.start;
        let mut end = start + len;
        if let Some(prev) = self.tails.get(&start).copied() {
            self.remove_area(start - prev, prev);
            start -= prev;
        }
        if let Some(next) = self.heads.get(&end).copied() {
            self.remove_area(end, next);
            end += next;
        }
        self.insert_area(start, end - start)
    }

    /// 取出不小于 `size` 的最小空闲区间的头部。
    pub fn take(&mut self, size: usize) -> Option<Range<usize>> {
        let len = self.round(size);
        if len == 0 {
            return None;
        }

        let &(free, start) = self.by_len.range((len, 0)..).next()?;
        self.remove_area(start, free);
        if free > len {
            self.insert_area(start + len, free - len)
        }
        Some(start..start + size)
    }

    /// 空闲字节总数。
    pub fn free_bytes(&self) -> usize {
        self.by_len.iter().map(|&(len, _)| len).sum()
    }

    fn insert_area(&mut self, start: usize, len: usize) {
        self.by_len.insert((len, start));
        self.heads.insert(start, len);
        self.tails.insert(start + len, len);
    }

    fn remove_area(&mut self, start: usize, len: usize) {
        assert!(self.by_len.remove(&(len, start)));
        assert_eq!(self.heads.remove(&start), Some(len));
        assert_eq!(self.tails.remove(&(start + len)), Some(len));
    }
}
