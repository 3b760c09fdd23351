//! Chunk 元素缓冲区
//!
//! @yutiansut @quantaxis
//!
//! 固定容量的元素存储，分为两段：
//! - 已发布前缀 `[0, computed)`：不可变，任意线程可无锁读取
//! - 未填充尾部 `[computed, CHUNK_SIZE)`：只有持有计算锁的 exec 可写
//!
//! 计算闭包通过 `ChunkWriter` 追加元素，无法改写已发布的前缀；
//! 不再需要的上游依赖也通过 writer 提交释放

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ChunkId, Element, CHUNK_SIZE};

// ═══════════════════════════════════════════════════════════════════════════
// 已计算元素数
// ═══════════════════════════════════════════════════════════════════════════

/// 单调递增的已计算元素数 (0..=CHUNK_SIZE)
///
/// 只能通过 `publish` 增长；读取使用 Acquire，与写入端的 Release 配对，
/// 观察到计数 n 的线程同时能看到 `[0, n)` 的元素
#[derive(Debug, Default)]
pub struct ComputedCount(AtomicUsize);

impl ComputedCount {
    pub fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// 当前已发布的元素数
    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// 是否已填满
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.get() == CHUNK_SIZE
    }

    /// 发布新的计数，返回是否前进
    ///
    /// 较小的值会被忽略 (fetch_max)，计数永不回退
    pub(crate) fn publish(&self, count: usize) -> bool {
        assert!(
            count <= CHUNK_SIZE,
            "computed count {} exceeds chunk size {}",
            count,
            CHUNK_SIZE
        );
        self.0.fetch_max(count, Ordering::AcqRel) < count
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 元素存储
// ═══════════════════════════════════════════════════════════════════════════

/// 元素存储 (内部可变)
pub(crate) struct ChunkBuffer<T> {
    cells: Box<[UnsafeCell<T>]>,
}

// SAFETY: 写入只发生在 `[computed, CHUNK_SIZE)`，由 chunk 的计算锁串行化；
// 读取只覆盖 `[0, computed)`，两段互不重叠。
unsafe impl<T: Send + Sync> Sync for ChunkBuffer<T> {}

impl<T: Element> ChunkBuffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            cells: (0..CHUNK_SIZE).map(|_| UnsafeCell::new(T::default())).collect(),
        }
    }

    /// 已发布前缀的只读视图
    ///
    /// # Safety
    /// `len` 不得超过已发布的 computed count
    #[inline]
    pub(crate) unsafe fn prefix(&self, len: usize) -> &[T] {
        debug_assert!(len <= CHUNK_SIZE);
        std::slice::from_raw_parts(UnsafeCell::raw_get(self.cells.as_ptr()), len)
    }

    /// 拆分为只读前缀和可写尾部
    ///
    /// # Safety
    /// 调用方必须持有 chunk 的计算锁 (同一时刻只有一个写者)，
    /// 且 `start` 等于当前已发布的 computed count
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn split_at(&self, start: usize) -> (&[T], &mut [T]) {
        debug_assert!(start <= CHUNK_SIZE);
        let base = UnsafeCell::raw_get(self.cells.as_ptr());
        (
            std::slice::from_raw_parts(base, start),
            std::slice::from_raw_parts_mut(base.add(start), CHUNK_SIZE - start),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 追加写入器
// ═══════════════════════════════════════════════════════════════════════════

/// 计算闭包使用的追加写入器
///
/// `published()` 是上次 exec 结束时已发布的元素；本次只能在其后追加。
/// exec 返回后，`len()` 即为新的 computed count
pub struct ChunkWriter<'a, T> {
    published: &'a [T],
    tail: &'a mut [T],
    written: usize,
    /// 本次 exec 提交释放的上游 chunk
    released: Vec<ChunkId>,
}

impl<'a, T: Element> ChunkWriter<'a, T> {
    pub(crate) fn new(published: &'a [T], tail: &'a mut [T]) -> Self {
        Self {
            published,
            tail,
            written: 0,
            released: Vec::new(),
        }
    }

    /// 已发布 (不可变) 的元素
    pub fn published(&self) -> &[T] {
        self.published
    }

    /// 本次 exec 已写入的元素
    pub fn written(&self) -> &[T] {
        &self.tail[..self.written]
    }

    /// chunk 内的总元素数 (已发布 + 本次写入)
    #[inline]
    pub fn len(&self) -> usize {
        self.published.len() + self.written
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 剩余可写容量
    #[inline]
    pub fn remaining(&self) -> usize {
        self.tail.len() - self.written
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// 追加一个元素，已满返回 false
    #[inline]
    pub fn push(&mut self, value: T) -> bool {
        if self.written == self.tail.len() {
            return false;
        }
        self.tail[self.written] = value;
        self.written += 1;
        true
    }

    /// 批量追加，返回实际写入数
    pub fn extend_from_slice(&mut self, values: &[T]) -> usize {
        let n = values.len().min(self.remaining());
        self.tail[self.written..self.written + n].copy_from_slice(&values[..n]);
        self.written += n;
        n
    }

    /// chunk 内位置 `i` 的元素 (已发布或本次写入)
    pub fn get(&self, i: usize) -> Option<T> {
        if i < self.published.len() {
            Some(self.published[i])
        } else {
            self.written().get(i - self.published.len()).copied()
        }
    }

    /// 最后一个元素
    pub fn last(&self) -> Option<T> {
        match self.len() {
            0 => None,
            n => self.get(n - 1),
        }
    }

    /// 释放构造时记录的上游依赖 `id`
    ///
    /// exec 返回后生效：依赖边被拆除，上游句柄归还。
    /// 之后该上游的数据前进不再通知本 chunk
    pub fn release_dependency(&mut self, id: ChunkId) {
        if !self.released.contains(&id) {
            self.released.push(id);
        }
    }

    pub(crate) fn take_released(&mut self) -> Vec<ChunkId> {
        std::mem::take(&mut self.released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_computed_count_monotonic() {
        let count = ComputedCount::new();
        assert_eq!(count.get(), 0);

        assert!(count.publish(10));
        assert_eq!(count.get(), 10);

        // 回退被忽略
        assert!(!count.publish(5));
        assert_eq!(count.get(), 10);

        // 相同值不算前进
        assert!(!count.publish(10));

        assert!(count.publish(CHUNK_SIZE));
        assert!(count.is_complete());
    }

    #[test]
    #[should_panic]
    fn test_computed_count_overflow() {
        let count = ComputedCount::new();
        count.publish(CHUNK_SIZE + 1);
    }

    #[test]
    fn test_writer_append_only() {
        let buffer = ChunkBuffer::<f64>::new();

        // 第一轮：写入 3 个
        let (published, tail) = unsafe { buffer.split_at(0) };
        let mut writer = ChunkWriter::new(published, tail);
        assert!(writer.is_empty());
        assert!(writer.push(1.0));
        assert_eq!(writer.extend_from_slice(&[2.0, 3.0]), 2);
        assert_eq!(writer.len(), 3);
        assert_eq!(writer.last(), Some(3.0));

        // 第二轮：从 3 开始，前缀只读
        let (published, tail) = unsafe { buffer.split_at(3) };
        let mut writer = ChunkWriter::new(published, tail);
        assert_eq!(writer.published(), &[1.0, 2.0, 3.0]);
        assert_eq!(writer.last(), Some(3.0));
        assert!(writer.push(4.0));
        assert_eq!(writer.get(0), Some(1.0));
        assert_eq!(writer.get(3), Some(4.0));
        assert_eq!(writer.get(4), None);
        assert_eq!(writer.remaining(), CHUNK_SIZE - 4);

        assert_eq!(unsafe { buffer.prefix(4) }, &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_writer_full() {
        let buffer = ChunkBuffer::<u32>::new();
        let (published, tail) = unsafe { buffer.split_at(CHUNK_SIZE - 1) };
        let mut writer = ChunkWriter::new(published, tail);

        assert_eq!(writer.extend_from_slice(&[7, 8, 9]), 1);
        assert!(writer.is_full());
        assert!(!writer.push(10));
        assert_eq!(writer.len(), CHUNK_SIZE);
    }

    #[test]
    fn test_writer_release_dedup() {
        let buffer = ChunkBuffer::<f64>::new();
        let (published, tail) = unsafe { buffer.split_at(0) };
        let mut writer = ChunkWriter::new(published, tail);

        writer.release_dependency(7);
        writer.release_dependency(3);
        writer.release_dependency(7);
        assert_eq!(writer.take_released(), vec![7, 3]);
        assert!(writer.take_released().is_empty());
    }
}
