//! Chunk 句柄
//!
//! @yutiansut @quantaxis
//!
//! Handle 是逻辑引用：克隆 +1，析构 -1。
//! - 0→1：chunk 从 GC 候选池移出
//! - 1→0 且为瞬态 chunk：刷新访问时间后进入候选池
//!
//! 槽位表和 GC 队列持有的是裸 Arc，不计入逻辑引用

use std::ops::Deref;
use std::sync::Arc;

use super::{Chunk, ChunkBase, ChunkId};

/// chunk 的计数引用
pub struct Handle<C: ?Sized + ChunkBase> {
    chunk: Arc<C>,
}

/// 类型化句柄
pub type ChunkHandle<T> = Handle<Chunk<T>>;

/// 类型擦除句柄 (依赖列表使用)
pub type AnyChunkHandle = Handle<dyn ChunkBase>;

impl<C: ?Sized + ChunkBase> Handle<C> {
    /// 取得一个新的逻辑引用
    pub(crate) fn acquire(chunk: Arc<C>) -> Self {
        if chunk.core().inc_refs() {
            chunk.core().engine().gc.dequeue(chunk.as_dyn());
        }
        Self { chunk }
    }

    #[inline]
    pub fn id(&self) -> ChunkId {
        self.chunk.core().id()
    }

    /// 当前逻辑引用数
    #[inline]
    pub fn refs(&self) -> usize {
        self.chunk.core().refs()
    }

    /// 通知 chunk 有新的上游数据
    pub fn notify(&self) {
        self.chunk.clone().into_dyn().notify();
    }

    /// 底层 Arc
    pub fn arc(&self) -> &Arc<C> {
        &self.chunk
    }
}

impl<C: ChunkBase> Handle<C> {
    /// 转换为类型擦除句柄
    pub fn erase(self) -> AnyChunkHandle {
        // 先取得新引用再释放旧引用，计数不会经过 0
        Handle::acquire(self.chunk.clone().into_dyn())
    }
}

impl<C: ?Sized + ChunkBase> Clone for Handle<C> {
    fn clone(&self) -> Self {
        Self::acquire(self.chunk.clone())
    }
}

impl<C: ?Sized + ChunkBase> Drop for Handle<C> {
    fn drop(&mut self) {
        let core = self.chunk.core();
        if core.dec_refs() && core.is_transient() {
            core.touch();
            core.engine().gc.enqueue(self.chunk.clone().into_dyn());
        }
    }
}

impl<C: ?Sized + ChunkBase> Deref for Handle<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.chunk
    }
}

impl<C: ?Sized + ChunkBase> std::fmt::Debug for Handle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id())
            .field("refs", &self.refs())
            .field("computed", &self.chunk.computed())
            .finish()
    }
}
