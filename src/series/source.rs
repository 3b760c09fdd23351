//! 数据源序列
//!
//! @yutiansut @quantaxis
//!
//! 只追加的输入流。追加发生在图变更线程，覆盖追加区间的已驻留 chunk 会收到 notify，
//! 随数据到达逐步填满

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{DataSeries, SeriesOptions};
use crate::chunk::{computer, ChunkWriter, Element, CHUNK_SIZE};
use crate::runtime::Engine;

/// 只追加的数据源
pub struct SourceSeries<T: Element> {
    series: Arc<DataSeries<T>>,
    store: Arc<RwLock<Vec<T>>>,
}

impl<T: Element> SourceSeries<T> {
    pub(crate) fn new(engine: &Engine, name: &str, options: SeriesOptions) -> Self {
        let store: Arc<RwLock<Vec<T>>> = Arc::new(RwLock::new(Vec::new()));
        let shared = store.clone();
        let series = engine.series_with(name, options, move |_, index, _| {
            let store = shared.clone();
            let base = index * CHUNK_SIZE;
            computer(move |w: &mut ChunkWriter<'_, T>| {
                let data = store.read();
                let from = base + w.len();
                let to = data.len().min(base + CHUNK_SIZE);
                if from < to {
                    w.extend_from_slice(&data[from..to]);
                }
            })
        });
        Self { series, store }
    }

    /// 底层序列
    pub fn series(&self) -> &Arc<DataSeries<T>> {
        &self.series
    }

    /// 已追加的元素数
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 追加一个元素
    pub fn push(&self, value: T) {
        let index = {
            let mut store = self.store.write();
            store.push(value);
            store.len() - 1
        };
        self.series.notify_resident(index / CHUNK_SIZE);
    }

    /// 批量追加
    pub fn extend(&self, values: &[T]) {
        if values.is_empty() {
            return;
        }
        let (start, end) = {
            let mut store = self.store.write();
            let start = store.len();
            store.extend_from_slice(values);
            (start, store.len())
        };
        for chunk_index in start / CHUNK_SIZE..=(end - 1) / CHUNK_SIZE {
            self.series.notify_resident(chunk_index);
        }
        log::trace!(
            "Source '{}' appended {} values ({} total)",
            self.series.name(),
            values.len(),
            end
        );
    }
}

impl<T: Element> Deref for SourceSeries<T> {
    type Target = Arc<DataSeries<T>>;

    fn deref(&self) -> &Arc<DataSeries<T>> {
        &self.series
    }
}
