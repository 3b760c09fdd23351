//! 派生序列算子
//!
//! @yutiansut @quantaxis
//!
//! 所有算子都是 f64 序列上的增量计算，NaN 作为缺失值标记按 IEEE 规则传播：
//! - constant: 常数序列
//! - map: 逐点一元运算
//! - binary: 逐点二元运算，长度取两侧已计算部分的较小者
//! - cumsum: 前缀和，第 i 个 chunk 依赖本序列第 i-1 个 chunk 的末值
//! - delay: 整体后移 k 个元素，前 k 个为 NaN
//! - rolling_mean: 滑动均值，窗口未满时为 NaN

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::DataSeries;
use crate::chunk::{computer, ChunkHandle, ChunkWriter, CHUNK_SIZE};
use crate::runtime::Engine;
use crate::{EngineError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// 运算
// ═══════════════════════════════════════════════════════════════════════════

/// 一元运算
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Scale(f64),
    Offset(f64),
}

impl UnaryOp {
    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Scale(k) => x * k,
            UnaryOp::Offset(k) => x + k,
        }
    }
}

/// 二元运算
///
/// 比较运算输出 1.0 / 0.0；任一侧为 NaN 时所有运算都输出 NaN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Greater,
    Less,
}

impl BinaryOp {
    #[inline]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            _ if a.is_nan() || b.is_nan() => f64::NAN,
            BinaryOp::Min => a.min(b),
            BinaryOp::Max => a.max(b),
            BinaryOp::Greater => bool_value(a > b),
            BinaryOp::Less => bool_value(a < b),
        }
    }
}

#[inline]
fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 滑动窗口
// ═══════════════════════════════════════════════════════════════════════════

/// 带和与 NaN 计数的滑动窗口
#[derive(Debug, Clone)]
struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
    /// 窗口内非 NaN 值的和
    sum: f64,
    nan_count: usize,
}

impl RollingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
            nan_count: 0,
        }
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            if let Some(expired) = self.values.pop_front() {
                if expired.is_nan() {
                    self.nan_count -= 1;
                } else {
                    self.sum -= expired;
                }
            }
        }
        if value.is_nan() {
            self.nan_count += 1;
        } else {
            self.sum += value;
        }
        self.values.push_back(value);
    }

    fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    /// 窗口已满且无 NaN 时的均值，否则 NaN
    fn mean(&self) -> f64 {
        if !self.is_full() || self.nan_count > 0 {
            f64::NAN
        } else {
            self.sum / self.capacity as f64
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 算子
// ═══════════════════════════════════════════════════════════════════════════

/// 常数序列
pub fn constant(engine: &Engine, value: f64) -> Arc<DataSeries<f64>> {
    engine.series(&format!("const({})", value), move |_, _, _| {
        computer(move |w: &mut ChunkWriter<'_, f64>| while w.push(value) {})
    })
}

/// 逐点一元运算
pub fn map(engine: &Engine, input: &Arc<DataSeries<f64>>, op: UnaryOp) -> Arc<DataSeries<f64>> {
    let input = input.clone();
    let name = format!("{:?}({})", op, input.name());
    engine.series(&name, move |_, index, ctx| {
        let src = ctx.chunk(&input, index);
        computer(move |w: &mut ChunkWriter<'_, f64>| {
            let from = w.len();
            for &x in &src.data()[from..] {
                w.push(op.apply(x));
            }
        })
    })
}

/// 逐点二元运算
pub fn binary(
    engine: &Engine,
    lhs: &Arc<DataSeries<f64>>,
    rhs: &Arc<DataSeries<f64>>,
    op: BinaryOp,
) -> Arc<DataSeries<f64>> {
    let lhs = lhs.clone();
    let rhs = rhs.clone();
    let name = format!("{:?}({}, {})", op, lhs.name(), rhs.name());
    engine.series(&name, move |_, index, ctx| {
        let a = ctx.chunk(&lhs, index);
        let b = ctx.chunk(&rhs, index);
        computer(move |w: &mut ChunkWriter<'_, f64>| {
            let (xs, ys) = (a.data(), b.data());
            let from = w.len();
            let to = xs.len().min(ys.len());
            for i in from..to {
                w.push(op.apply(xs[i], ys[i]));
            }
        })
    })
}

/// 前缀和
///
/// 第 i 个 chunk 在第 i-1 个 chunk 填满之前不产生任何输出。
/// 取得第 i-1 个 chunk 的末值后即释放对它的依赖，历史 chunk 可以被回收
pub fn cumsum(engine: &Engine, input: &Arc<DataSeries<f64>>) -> Arc<DataSeries<f64>> {
    let input = input.clone();
    let name = format!("cumsum({})", input.name());
    engine.series(&name, move |series, index, ctx| {
        let src = ctx.chunk(&input, index);
        let mut prev = match index {
            0 => None,
            i => {
                // 缺失的前驱自底向上构造，避免逐级递归
                let _previous = series.build_through(i - 1);
                Some(ctx.chunk(series, i - 1))
            }
        };
        let mut carry = if prev.is_none() { Some(0.0) } else { None };

        computer(move |w: &mut ChunkWriter<'_, f64>| {
            if carry.is_none() {
                match prev.take() {
                    Some(p) if p.is_complete() => {
                        carry = p.get(CHUNK_SIZE - 1);
                        w.release_dependency(p.id());
                    }
                    pending => {
                        prev = pending;
                        return;
                    }
                }
            }
            let carry = match carry {
                Some(carry) => carry,
                None => return,
            };

            let mut acc = w.last().unwrap_or(carry);
            let from = w.len();
            for &x in &src.data()[from..] {
                acc += x;
                w.push(acc);
            }
        })
    })
}

/// 整体后移 `by` 个元素
pub fn delay(
    engine: &Engine,
    input: &Arc<DataSeries<f64>>,
    by: usize,
) -> Result<Arc<DataSeries<f64>>> {
    if by == 0 {
        return Err(EngineError::InvalidParameter(
            "delay must be positive".to_string(),
        ));
    }

    let input = input.clone();
    let name = format!("delay({}, {})", input.name(), by);
    Ok(engine.series(&name, move |_, index, ctx| {
        let base = index * CHUNK_SIZE;
        let end = base + CHUNK_SIZE;

        // 输出 [base, end) 对应输入 [base - by, end - by)
        let sources: Vec<(usize, ChunkHandle<f64>)> = if end <= by {
            Vec::new()
        } else {
            let lo = base.saturating_sub(by) / CHUNK_SIZE;
            let hi = (end - 1 - by) / CHUNK_SIZE;
            (lo..=hi).map(|i| (i, ctx.chunk(&input, i))).collect()
        };

        computer(move |w: &mut ChunkWriter<'_, f64>| {
            while !w.is_full() {
                let global = base + w.len();
                if global < by {
                    w.push(f64::NAN);
                    continue;
                }
                let src_index = global - by;
                let (chunk_index, offset) = (src_index / CHUNK_SIZE, src_index % CHUNK_SIZE);
                let value = sources
                    .iter()
                    .find(|(i, _)| *i == chunk_index)
                    .and_then(|(_, chunk)| chunk.get(offset));
                match value {
                    Some(x) => {
                        w.push(x);
                    }
                    None => break,
                }
            }
        })
    }))
}

/// 滑动均值
///
/// 前 `window - 1` 个输出为 NaN；窗口内含 NaN 时输出 NaN
pub fn rolling_mean(
    engine: &Engine,
    input: &Arc<DataSeries<f64>>,
    window: usize,
) -> Result<Arc<DataSeries<f64>>> {
    if window == 0 || window > CHUNK_SIZE {
        return Err(EngineError::InvalidParameter(format!(
            "rolling window must be in 1..={}, got {}",
            CHUNK_SIZE, window
        )));
    }

    let input = input.clone();
    let name = format!("rolling_mean({}, {})", input.name(), window);
    Ok(engine.series(&name, move |_, index, ctx| {
        let src = ctx.chunk(&input, index);
        let prev = if index > 0 && window > 1 {
            Some(ctx.chunk(&input, index - 1))
        } else {
            None
        };

        let mut prev = prev;
        let mut state = RollingWindow::new(window);
        let mut primed = prev.is_none();
        computer(move |w: &mut ChunkWriter<'_, f64>| {
            if !primed {
                match prev.take() {
                    Some(p) if p.is_complete() => {
                        for &x in &p.data()[CHUNK_SIZE - (window - 1)..] {
                            state.push(x);
                        }
                        primed = true;
                        // 窗口已预热，不再需要上一个输入 chunk
                        w.release_dependency(p.id());
                    }
                    pending => {
                        prev = pending;
                        return;
                    }
                }
            }

            let from = w.len();
            for &x in &src.data()[from..] {
                state.push(x);
                w.push(state.mean());
            }
        })
    }))
}
