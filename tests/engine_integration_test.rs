// 分块惰性求值引擎端到端集成测试
//
// 测试流程：
// 1. 驱逐后重新请求：上游 chunk 透明重建，旧依赖边已拆除
// 2. 三个并发 notify 合并为一次额外 exec
// 3. 句柄数与 refs 一致
// 4. 常驻序列不进入回收池，全部被引用时报告容量超限
// 5. 线程池执行下 computed count 单调、已发布元素稳定
// 6. 前缀和：远处下标自底向上构造，只持有最新 chunk 时历史可被回收

use chunkflow::chunk::computer;
use chunkflow::series::nodes;
use chunkflow::{
    ChunkBase, ChunkWriter, Engine, EngineConfig, EngineError, ExecMode, SeriesOptions, UnaryOp,
    CHUNK_SIZE,
};
use crossbeam::channel;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn inline_engine() -> Engine {
    Engine::new(EngineConfig {
        worker_threads: 0,
        ..EngineConfig::default()
    })
}

fn pooled_engine(workers: usize) -> Engine {
    Engine::new(EngineConfig {
        worker_threads: workers,
        ..EngineConfig::default()
    })
}

#[test]
fn test_evicted_upstream_is_rebuilt_with_clean_edges() {
    let engine = inline_engine();
    let a = engine.series("A", |_, index, _| {
        computer(move |w: &mut ChunkWriter<'_, f64>| {
            while !w.is_full() {
                w.push((index * CHUNK_SIZE + w.len()) as f64);
            }
        })
    });
    let b = nodes::map(&engine, &a, UnaryOp::Scale(1.0));

    let hb = b.get_chunk(0);
    let old_b = hb.id();
    let old_a = hb.dependency_ids()[0];
    assert_eq!(a.resident(0).map(|c| c.core().id()), Some(old_a));
    drop(hb);

    // 只驱逐 B：A 仍被 B 引用，不在候选池中
    engine.collector().assert_sequence(&[old_b]);
    engine
        .collector()
        .set_limit(engine.memory_usage() as u64 - 1);
    let report = engine.tick().unwrap();
    assert_eq!(report.evicted, 1);
    assert!(!b.is_resident(0));

    // B 销毁时已从 A 的依赖者列表中移除，A 随之进入候选池
    let old_a_chunk = a.resident(0).unwrap();
    assert_eq!(old_a_chunk.core().dependent_count(), 0);
    assert_eq!(old_a_chunk.core().refs(), 0);
    engine.collector().assert_sequence(&[old_a]);
    drop(old_a_chunk);

    engine.collector().set_limit(0);
    let report = engine.tick().unwrap();
    assert_eq!(report.evicted, 1);
    assert_eq!(engine.memory_usage(), 0);
    assert_eq!(a.resident_count(), 0);

    // 重新请求 B：A 先被重建
    engine.collector().set_limit(u64::MAX);
    let hb = b.get_chunk(0);
    let new_a = a.resident(0).unwrap();
    assert_ne!(new_a.core().id(), old_a);
    assert_eq!(hb.dependency_ids(), vec![new_a.core().id()]);
    assert_eq!(new_a.core().dependent_ids(), vec![hb.id()]);
    assert!(hb.is_complete());
    assert_eq!(hb.get(17), Some(17.0));

    let metrics = engine.metrics();
    assert_eq!(metrics.chunks_built, 4);
    assert_eq!(metrics.chunks_evicted, 2);
}

#[test]
fn test_concurrent_notifies_coalesce_into_one_run() {
    let engine = inline_engine();
    let runs = Arc::new(AtomicUsize::new(0));
    let (started_tx, started_rx) = channel::bounded::<()>(1);
    let (release_tx, release_rx) = channel::bounded::<()>(1);

    let r = runs.clone();
    let options = SeriesOptions {
        exec_mode: ExecMode::Inline,
        ..SeriesOptions::default()
    };
    let series = engine.series_with("blocking", options, move |_, _, _| {
        let runs = r.clone();
        let started = started_tx.clone();
        let release = release_rx.clone();
        computer(move |w: &mut ChunkWriter<'_, u64>| {
            let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
            if run == 2 {
                started.send(()).unwrap();
                release.recv().unwrap();
            }
            w.push(run as u64);
        })
    });

    // 构造时的首次执行
    let handle = series.get_chunk(0);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // 第二次执行在 T0 上阻塞
    let h = handle.clone();
    let in_flight = thread::spawn(move || h.notify());
    started_rx.recv().unwrap();

    // 执行期间的三个并发通知
    let notifiers: Vec<_> = (0..3)
        .map(|_| {
            let h = handle.clone();
            thread::spawn(move || h.notify())
        })
        .collect();
    for t in notifiers {
        t.join().unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    release_tx.send(()).unwrap();
    in_flight.join().unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(handle.data(), &[1u64, 2, 3]);
    assert_eq!(engine.metrics().coalesced_notifies, 3);
}

#[test]
fn test_refs_track_live_handles() {
    let engine = inline_engine();
    let source = engine.source::<f64>("src");
    source.extend(&[1.0, 2.0, 3.0]);

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push(source.get_chunk(0));
        assert_eq!(handles[0].refs(), i + 1);
    }
    let cloned: Vec<_> = handles.iter().map(|h| h.clone()).collect();
    assert_eq!(handles[0].refs(), 10);

    let id = handles[0].id();
    drop(cloned);
    assert_eq!(handles[0].refs(), 5);
    assert!(engine.collector().is_empty());

    handles.truncate(1);
    assert_eq!(handles[0].refs(), 1);
    handles.clear();

    engine.collector().assert_sequence(&[id]);
    let chunk = source.resident(0).unwrap();
    assert_eq!(chunk.core().refs(), 0);
}

#[test]
fn test_permanent_series_survives_zero_budget() {
    let engine = inline_engine();
    let options = SeriesOptions {
        transient: false,
        ..SeriesOptions::default()
    };
    let pinned = engine.series_with("pinned", options, |_, _, _| {
        computer(|w: &mut ChunkWriter<'_, f64>| while w.push(3.0) {})
    });
    for i in 0..4 {
        drop(pinned.get_chunk(i));
    }
    assert!(engine.collector().is_empty());

    engine.collector().set_limit(0);
    match engine.tick() {
        Err(EngineError::CapacityExceeded { usage, limit }) => {
            assert!(usage > 0);
            assert_eq!(limit, 0);
        }
        other => panic!("expected CapacityExceeded, got {:?}", other),
    }
    assert_eq!(pinned.resident_count(), 4);
}

#[test]
fn test_capacity_exceeded_when_everything_referenced() {
    let engine = inline_engine();
    let ones = nodes::constant(&engine, 1.0);
    let held = ones.get_chunk(0);
    let released = ones.get_chunk(1);
    drop(released);

    engine.collector().set_limit(0);
    let err = engine.tick().unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { .. }));

    // 可驱逐的已被驱逐，被引用的仍在
    assert!(ones.is_resident(0));
    assert!(!ones.is_resident(1));
    assert!(held.is_complete());
    assert_eq!(engine.metrics().chunks_evicted, 1);
}

#[test]
fn test_rebuilt_source_chunk_has_same_data() {
    let engine = inline_engine();
    let source = engine.source::<f64>("prices");
    let values: Vec<f64> = (0..CHUNK_SIZE + 100).map(|i| (i as f64).sin()).collect();
    source.extend(&values);

    let before: Vec<f64> = source.get_chunk(1).data().to_vec();
    engine.collector().set_limit(0);
    engine.tick().unwrap();
    assert_eq!(source.resident_count(), 0);

    let after = source.get_chunk(1);
    assert_eq!(after.data(), before.as_slice());
    assert_eq!(after.computed(), 100);
}

#[test]
fn test_offloaded_counts_monotonic_and_stable() {
    let engine = pooled_engine(2);
    let source = engine.source::<f64>("ramp");
    let options = SeriesOptions {
        exec_mode: ExecMode::Offload,
        ..SeriesOptions::default()
    };
    let src = source.series().clone();
    let doubled = engine.series_with("doubled", options, move |_, index, ctx| {
        let input = ctx.chunk(&src, index);
        computer(move |w: &mut ChunkWriter<'_, f64>| {
            let from = w.len();
            for &x in &input.data()[from..] {
                w.push(x * 2.0);
            }
        })
    });

    let handle = doubled.get_chunk(0);
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let h = handle.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut last = 0;
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    let data = h.data();
                    assert!(data.len() >= last, "computed count went backwards");
                    for (i, &x) in data.iter().enumerate() {
                        assert_eq!(x, (i * 2) as f64);
                    }
                    last = data.len();
                    if finished {
                        return last;
                    }
                    thread::yield_now();
                }
            })
        })
        .collect();

    for batch in (0..CHUNK_SIZE).collect::<Vec<_>>().chunks(64) {
        let values: Vec<f64> = batch.iter().map(|&i| i as f64).collect();
        source.extend(&values);
    }
    engine.wait_idle();
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        assert_eq!(reader.join().unwrap(), CHUNK_SIZE);
    }
    assert!(handle.is_complete());
    assert!(engine.metrics().offloaded_runs > 0);
}

#[test]
fn test_auto_mode_offloads_expensive_series() {
    let engine = pooled_engine(2);
    let source = engine.source::<f64>("input");
    let src = source.series().clone();
    let slow = engine.series("slow", move |_, index, ctx| {
        let input = ctx.chunk(&src, index);
        computer(move |w: &mut ChunkWriter<'_, f64>| {
            thread::sleep(Duration::from_micros(500));
            let from = w.len();
            for &x in &input.data()[from..] {
                w.push(x + 1.0);
            }
        })
    });

    let handle = slow.get_chunk(0);
    // 首次执行内联，之后平均耗时超过阈值
    assert!(slow.stats().average() > engine.shared().inline_threshold());
    let inline_before = engine.metrics().inline_runs;

    for i in 0..8 {
        source.push(i as f64);
        engine.wait_idle();
    }

    let metrics = engine.metrics();
    assert!(metrics.offloaded_runs >= 8);
    assert_eq!(handle.computed(), 8);
    assert_eq!(handle.get(7), Some(8.0));
    assert!(metrics.inline_runs >= inline_before);
}

#[test]
fn test_engine_shutdown_releases_collected_chunks() {
    // 阈值足够大，全部内联执行
    let engine = Engine::new(EngineConfig {
        worker_threads: 1,
        inline_threshold_us: 1_000_000,
        ..EngineConfig::default()
    });
    let ones = nodes::constant(&engine, 1.0);
    let total = nodes::cumsum(&engine, &ones);
    assert_eq!(total.get(2 * CHUNK_SIZE), Some((2 * CHUNK_SIZE + 1) as f64));
    engine.wait_idle();

    total.clear();
    ones.clear();
    assert!(engine.memory_usage() > 0);

    engine.shutdown();
    assert_eq!(engine.memory_usage(), 0);
    assert!(engine.collector().is_empty());
}

#[test]
fn test_cumsum_far_index_on_default_stack() {
    let engine = inline_engine();
    let ones = nodes::constant(&engine, 1.0);
    let total = nodes::cumsum(&engine, &ones);

    let far = 10_000 * CHUNK_SIZE;
    assert_eq!(total.get(far), Some((far + 1) as f64));
    assert_eq!(total.resident_count(), 10_001);
}

#[test]
fn test_cumsum_history_is_evictable() {
    let engine = inline_engine();
    let ones = nodes::constant(&engine, 1.0);
    let total = nodes::cumsum(&engine, &ones);

    let newest = total.get_chunk(200);
    assert_eq!(newest.dependency_count(), 1);
    assert_eq!(newest.get(0), Some((200 * CHUNK_SIZE + 1) as f64));

    let per_chunk = newest.footprint() as u64;
    engine.collector().set_limit(20 * per_chunk);
    let report = engine.tick().unwrap();
    assert!(report.evicted > 0);
    assert!(engine.memory_usage() as u64 <= 20 * per_chunk);
    assert!(total.resident_count() < 201);
    assert!(ones.resident_count() < 201);

    // 持有的 chunk 及其输入保留
    assert!(total.is_resident(200));
    assert!(ones.is_resident(200));
    assert!(newest.is_complete());

    // 被回收的历史按需重建，结果不变
    engine.collector().set_limit(u64::MAX);
    assert_eq!(total.get(3), Some(4.0));
    assert_eq!(
        total.get(150 * CHUNK_SIZE + 9),
        Some((150 * CHUNK_SIZE + 10) as f64)
    );
}
