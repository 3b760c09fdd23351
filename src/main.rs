//! chunkflow 演示程序
//!
//! 模拟一个外层节拍循环：
//! 1. 数据源每拍追加一批随机游走价格
//! 2. 派生序列：滑动均值、偏离度、绝对偏离、延迟序列
//! 3. 消费者每拍读取最新 chunk
//! 4. 每拍结束执行一次 GC
//!
//! 运行: cargo run --bin chunkflow-demo

use anyhow::Context;
use chunkflow::series::nodes;
use chunkflow::{BinaryOp, ChunkBase, Engine, EngineConfig, UnaryOp, CHUNK_SIZE};
use rand::Rng;

/// 节拍数
const TICKS: usize = 64;

/// 每拍追加的样本数
const BATCH: usize = 256;

fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 1. 加载配置文件
    let mut config = match EngineConfig::load_default() {
        Ok(cfg) => {
            log::info!("Engine config loaded from config/engine.toml");
            cfg
        }
        Err(e) => {
            log::warn!("Failed to load config file: {}, using defaults", e);
            EngineConfig::default()
        }
    };
    // 演示用的小预算，让 GC 真正发生驱逐
    config.gc_memory_limit = config.gc_memory_limit.min(256 * 1024);

    let engine = Engine::new(config);

    // 2. 构造数据流图
    let prices = engine.source::<f64>("price");
    let mean = nodes::rolling_mean(&engine, &prices, 32).context("rolling mean")?;
    let spread = nodes::binary(&engine, &prices, &mean, BinaryOp::Sub);
    let distance = nodes::map(&engine, &spread, UnaryOp::Abs);
    let lagged = nodes::delay(&engine, &distance, 16).context("delay")?;

    // 3. 节拍循环
    let mut rng = rand::thread_rng();
    let mut last = 100.0_f64;
    for tick in 0..TICKS {
        let batch: Vec<f64> = (0..BATCH)
            .map(|_| {
                last += rng.gen_range(-0.5..0.5);
                last
            })
            .collect();
        prices.extend(&batch);

        let latest = prices.len() - 1;
        let chunk = lagged.get_chunk(latest / CHUNK_SIZE);
        engine.wait_idle();

        if tick % 8 == 0 {
            log::info!(
                "tick {}: price={:.3} lagged distance={:?} ({} of chunk computed)",
                tick,
                last,
                chunk.get(chunk.computed().saturating_sub(1)),
                chunk.computed()
            );
        }
        drop(chunk);

        match engine.tick() {
            Ok(report) if report.evicted > 0 => {
                log::info!(
                    "tick {}: evicted {} chunks, usage {} / {} bytes",
                    tick,
                    report.evicted,
                    report.usage,
                    report.limit
                );
            }
            Ok(_) => {}
            Err(e) => log::warn!("tick {}: {}", tick, e),
        }
    }

    // 4. 导出指标
    engine.wait_idle();
    println!("{}", engine.metrics().to_json());

    engine.shutdown();
    Ok(())
}
