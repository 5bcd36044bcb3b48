use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yuanjing_trace::{BatchOrchestrator, Config, Pipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yuanjing_trace=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // ----------------------------------------------------------------
    // 0. 加载配置（非法阈值直接终止）
    // ----------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        db = %config.fingerprints_path.display(),
        workers = config.workers,
        "⚙️  配置加载完成"
    );

    // ----------------------------------------------------------------
    // 1. 流水线 & 编排器
    // ----------------------------------------------------------------
    let pipeline = Arc::new(Pipeline::new(&config)?);
    info!(families = ?pipeline.family_names(), "📚 归因指纹库就绪");

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("stats") {
        println!("{}", serde_json::to_string_pretty(&pipeline.family_stats())?);
        return Ok(());
    }
    if args.is_empty() {
        anyhow::bail!("usage: yuanjing-trace <image>... | yuanjing-trace stats");
    }

    let mut images = Vec::with_capacity(args.len());
    for path in &args {
        images.push(std::fs::read(path).with_context(|| format!("failed to read {path}"))?);
    }

    // ----------------------------------------------------------------
    // 2. 批量分析
    // ----------------------------------------------------------------
    let orchestrator = BatchOrchestrator::new(pipeline, config.workers, config.max_batch_size);
    let report = orchestrator.process_batch(images).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    orchestrator.shutdown();
    Ok(())
}
