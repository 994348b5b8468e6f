//! Pipeline and fan-out demo
//!
//! Run with `RUST_LOG=conveyor_engine=debug cargo run --example pipeline_demo`.

use std::time::Duration;

use conveyor_engine::prelude::*;
use conveyor_engine::{PoolConfig, TracingObserver};
use futures::{stream, StreamExt};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    run_pool().await?;
    run_pipeline().await?;
    run_fan_out().await?;
    Ok(())
}

/// Worker pool with a shutdown grace period
async fn run_pool() -> anyhow::Result<()> {
    let config = PoolConfig::from_env().with_name("lengths");
    let pool = WorkerPool::builder(config, |task: Task<String>| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        anyhow::Ok(task.into_payload().len())
    })
    .observer(std::sync::Arc::new(TracingObserver))
    .build()?;
    pool.start()?;

    let mut futures = Vec::new();
    for word in ["alpha", "beta", "gamma", "delta"] {
        futures.push(pool.submit(word.to_string()).await?);
    }
    let batch = wait_all(futures).await;
    tracing::info!(lengths = ?batch.values().collect::<Vec<_>>(), "Pool batch done");

    pool.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}

/// parse -> square -> render, with one bad input
async fn run_pipeline() -> anyhow::Result<()> {
    let pipeline = Pipeline::builder(Stage::new("parse", 2, 8, |raw: String| async move {
        anyhow::Ok(raw.parse::<i64>()?)
    }))
    .then(Stage::new("square", 4, 8, |n: i64| async move {
        anyhow::Ok(n * n)
    }))
    .then(Stage::new("render", 1, 8, |n: i64| async move {
        anyhow::Ok(format!("<{n}>"))
    }))
    .build()?;

    let mut futures = Vec::new();
    for raw in ["3", "4", "five", "6"] {
        futures.push(pipeline.submit(raw.to_string()).await?);
    }
    let batch = wait_all(futures).await;
    tracing::info!(
        rendered = ?batch.values().collect::<Vec<_>>(),
        errors = ?batch.error_summary(),
        "Pipeline batch done"
    );

    pipeline.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}

/// Fan out over four workers, merge, and restore input order
async fn run_fan_out() -> anyhow::Result<()> {
    let token = CancellationToken::new();
    let _deadline = token.timeout(Duration::from_secs(10));

    let outputs = fan_out_indexed(stream::iter(0..16u64), 4, &token, |n: u64| async move {
        tokio::time::sleep(Duration::from_millis(16 - n)).await;
        anyhow::ensure!(n != 7, "unlucky {n}");
        anyhow::Ok(n * 3)
    })?;

    let ordered: Vec<String> = reordered(outputs.merge())
        .map(|item| match item {
            Ok(n) => n.to_string(),
            Err(err) => format!("<{err}>"),
        })
        .collect()
        .await;
    tracing::info!(?ordered, "Fan-out done");
    Ok(())
}
