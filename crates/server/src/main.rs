//! Shardgen server - Main Entry Point
//!
//! Every rank loads its partition of the model. Rank 0 reads JSON requests
//! from stdin, one per line, and writes one JSON `GeneratedText` per line to
//! stdout; the other ranks follow rank 0's steps until it shuts down.

use anyhow::Context;
use shardgen_common::{ShardgenConfig, METRICS};
use shardgen_server::api::GenerateRequest;
use shardgen_server::{get_model, initialize_distributed, Capability, Engine, Infer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("SHARDGEN_CONFIG").ok().map(PathBuf::from);
    let config = ShardgenConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("shardgen_server={}", config.observability.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!(
        model_id = %config.model.model_id,
        rank = config.distributed.rank,
        world_size = config.distributed.world_size,
        sharded = config.model.sharded,
        "Starting shardgen server"
    );

    let capability = Capability::probe();
    let distributed = config.distributed.clone();
    let settings = config.model.clone();
    let model = tokio::task::spawn_blocking(move || {
        let group = initialize_distributed(&distributed)?;
        get_model(&settings, capability, group)
    })
    .await
    .context("model loading task failed")?
    .context("failed to load model")?;

    let mut engine = Engine::new(model);
    if !config.distributed.is_master() {
        tokio::task::spawn_blocking(move || engine.serve_followers())
            .await
            .context("follower task failed")??;
        info!("Follower shutdown complete");
        return Ok(());
    }

    let infer = Arc::new(Infer::new(engine, config.batching.clone())?);
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = serve_stdin(Arc::clone(&infer)) => {
            result?;
        }
    }

    match Arc::try_unwrap(infer) {
        Ok(infer) => infer.shutdown()?,
        Err(_) => warn!("Requests still in flight at shutdown"),
    }
    if config.observability.enable_metrics {
        info!("Final metrics:\n{}", METRICS.gather());
    }
    info!("Shardgen server shutdown complete");
    Ok(())
}

/// Answer every request line on stdin, then wait for the stragglers
async fn serve_stdin(infer: Arc<Infer>) -> anyhow::Result<()> {
    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = output_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let infer = Arc::clone(&infer);
        let output_tx = output_tx.clone();
        tasks.spawn(async move {
            let response = match serde_json::from_str::<GenerateRequest>(&line) {
                Ok(request) => {
                    let (parameters, stopping) = request.parameters.into_pb();
                    match infer.generate(request.inputs, parameters, stopping).await {
                        Ok(response) => serde_json::to_string(&response.generated_text),
                        Err(err) => {
                            error!(error = %err, "Request failed");
                            serde_json::to_string(&serde_json::json!({ "error": err.to_string() }))
                        }
                    }
                }
                Err(err) => serde_json::to_string(&serde_json::json!({ "error": format!("invalid request: {}", err) })),
            };
            match response {
                Ok(line) => {
                    let _ = output_tx.send(line);
                }
                Err(err) => error!(error = %err, "Cannot encode response"),
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        joined.context("request task panicked")?;
    }
    drop(output_tx);
    writer.await.context("writer task panicked")??;
    Ok(())
}
