use anyhow::Result;
use std::net::SocketAddr;
use tokio::signal;
use tracing::info;

use predictor_orchestrator::{operator, CapabilitySet, Orchestrator, OrchestratorConfig};
use serving_core::{
    clear_ready, init_metrics, init_tracing, load_config, mark_ready, shutdown_telemetry,
    start_health_server,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("predictor-orchestrator")?;
    init_metrics()?;
    info!("predictor-orchestrator starting");

    let service_cfg = load_config("predictor-orchestrator").await?;
    let mut cfg = OrchestratorConfig::load().await?;
    if cfg.data_dir.is_none() {
        cfg.data_dir = service_cfg.data_dir.clone();
    }
    info!(?cfg, "config_loaded");

    start_health_server(service_cfg.health_port.unwrap_or(9091)).await?;

    let orch = Orchestrator::build(cfg.clone(), CapabilitySet::builtin()).await?;
    orch.start().await?;
    let operator_addr = SocketAddr::from(([0, 0, 0, 0], cfg.operator_port));
    let addr = operator::serve(orch.clone(), operator_addr).await?;
    mark_ready();
    info!(%addr, "service ready");

    signal::ctrl_c().await?;
    info!("shutdown");
    clear_ready();
    orch.shutdown().await;
    shutdown_telemetry();
    Ok(())
}
