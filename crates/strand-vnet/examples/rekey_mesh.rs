//! Rotates keys across a triangle of connected private subnets.
//!
//! Strands and the subnet rows persist in one SQLite file; host commands are
//! printed instead of executed, so the example runs without hypervisors. Kill
//! it mid-rotation and start it again: the mesh is only built on the first
//! run, and the workers pick up where the strands left off.
//!
//! Run with:
//!   cargo run -p strand-vnet --example rekey_mesh
//!   STRAND_SQLITE_DB=/tmp/mesh.db STRAND_WORKERS=2 cargo run -p strand-vnet --example rekey_mesh

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use strand_kernel::{Clock, ProgRegistry, StrandStore, SystemClock};
use strand_runtime::{ControlPlane, Dispatcher, RuntimeConfig, WorkerPool};
use strand_vnet::{
    register_vnet_progs, CommandError, CommandOutput, CommandRunner, NicState, ProviderDrivers,
    RekeyPhase, SqliteVnetStore, VmPlacement, VnetService, XfrmTunnelDriver,
};
use uuid::Uuid;

/// Logs every host command and pretends it succeeded with empty output.
struct DryRunRunner;

impl CommandRunner for DryRunRunner {
    fn run(
        &self,
        host: &str,
        command: &str,
        stdin: Option<&str>,
    ) -> Result<CommandOutput, CommandError> {
        tracing::info!(host, command, with_stdin = stdin.is_some(), "dry-run");
        Ok(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,strand_runtime=info,strand_vnet=info")),
        )
        .init();

    let config = RuntimeConfig::from_env("strand_vnet_mesh.db")?;
    config.startup_health_check()?;
    let strands: Arc<dyn StrandStore> = Arc::new(config.open_store()?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let vnet = Arc::new(SqliteVnetStore::open(&config.sqlite_db_path)?);

    let driver = Arc::new(XfrmTunnelDriver::new(Arc::new(DryRunRunner)));
    let registry = Arc::new(
        register_vnet_progs(
            ProgRegistry::builder(),
            vnet.clone(),
            ProviderDrivers::new().with("metal", driver),
        )?
        .build(),
    );
    let control = ControlPlane::new(strands.clone(), registry.clone(), clock.clone());
    let service = VnetService::new(vnet.clone(), control, clock.clone());

    if vnet.all_nics()?.is_empty() {
        let subnets = ["ps-fra", "ps-hel", "ps-ash"]
            .into_iter()
            .map(|name| service.create_subnet(name, None).map(|s| s.id))
            .collect::<Result<Vec<_>, _>>()
            .context("create subnets")?;
        for (a, b) in [(0, 1), (1, 2), (2, 0)] {
            service.connect(subnets[a], subnets[b])?;
        }
        for (index, subnet) in subnets.iter().enumerate() {
            for slot in 0..2u8 {
                let host = format!("10.{index}.{slot}.2");
                let nic = service.create_nic(
                    *subnet,
                    &format!("nic-{index}-{slot}"),
                    &format!("10.{index}.{slot}.2/32"),
                    &format!("fd{index:02x}:{slot}::/64"),
                )?;
                service.attach_vm(
                    nic.id,
                    VmPlacement {
                        vm_id: Uuid::new_v4(),
                        host,
                        inhost_name: format!("vm{index}{slot}"),
                        ephemeral_net6: format!("2a01:4f8:{index}:{slot}::/64"),
                    },
                )?;
            }
        }
    } else {
        tracing::info!("resuming the mesh from {}", config.sqlite_db_path);
    }

    let dispatcher = Dispatcher::new(strands, registry, clock, config.dispatcher_config());
    let pool = WorkerPool::new(dispatcher, config.workers, config.poll_interval)
        .with_watchdog(config.watchdog);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = tokio::spawn(pool.run(shutdown_rx));

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, stopping workers");
                break;
            }
            _ = ticker.tick() => {
                let nics = vnet.all_nics()?;
                let done = nics.iter().all(|nic| {
                    nic.state == NicState::Active
                        && nic.rekey_phase == RekeyPhase::Idle
                        && nic.pending_key.is_none()
                });
                if done {
                    tracing::info!(
                        nics = nics.len(),
                        tunnels = vnet.tunnels()?.len(),
                        "mesh rekeyed"
                    );
                    break;
                }
            }
        }
    }

    shutdown_tx.send(true)?;
    let report = workers.await??;
    println!(
        "steps={} exited={} retried={} failed={}",
        report.steps, report.exited, report.retried, report.failed
    );
    Ok(())
}
