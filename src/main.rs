use anyhow::Context;
use distributed_volume::brick::{MemoryBrick, brick_router};
use distributed_volume::config::DistributeConfig;
use distributed_volume::fop::Loc;
use distributed_volume::rebalance::Rebalancer;
use distributed_volume::router::{Distribute, admin_router};
use distributed_volume::topology::monitor::TopologyMonitor;
use distributed_volume::topology::registry::TopologyRegistry;
use distributed_volume::topology::types::SubvolId;
use distributed_volume::transport::{HttpTransport, Transport};
use std::net::SocketAddr;
use std::sync::Arc;

fn usage(program: &str) -> ! {
    eprintln!("Usage: {} --bind <addr:port> --brick <name>", program);
    eprintln!(
        "       {} --bind <addr:port> --subvol <name>=<url> [--subvol ...] [--config <file>]",
        program
    );
    eprintln!("Example: {} --bind 127.0.0.1:7001 --brick b0", program);
    eprintln!(
        "Example: {} --bind 127.0.0.1:7000 --subvol b0=http://127.0.0.1:7001 --subvol b1=http://127.0.0.1:7002",
        program
    );
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        usage(&args[0]);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut brick_name: Option<String> = None;
    let mut subvols: Vec<(SubvolId, String)> = vec![];
    let mut config_path: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--bind", Some(v)) => {
                bind_addr = Some(v.parse().with_context(|| format!("Invalid --bind {}", v))?);
                i += 2;
            }
            ("--brick", Some(v)) => {
                brick_name = Some(v.clone());
                i += 2;
            }
            ("--subvol", Some(v)) => {
                let (name, url) = v
                    .split_once('=')
                    .with_context(|| format!("--subvol expects name=url, got {}", v))?;
                subvols.push((SubvolId::new(name), url.to_string()));
                i += 2;
            }
            ("--config", Some(v)) => {
                config_path = Some(v.clone());
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let Some(bind_addr) = bind_addr else {
        usage(&args[0]);
    };

    // Brick mode: serve one in-memory subvolume.
    if let Some(name) = brick_name {
        let brick = Arc::new(MemoryBrick::new(SubvolId::new(name.as_str())));
        tracing::info!("Brick {} listening on {}", name, bind_addr);

        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        axum::serve(listener, brick_router(brick)).await?;
        return Ok(());
    }

    if subvols.is_empty() {
        usage(&args[0]);
    }

    let config = match config_path {
        Some(path) => DistributeConfig::load(&path)?,
        None => DistributeConfig::default(),
    };
    config.validate()?;
    tracing::info!("Volume config: {:?}", config);

    // 1. Transport to the bricks:
    let transport = Arc::new(HttpTransport::new(
        config.rpc_timeout(),
        config.rpc_attempts as usize,
    ));
    for (id, url) in &subvols {
        transport.add_endpoint(id.clone(), url.as_str());
    }
    let transport: Arc<dyn Transport> = transport;

    // 2. Topology and its probe loop:
    let ids: Vec<SubvolId> = subvols.iter().map(|(id, _)| id.clone()).collect();
    let registry = TopologyRegistry::with_subvolumes(&ids, config.min_free_disk_percent);
    let monitor = TopologyMonitor::new(
        registry.clone(),
        transport.clone(),
        config.du_refresh_interval(),
        config.rpc_timeout(),
    );
    monitor.start();

    // 3. The volume and its mover:
    let workers = config.rebalance_workers;
    let volume = Distribute::new(transport, registry.clone(), config);
    match volume.lookup(&Loc::root()).await {
        Ok(_) => tracing::info!("Root layout ready"),
        Err(errno) => tracing::warn!("Root lookup failed ({}), will heal on first access", errno),
    }

    let rebalancer = Rebalancer::new(volume.clone(), workers);
    rebalancer.start().await;

    // 4. Spawn stats reporter:
    let stats_volume = volume.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));

        loop {
            interval.tick().await;
            let view = stats_volume.registry().snapshot();
            let status = stats_volume.rebalance_status();
            tracing::info!(
                "Volume stats: {}/{} subvolumes up (generation {})",
                view.up().len(),
                view.all().len(),
                view.generation
            );
            tracing::info!(
                "  - rebalance pending={} running={} failed={} migrated={} ({} bytes)",
                status.pending,
                status.running,
                status.failed,
                status.files_migrated,
                status.bytes_moved
            );
        }
    });

    // 5. Start admin server:
    tracing::info!("Admin server listening on {}", bind_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, admin_router(volume)).await?;

    Ok(())
}
