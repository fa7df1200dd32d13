use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use config::{File, FileFormat};
use rand::Rng;
use tracing::info;

use tribes_cluster::cluster::SimpleTcpCluster;
use tribes_cluster::config::ClusterConfig;
use tribes_cluster::listener::ClusterSessionListener;
use tribes_cluster::manager::{ClusterManager, DeltaManager};
use tribes_cluster::valve::{ClusterRequest, ReplicationValve, RequestHandler};
use tribes_core::config::ConfigBuilder;
use tribes_core::ext::init_logger_with_filter;
use tribes_core::member::Member;
use tribes_transport::config::TransportConfig;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long, default_value_t = 4000)]
    port: u16,
    /// Address of a peer node, may be repeated.
    #[arg(long)]
    peer: Vec<SocketAddr>,
    /// Optional toml file layered over the reference transport config.
    #[arg(short, long)]
    config: Option<String>,
    #[arg(long, default_value = "use_ack|sync_ack")]
    send_options: String,
    #[arg(short, long, default_value_t = 1000)]
    interval_ms: u64,
    #[arg(long, default_value_t = false)]
    print_config: bool,
}

struct Counter {
    manager: Arc<DeltaManager>,
}

#[async_trait]
impl RequestHandler for Counter {
    async fn invoke(&self, request: &mut ClusterRequest) -> anyhow::Result<()> {
        if let Some(session_id) = request.session_id.clone() {
            let value: u32 = rand::thread_rng().gen_range(0..1000);
            self.manager.set_attribute(&session_id, "counter", value.to_be_bytes().to_vec())?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logger_with_filter("tribes=debug");
    let mut transport_builder = TransportConfig::builder();
    if let Some(path) = &args.config {
        transport_builder = transport_builder.add_source(File::with_name(path))?;
    }
    let mut transport = transport_builder.build()?;
    transport.receiver.port = args.port;
    let cluster_config = ClusterConfig::builder()
        .add_source(File::from_str(&format!("channel_send_options = \"{}\"", args.send_options), FileFormat::Toml))?
        .build()?;
    if args.print_config {
        println!("{}", toml::to_string_pretty(&transport)?);
        println!("{}", toml::to_string_pretty(&cluster_config)?);
        return Ok(());
    }
    let cluster = SimpleTcpCluster::new(cluster_config, transport)?;
    let local = cluster.start().await?;
    info!("node started at {}", local);
    for peer in &args.peer {
        cluster.add_member(Member::new(*peer));
    }
    let manager = Arc::new(DeltaManager::new(cluster.manager_name("/playground")));
    cluster.register_manager(manager.clone())?;
    cluster.add_cluster_listener(Arc::new(ClusterSessionListener));
    let valve = ReplicationValve::new(cluster.clone(), Arc::new(Counter { manager: manager.clone() }))?;
    let session_id = manager.create_session(format!("{}-{}", local.addr.port(), rand::thread_rng().gen::<u16>()));
    let mut interval = tokio::time::interval(Duration::from_millis(args.interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let mut request = ClusterRequest::builder()
                    .uri("/playground/counter")
                    .manager(manager.clone() as Arc<dyn ClusterManager>)
                    .session_id(session_id.clone())
                    .build();
                valve.invoke(&mut request).await?;
                cluster.background_process();
                info!("{} sessions known, primary {:?}", manager.session_count(), manager.is_primary_session(&session_id));
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }
    cluster.stop().await;
    Ok(())
}
