/*
 * ballast is the balancer server. It takes configuration via a configuration
 * file, command-line parameters, and environment variables, then starts a
 * balancer node that replicates the service catalog over consensus (default
 * port 9705), discovers peers and agents via gossip (default port 7946), and
 * programs the local dataplane.
 */

#![warn(clippy::all)]

use ballast::cluster;
use ballast::dataplane::{Interface, Ipvs, MemoryInterface, MemoryIpvs};
use ballast::errinput;
use ballast::error::Result;
use ballast::Balancer;

use serde_derive::Deserialize;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/ballast.yaml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("ballast");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    // The kernel dataplane is consumed through the Ipvs and Interface
    // traits; a netlink-backed engine is wired in here by the embedding
    // environment. The memory engine keeps the node fully self-contained.
    let (ipvs, iface): (Arc<dyn Ipvs>, Arc<dyn Interface>) = match cfg.dataplane.as_str() {
        "memory" | "" => (Arc::new(MemoryIpvs::new()), Arc::new(MemoryInterface::new())),
        name => return errinput!("invalid dataplane engine {name}"),
    };

    let _balancer = Balancer::new(
        cluster::Config {
            name: cfg.name,
            listen_raft: cfg.listen_raft,
            advertise_raft: cfg.advertise_raft,
            listen_gossip: cfg.listen_gossip,
            join: cfg.join,
            bootstrap: cfg.bootstrap,
            data_dir: Some(cfg.data_dir.into()),
            provider: cfg.provider,
            vip_range: cfg.vip_range,
            stats_interval: Duration::from_secs(cfg.stats_interval),
        },
        ipvs,
        iface,
    )?;

    // The balancer runs on its own threads until the process is terminated.
    loop {
        std::thread::park();
    }
}

#[derive(Debug, Deserialize)]
struct Config {
    name: String,
    data_dir: String,
    listen_raft: String,
    #[serde(default)]
    advertise_raft: Option<String>,
    listen_gossip: String,
    join: Vec<String>,
    bootstrap: bool,
    provider: String,
    vip_range: String,
    stats_interval: u64,
    log_level: String,
    dataplane: String,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("name", "ballast")?
            .set_default("data_dir", "data")?
            .set_default("listen_raft", "0.0.0.0:9705")?
            .set_default("listen_gossip", "0.0.0.0:7946")?
            .set_default("join", Vec::<String>::new())?
            .set_default("bootstrap", false)?
            .set_default("provider", "none")?
            .set_default("vip_range", "192.168.0.0/28")?
            .set_default("stats_interval", 0)?
            .set_default("log_level", "info")?
            .set_default("dataplane", "memory")?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("BALLAST"))
            .build()?
            .try_deserialize()?)
    }
}
