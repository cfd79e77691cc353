mod config;
mod connection;
mod dnsbl;
mod error;
mod proxy;
mod relay;
mod server;
mod session;
mod tls;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;

use structopt::StructOpt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-gateway",
    about = "SMTP gateway relaying accepted mail to an upstream server, with tarpit and DNSBL checks"
)]
pub struct Opt {
    /// Upstream relay, as host or host:port
    #[structopt(long = "relay-host", env = "RELAY_HOST")]
    pub relay_host: String,

    /// Regular expression recipients must match (empty accepts everyone)
    #[structopt(long = "valid-recipients", env = "VALID_RECIPIENTS")]
    pub valid_recipients: Option<String>,

    /// Space-separated DNSBL zones checked before relaying
    #[structopt(long = "dnsbl-domains", env = "DNSBL_DOMAINS")]
    pub dnsbl_domains: Option<String>,

    /// Deliver every accepted message to this address instead
    #[structopt(long = "override-recipient", env = "OVERRIDE_RECIPIENT")]
    pub override_recipient: Option<String>,

    /// PEM certificate chain for STARTTLS
    #[structopt(long = "tls-cert", env = "SERVER_CERT", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for STARTTLS
    #[structopt(long = "tls-key", env = "SERVER_KEY", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Listening address, ignored under socket activation
    #[structopt(short = "a", long = "address", env = "LISTEN_ADDRESS", default_value = "0.0.0.0:25")]
    pub address: String,

    /// Name used in the greeting (default: system hostname)
    #[structopt(long = "hostname", env = "SMTP_HOSTNAME")]
    pub hostname: Option<String>,

    /// Largest accepted message body, in bytes (default: 150 MiB)
    #[structopt(long = "max-message-size", env = "MAX_MESSAGE_SIZE")]
    pub max_message_size: Option<usize>,

    /// Seconds allowed for one upstream delivery
    #[structopt(long = "delivery-timeout", env = "DELIVERY_TIMEOUT", default_value = "60")]
    pub delivery_timeout: u64,

    /// Prepend a Received: header to relayed messages
    #[structopt(long = "received-header")]
    pub received_header: bool,

    /// Verbose mode - log every SMTP command
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "smtp_gateway=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn run(opt: Opt) -> anyhow::Result<()> {
    let config = config::Config::from_opt(&opt)?;
    info!(
        hostname = %config.hostname,
        relay = %config.relay_host,
        max_message_size = config.max_message_size,
        "Starting SMTP gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    let gateway = Arc::new(server::Gateway::new(config)?);
    for zone in gateway.blacklist.zones() {
        info!(%zone, "DNSBL zone enabled");
    }
    let listener = gateway.listen().await?;
    gateway.run(listener).await
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    init_logging(opt.verbose);

    if let Err(e) = run(opt).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
