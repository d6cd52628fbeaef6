// src/main.rs
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use ethers::providers::{Http, Provider};
use ethers::types::{Address, H256};
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use jsonrpsee::RpcModule;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use gasless_light::bundler::{BundlerClient, HttpBundler};
use gasless_light::chain::EthChainClient;
use gasless_light::config::{GasDefaults, PollSettings, DEFAULT_ENTRY_POINT};
use gasless_light::observer::TracingObserver;
use gasless_light::paymaster::{GasSponsor, HttpPaymaster};
use gasless_light::poller::ReceiptPoller;
use gasless_light::rpc::{self, PaymasterRelay, StatusService};
use gasless_light::tracker::{OperationTracker, DEFAULT_MAX_ENTRIES};
use gasless_light::types::{OperationKind, OperationRecord, UserOperation};
use gasless_light::{revert, units};

type HttpChain = EthChainClient<Provider<Http>>;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long, env = "BUNDLER_URL")]
    bundler_url: Option<String>,

    #[clap(long, env = "PAYMASTER_URL")]
    paymaster_url: Option<String>,

    #[clap(long, env = "ETH_RPC_URL")]
    eth_rpc_url: Option<String>,

    #[clap(long, env = "ENTRY_POINT", default_value = DEFAULT_ENTRY_POINT)]
    entry_point: Address,

    /// Paymaster advertised in stub data before sponsorship.
    #[clap(long, env = "STUB_PAYMASTER")]
    stub_paymaster: Option<Address>,

    #[clap(long, default_value_t = 1500)]
    poll_interval_ms: u64,

    #[clap(long, default_value_t = 10)]
    max_poll_attempts: u32,

    #[clap(long, default_value_t = 5000)]
    chain_retry_ms: u64,

    #[clap(long, default_value_t = 6)]
    max_chain_attempts: u32,

    #[clap(long, default_value_t = 2000)]
    chain_initial_delay_ms: u64,

    #[clap(long, default_value = "info")]
    log_level: Level,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the JSON-RPC relay and status server.
    Serve {
        #[clap(short, long, default_value = "127.0.0.1:8545")]
        rpc_server_addr: String,

        /// Seconds a settled operation stays queryable.
        #[clap(long, default_value_t = 600)]
        tracking_retention_secs: u64,
    },
    /// Decode hex revert data.
    Decode { data: String },
    /// Convert a decimal token amount to base units.
    ToUnits {
        amount: String,
        #[clap(long, default_value_t = 18)]
        decimals: usize,
    },
    /// Poll a submitted operation until it settles.
    Track {
        hash: H256,
        #[clap(flatten)]
        kind: KindArgs,
    },
    /// Classify a bundle transaction from the chain alone.
    CheckTx {
        hash: H256,
        #[clap(flatten)]
        kind: KindArgs,
    },
    /// Sponsor a draft UserOperation read from a JSON file.
    Sponsor { file: PathBuf },
    /// Submit a signed UserOperation read from a JSON file, then track it.
    Send {
        file: PathBuf,
        #[clap(flatten)]
        kind: KindArgs,
    },
}

/// What a successful operation should emit. The first flag given wins.
#[derive(clap::Args, Debug, Clone, Default)]
struct KindArgs {
    /// ERC-20 token expected to emit a Transfer.
    #[clap(long)]
    token: Option<Address>,

    /// Counter contract expected to emit Increment or Decrement.
    #[clap(long)]
    counter: Option<Address>,

    /// ERC-20 token expected to emit an Approval.
    #[clap(long)]
    approval_token: Option<Address>,
}

impl KindArgs {
    fn kind(&self) -> OperationKind {
        if let Some(token) = self.token {
            OperationKind::Transfer { token }
        } else if let Some(contract) = self.counter {
            OperationKind::Counter { contract }
        } else if let Some(token) = self.approval_token {
            OperationKind::Approval { token }
        } else {
            OperationKind::Generic
        }
    }
}

impl Args {
    fn poll_settings(&self) -> PollSettings {
        PollSettings {
            bundler_interval: Duration::from_millis(self.poll_interval_ms),
            max_bundler_attempts: self.max_poll_attempts,
            chain_initial_delay: Duration::from_millis(self.chain_initial_delay_ms),
            chain_retry_interval: Duration::from_millis(self.chain_retry_ms),
            max_chain_attempts: self.max_chain_attempts,
            ..Default::default()
        }
    }

    fn gas_defaults(&self) -> GasDefaults {
        GasDefaults {
            stub_paymaster: self.stub_paymaster,
            ..Default::default()
        }
    }

    fn bundler(&self) -> anyhow::Result<Arc<HttpBundler>> {
        let url = required(&self.bundler_url, "--bundler-url")?;
        Ok(Arc::new(HttpBundler::new(url)?))
    }

    fn chain(&self) -> anyhow::Result<Arc<HttpChain>> {
        let url = required(&self.eth_rpc_url, "--eth-rpc-url")?;
        let provider = Provider::<Http>::try_from(url)?;
        Ok(Arc::new(EthChainClient::new(Arc::new(provider))))
    }

    fn sponsor(&self) -> anyhow::Result<GasSponsor<HttpPaymaster>> {
        let url = required(&self.paymaster_url, "--paymaster-url")?;
        Ok(GasSponsor::new(
            Arc::new(HttpPaymaster::new(url)?),
            self.entry_point,
            self.gas_defaults(),
        ))
    }

    fn poller(&self) -> anyhow::Result<ReceiptPoller<HttpBundler, HttpChain>> {
        Ok(ReceiptPoller::new(self.bundler()?, self.chain()?, self.poll_settings()))
    }
}

fn required<'a>(value: &'a Option<String>, flag: &str) -> anyhow::Result<&'a str> {
    value
        .as_deref()
        .with_context(|| format!("{flag} (or its environment variable) is required"))
}

fn read_user_operation(path: &Path) -> anyhow::Result<UserOperation> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid UserOperation in {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancels the returned token on Ctrl+C.
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match &args.command {
        Command::Serve {
            rpc_server_addr,
            tracking_retention_secs,
        } => {
            let retention = Duration::from_secs(*tracking_retention_secs);
            serve(&args, rpc_server_addr, retention).await
        }
        Command::Decode { data } => {
            println!("{}", revert::decode_hex(data));
            Ok(())
        }
        Command::ToUnits { amount, decimals } => {
            println!("{}", units::to_fixed_point(amount, *decimals)?);
            Ok(())
        }
        Command::Track { hash, kind } => {
            let poller = args.poller()?;
            let record = track(&poller, *hash, kind.kind()).await;
            print_json(&record)
        }
        Command::CheckTx { hash, kind } => {
            let checker = gasless_light::checker::TransactionStatusChecker::new(
                args.chain()?,
                args.poll_settings(),
            );
            let mut record = OperationRecord::new(*hash, kind.kind());
            record.bundled_tx_hash = Some(*hash);
            checker
                .check(*hash, &mut record, &TracingObserver, &ctrl_c_token())
                .await;
            print_json(&record)
        }
        Command::Sponsor { file } => {
            let draft = read_user_operation(file)?;
            let sponsored = args.sponsor()?.sponsor(draft).await?;
            print_json(&sponsored)
        }
        Command::Send { file, kind } => {
            let user_op = read_user_operation(file)?;
            let bundler = args.bundler()?;
            let hash = bundler.send_user_operation(&user_op, args.entry_point).await?;
            let poller = ReceiptPoller::new(bundler, args.chain()?, args.poll_settings());
            info!("Submitted operation {:?}", hash);
            let record = track(&poller, hash, kind.kind()).await;
            print_json(&record)
        }
    }
}

async fn track(
    poller: &ReceiptPoller<HttpBundler, HttpChain>,
    hash: H256,
    kind: OperationKind,
) -> OperationRecord {
    let mut record = OperationRecord::new(hash, kind);
    poller
        .poll(hash, &mut record, &TracingObserver, &ctrl_c_token())
        .await;
    record
}

async fn serve(args: &Args, rpc_server_addr: &str, retention: Duration) -> anyhow::Result<()> {
    let server_addr: SocketAddr = rpc_server_addr.parse()?;
    let relay = PaymasterRelay::new(Arc::new(args.sponsor()?));
    let tracker = Arc::new(OperationTracker::with_limits(
        Arc::new(args.poller()?),
        retention,
        DEFAULT_MAX_ENTRIES,
    ));
    let module = rpc::build_module(relay, StatusService::new(tracker.clone()))?;

    info!("Starting UserOperation relay on {}", server_addr);
    let server_handle = start_server(server_addr, module).await?;

    // Keep the server running until Ctrl+C is pressed
    tokio::signal::ctrl_c().await?;
    tracker.shutdown();
    server_handle.stop()?;
    info!("Server stopped");

    Ok(())
}

async fn start_server(
    server_addr: SocketAddr,
    module: RpcModule<()>,
) -> anyhow::Result<ServerHandle> {
    let server = ServerBuilder::default().build(server_addr).await?;
    let server_handle = server.start(module);

    Ok(server_handle)
}
