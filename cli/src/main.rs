//! ledgerrpc CLI — probe and exercise Soroban RPC nodes from the terminal.
//!
//! Usage:
//! ```bash
//! # Health, ledger and network of the SDF testnet RPC
//! ledgerrpc health --network testnet
//!
//! # Raw JSON-RPC call against any node
//! ledgerrpc call --url http://localhost:8000/soroban/rpc --method getLatestLedger
//!
//! # Dry-run a transaction envelope
//! ledgerrpc simulate --network testnet --tx AAAAAgAAAAB...
//!
//! # Follow a contract's events
//! ledgerrpc watch --ws-url wss://rpc.example.net/ws --contract CCW6...
//!
//! # Built-in network profiles
//! ledgerrpc networks
//! ```

mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use ledgerrpc_core::{
    methods, BearerToken, ClientConfig, Endpoint, EventFilter, LedgerClient, Protocol,
    SimulationVerdict, StreamUpdate, TransactionIntent,
};
use ledgerrpc_http::HttpConnector;
use ledgerrpc_networks::{profiles, Network};
use ledgerrpc_ws::{WsConfig, WsConnector, WsEventSource};

use logging::LogConfig;

const TOKEN_ENV: &str = "LEDGERRPC_TOKEN";

#[derive(Parser)]
#[command(name = "ledgerrpc", version)]
#[command(about = "Probe, call, simulate and watch Soroban RPC nodes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit logs as JSON lines (logs go to stderr)
    #[arg(long, global = true)]
    log_json: bool,

    /// Debug-level logs from the client stack
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check node health, latest ledger and network identity
    Health {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Send a raw JSON-RPC call and print the result
    Call {
        #[command(flatten)]
        target: TargetArgs,

        /// Method name, e.g. getLatestLedger
        #[arg(short, long)]
        method: String,

        /// Params as a JSON value
        #[arg(short, long)]
        params: Option<String>,
    },

    /// Simulate a transaction envelope
    Simulate {
        #[command(flatten)]
        target: TargetArgs,

        /// Base64 TransactionEnvelope XDR
        #[arg(long)]
        tx: String,

        /// Extra CPU instructions to add to the simulated budget
        #[arg(long)]
        leeway: Option<u64>,
    },

    /// Stream contract events until interrupted
    Watch {
        /// WebSocket endpoint serving event subscriptions
        #[arg(long)]
        ws_url: String,

        /// Contract id to follow (repeatable)
        #[arg(short, long, required = true)]
        contract: Vec<String>,

        /// Topic filter, comma separated segments, `*` for any (repeatable)
        #[arg(long)]
        topic: Vec<String>,

        /// Resume after this cursor
        #[arg(long)]
        after: Option<u64>,

        /// Bearer token; falls back to $LEDGERRPC_TOKEN
        #[arg(long)]
        token: Option<String>,
    },

    /// List built-in network profiles
    Networks,
}

/// Where to send requests.
#[derive(Args, Debug, Clone)]
struct TargetArgs {
    /// Built-in network profile
    #[arg(short, long, default_value = "testnet")]
    network: Network,

    /// RPC URL; overrides the profile's endpoint
    #[arg(short, long, conflicts_with = "config")]
    url: Option<String>,

    /// JSON client configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra lower-priority endpoints (repeatable)
    #[arg(long)]
    fallback: Vec<String>,

    /// Bearer token; falls back to $LEDGERRPC_TOKEN
    #[arg(long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut log = LogConfig {
        json: cli.log_json,
        ..LogConfig::default()
    };
    if cli.verbose {
        log = log.verbose();
    }
    logging::init_tracing(&log);

    match cli.command {
        Commands::Health { target } => cmd_health(&target).await,
        Commands::Call {
            target,
            method,
            params,
        } => cmd_call(&target, &method, params.as_deref()).await,
        Commands::Simulate { target, tx, leeway } => cmd_simulate(&target, tx, leeway).await,
        Commands::Watch {
            ws_url,
            contract,
            topic,
            after,
            token,
        } => cmd_watch(ws_url, contract, topic, after, token).await,
        Commands::Networks => {
            cmd_networks();
            Ok(())
        }
    }
}

fn resolve_config(target: &TargetArgs) -> Result<ClientConfig> {
    let config = if let Some(path) = &target.config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        ClientConfig::from_json(&raw).with_context(|| format!("parsing {}", path.display()))?
    } else if let Some(url) = &target.url {
        profiles::provider(url.clone())
    } else {
        profiles::hosted(target.network)?
    };
    Ok(profiles::with_fallbacks(config, target.fallback.iter().cloned()))
}

fn resolve_token(flag: Option<String>) -> Option<BearerToken> {
    flag.or_else(|| std::env::var(TOKEN_ENV).ok())
        .filter(|t| !t.is_empty())
        .map(BearerToken::new)
}

/// Pick the wire backend from the endpoints' protocols.
fn connect(mut config: ClientConfig, token: Option<BearerToken>) -> Result<LedgerClient> {
    let protocols: Vec<Protocol> = config.endpoints().iter().map(Endpoint::protocol).collect();
    let all_ws = protocols.iter().all(|p| *p == Protocol::WebSocket);
    if !all_ws && protocols.contains(&Protocol::WebSocket) {
        bail!("mixing http and websocket endpoints in one client is not supported");
    }

    let mut builder = if all_ws {
        config.pool.multiplexed = true;
        let connector = WsConnector::new(WsConfig {
            credential: token.clone(),
            ..WsConfig::default()
        });
        LedgerClient::builder(config).connector(Arc::new(connector))
    } else {
        LedgerClient::builder(config).connector(Arc::new(HttpConnector::default_client()?))
    };
    if let Some(token) = token {
        builder = builder.credential(token);
    }
    Ok(builder.build()?)
}

async fn cmd_health(target: &TargetArgs) -> Result<()> {
    let client = connect(resolve_config(target)?, resolve_token(target.token.clone()))?;

    let started = Instant::now();
    let health: Value = client.call(methods::GET_HEALTH, Value::Null).await?;
    let latency = started.elapsed();
    let network: Value = client.call(methods::GET_NETWORK, Value::Null).await?;

    let passphrase = network["passphrase"].as_str().unwrap_or("?");
    let identified = Network::from_passphrase(passphrase)
        .map(|n| n.to_string())
        .unwrap_or_else(|| "unknown".into());

    println!("  Status:        {}", health["status"].as_str().unwrap_or("?"));
    println!("  Latest ledger: {}", health["latestLedger"]);
    println!("  Network:       {identified} ({passphrase})");
    println!("  Latency:       {}ms", latency.as_millis());
    println!("  Client health: {}", client.health());
    for ep in client.endpoint_stats() {
        println!(
            "  Endpoint:      {}  circuit={} open_connections={}",
            ep.url, ep.circuit.state, ep.open_connections
        );
    }
    Ok(())
}

async fn cmd_call(target: &TargetArgs, method: &str, params: Option<&str>) -> Result<()> {
    let params: Value = match params {
        Some(raw) => serde_json::from_str(raw).context("--params is not valid JSON")?,
        None => Value::Null,
    };
    let client = connect(resolve_config(target)?, resolve_token(target.token.clone()))?;
    let result: Value = client.call(method, params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_simulate(target: &TargetArgs, tx: String, leeway: Option<u64>) -> Result<()> {
    let client = connect(resolve_config(target)?, resolve_token(target.token.clone()))?;
    let mut intent = TransactionIntent::new(tx);
    if let Some(leeway) = leeway {
        intent = intent.with_instruction_leeway(leeway);
    }

    let sim = client.simulate(&intent).await?;
    println!("  Latest ledger:    {}", sim.latest_ledger);
    println!("  Min resource fee: {} stroops", sim.min_resource_fee);
    println!("  CPU instructions: {}", sim.cost.cpu_insns);
    println!("  Memory bytes:     {}", sim.cost.mem_bytes);
    println!("  State changes:    {}", sim.state_changes.len());
    println!("  Events:           {}", sim.events.len());
    match &sim.verdict {
        SimulationVerdict::Success => println!("  Verdict:          ready to submit"),
        SimulationVerdict::RestoreRequired {
            min_resource_fee, ..
        } => println!("  Verdict:          restore required ({min_resource_fee} stroops)"),
    }
    if let Some(data) = &sim.transaction_data {
        println!("  Transaction data: {data}");
    }
    Ok(())
}

fn parse_topics(raw: &[String]) -> Vec<Vec<String>> {
    raw.iter()
        .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
        .collect()
}

async fn cmd_watch(
    ws_url: String,
    contracts: Vec<String>,
    topics: Vec<String>,
    after: Option<u64>,
    token: Option<String>,
) -> Result<()> {
    let token = resolve_token(token);
    let ws = WsConnector::new(WsConfig {
        credential: token.clone(),
        ..WsConfig::default()
    });
    let source = WsEventSource::new(ws.clone(), Endpoint::new(ws_url.clone()));

    let mut config = ClientConfig::single(ws_url);
    config.pool.multiplexed = true;
    let client = LedgerClient::builder(config)
        .connector(Arc::new(ws))
        .event_source(Arc::new(source))
        .build()?;

    let filter = EventFilter {
        event_type: Some("contract".into()),
        contract_ids: contracts,
        topics: parse_topics(&topics),
    };
    let mut sub = client.subscribe(filter, after)?;
    tracing::info!(subscription = %sub.id(), "watching events, ctrl-c to stop");

    loop {
        tokio::select! {
            update = sub.recv() => match update {
                Some(StreamUpdate::Event(event)) => println!("{}", serde_json::to_string(&*event)?),
                Some(StreamUpdate::Resynced { from, to }) => {
                    tracing::warn!(from, to, "gap closed by replay");
                }
                Some(StreamUpdate::Closed { reason }) => {
                    client.shutdown().await;
                    bail!("subscription closed: {reason}");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    client.shutdown().await;
    Ok(())
}

fn cmd_networks() {
    println!("Built-in network profiles:\n");
    for network in Network::ALL {
        println!("  {network}");
        println!("            Passphrase: {}", network.passphrase());
        println!(
            "            RPC:        {}",
            network.rpc_url().unwrap_or("(none public; pass --url)")
        );
        if let Some(friendbot) = network.friendbot_url() {
            println!("            Friendbot:  {friendbot}");
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn target(args: &[&str]) -> TargetArgs {
        let mut argv = vec!["ledgerrpc", "health"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Health { target } => target,
            _ => unreachable!(),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_to_hosted_testnet() {
        let config = resolve_config(&target(&[])).unwrap();
        assert_eq!(config.endpoints[0].url, "https://soroban-testnet.stellar.org");
        assert!(config.rate_limit.is_some());
    }

    #[test]
    fn explicit_url_with_fallbacks() {
        let config = resolve_config(&target(&[
            "--url",
            "http://localhost:8000/soroban/rpc",
            "--fallback",
            "https://soroban-testnet.stellar.org",
        ]))
        .unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[1].priority, 1);
    }

    #[test]
    fn mainnet_without_url_is_rejected() {
        assert!(resolve_config(&target(&["--network", "mainnet"])).is_err());
    }

    #[test]
    fn topics_split_on_commas() {
        let topics = parse_topics(&["AAAADwAAAAh0cmFuc2Zlcg==, *".to_string()]);
        assert_eq!(topics, vec![vec!["AAAADwAAAAh0cmFuc2Zlcg==".to_string(), "*".to_string()]]);
    }

    #[test]
    fn mixed_protocols_are_refused() {
        let mut config = ClientConfig::single("https://soroban-testnet.stellar.org");
        config.endpoints.push(ledgerrpc_core::config::EndpointConfig::new("wss://rpc.example.net"));
        let err = connect(config, None).unwrap_err();
        assert!(err.to_string().contains("mixing"));
    }
}
