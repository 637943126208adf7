//! Palisade CLI - generate network policies and seccomp profiles from
//! traffic recorded inside a cluster

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use kube::Client;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use palisade::broker::BrokerClient;
use palisade::engine::{BatchOutcome, Engine};
use palisade::identity::PodIdentity;
use palisade::k8s::ApiClusterLookup;
use palisade::policy::PolicySchema;
use palisade::{k8s, output, portforward, seccomp};

/// Palisade - retrofit least-privilege security profiles onto a cluster
#[derive(Parser, Debug)]
#[command(name = "palisade", version, about, long_about = None)]
struct Cli {
    /// Sets log level to debug
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate resources
    Gen {
        #[command(subcommand)]
        resource: GenResource,
    },
}

#[derive(Subcommand, Debug)]
enum GenResource {
    /// Generate network policies from recorded traffic
    #[command(alias = "netpol")]
    Networkpolicy(NetworkPolicyArgs),

    /// Generate seccomp profiles from recorded syscalls
    #[command(alias = "sc")]
    Seccomp(SeccompArgs),
}

/// Which pods to profile, and how to reach the broker
#[derive(Args, Debug)]
struct SelectionArgs {
    /// Pod to profile; required unless --all or --all-namespaces is set
    pod: Option<String>,

    /// Namespace (defaults to the current context namespace)
    #[arg(short = 'n', long)]
    namespace: Option<String>,

    /// Profile every running pod in the selected namespace
    #[arg(short = 'a', long)]
    all: bool,

    /// Profile every running pod in every namespace
    #[arg(short = 'A', long)]
    all_namespaces: bool,

    /// Namespace the broker service runs in
    #[arg(
        long,
        env = "PALISADE_BROKER_NAMESPACE",
        default_value = palisade::DEFAULT_BROKER_NAMESPACE
    )]
    broker_namespace: String,

    /// Bound on concurrent pod generations in batch mode
    #[arg(long, default_value_t = 8)]
    concurrency: usize,
}

/// Network policy generation arguments
#[derive(Args, Debug)]
struct NetworkPolicyArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    /// Policy schema to emit (standard or cilium)
    #[arg(short = 't', long = "type", default_value = "standard")]
    schema: String,

    /// Directory generated policies are written to
    #[arg(long, default_value = palisade::DEFAULT_POLICY_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Only write manifests to disk; applying them is not implemented
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    dry_run: bool,
}

/// Seccomp profile generation arguments
#[derive(Args, Debug)]
struct SeccompArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    /// Directory generated profiles are written to
    #[arg(long, default_value = palisade::DEFAULT_SECCOMP_OUTPUT_DIR)]
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Commands::Gen { resource } => match resource {
            GenResource::Networkpolicy(args) => run_networkpolicy(args).await,
            GenResource::Seccomp(args) => run_seccomp(args).await,
        },
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn run_networkpolicy(args: NetworkPolicyArgs) -> anyhow::Result<()> {
    let schema: PolicySchema = args
        .schema
        .parse()
        .map_err(|err: String| anyhow::anyhow!(err))?;

    let client = k8s::client()
        .await
        .context("initializing kubernetes client")?;
    let targets = select_targets(&client, &args.selection).await?;
    if targets.is_empty() {
        info!("no pods found with the specified criteria");
        return Ok(());
    }

    let tunnel = portforward::open(&client, &args.selection.broker_namespace)
        .await
        .context("establishing broker tunnel")?;
    let broker = BrokerClient::new(tunnel.base_url())?;
    let lookup = ApiClusterLookup::new(client.clone(), broker.clone());
    let engine = Engine::new(&broker, &lookup);

    info!(pods = targets.len(), %schema, "generating network policies");
    let outcome = engine
        .generate_policies(&targets, schema, args.selection.concurrency)
        .await;

    output::ensure_dir(&args.output_dir).await?;
    for policy in &outcome.policies {
        output::write_policy(&args.output_dir, policy).await?;
    }
    if !args.dry_run {
        warn!("applying network policies is not implemented - manifests were only written to disk");
    }
    report(&outcome)
}

async fn run_seccomp(args: SeccompArgs) -> anyhow::Result<()> {
    let client = k8s::client()
        .await
        .context("initializing kubernetes client")?;
    let targets = select_targets(&client, &args.selection).await?;
    if targets.is_empty() {
        info!("no pods found with the specified criteria");
        return Ok(());
    }

    let tunnel = portforward::open(&client, &args.selection.broker_namespace)
        .await
        .context("establishing broker tunnel")?;
    let broker = BrokerClient::new(tunnel.base_url())?;

    output::ensure_dir(&args.output_dir).await?;
    let mut failed = 0usize;
    for target in &targets {
        match broker.pod_syscalls(&target.name).await {
            Ok(Some(record)) => {
                let profile = seccomp::build_profile(&record);
                let json = seccomp::to_json(&profile)?;
                output::write_seccomp_profile(&args.output_dir, &target.namespace, &target.name, &json)
                    .await?;
            }
            Ok(None) => {
                info!(pod = %target.name, "no recorded syscalls, skipping");
            }
            Err(err) => {
                error!(pod = %target.name, error = %err, "skipping pod after syscall fetch failure");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} pods failed", targets.len());
    }
    Ok(())
}

/// Enumerate the pods the command applies to
async fn select_targets(
    client: &Client,
    selection: &SelectionArgs,
) -> anyhow::Result<Vec<PodIdentity>> {
    let namespace = selection
        .namespace
        .clone()
        .unwrap_or_else(|| k8s::current_namespace(client));

    let pods = if selection.all_namespaces {
        k8s::pods_in_all_namespaces(client).await?
    } else if selection.all {
        k8s::pods_in_namespace(client, &namespace).await?
    } else {
        let name = selection.pod.as_deref().context(
            "pod name is required unless --all or --all-namespaces is set",
        )?;
        vec![k8s::get_pod(client, &namespace, name).await?]
    };

    Ok(pods.iter().map(PodIdentity::from_pod).collect())
}

fn report(outcome: &BatchOutcome) -> anyhow::Result<()> {
    if let Some(err) = outcome.first_error() {
        anyhow::bail!(
            "{} of {} pods failed; first error: {err}",
            outcome.failures.len(),
            outcome.failures.len() + outcome.policies.len(),
        );
    }
    Ok(())
}
