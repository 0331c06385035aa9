//! magicmail-infra - synthesize the MagicMail stacks and bootstrap the GitLab server

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use magicmail_infra::bootstrap::{BootstrapParams, BootstrapScript, Section};
use magicmail_infra::config::loader::DEFAULT_CONTEXT_FILE;
use magicmail_infra::config::{ContextLoader, DeploymentTarget};
use magicmail_infra::provision::{BootstrapRunner, MetadataClient, SystemHost};
use magicmail_infra::synth::assembly::DEFAULT_OUTPUT_DIR;
use magicmail_infra::userdata::Encoding;
use magicmail_infra::{build_app, synth};

#[derive(Parser)]
#[command(name = "magicmail-infra")]
#[command(author, version, about = "MagicMail infrastructure stacks", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Context value override (repeatable)
    #[arg(short = 'c', long = "context", value_name = "KEY=VALUE", global = true)]
    context: Vec<String>,

    /// File holding context values under a `context` key
    #[arg(long, default_value = DEFAULT_CONTEXT_FILE, global = true)]
    context_file: PathBuf,

    /// Target account
    #[arg(long, env = "CDK_DEFAULT_ACCOUNT", global = true)]
    account: Option<String>,

    /// Target region
    #[arg(long, env = "CDK_DEFAULT_REGION", global = true)]
    region: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize every stack into a cloud assembly directory
    Synth {
        /// Output directory
        #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
        out: PathBuf,
    },
    /// List stack names
    List,
    /// Print one stack's template
    Template {
        /// Stack name (e.g., GitLabServerStack)
        stack: String,
    },
    /// Print the GitLab server bootstrap script
    Userdata {
        /// volume, install or all
        #[arg(long, default_value = "all")]
        section: Section,
        /// plain, base64 or gzip
        #[arg(long, default_value = "plain")]
        encode: Encoding,
    },
    /// Run the bootstrap sequence on this machine
    Bootstrap,
    /// Print this instance's public IPv4 (falls back to 127.0.0.1)
    PublicIp,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let target = DeploymentTarget {
        account: cli.account.clone(),
        region: cli.region.clone(),
    };
    if !target.is_resolved() {
        warn!(
            "Account or region not set, synthesizing for {}",
            target.environment_string()
        );
    }

    let load_context = || {
        ContextLoader::new()
            .with_file(&cli.context_file)
            .with_raw_overrides(&cli.context)?
            .load()
    };

    match cli.command.unwrap_or(Commands::Synth {
        out: PathBuf::from(DEFAULT_OUTPUT_DIR),
    }) {
        Commands::Synth { out } => {
            let app = build_app(&load_context()?, &target)?;
            let assembly = synth::write_assembly(&app, &out)
                .with_context(|| format!("writing assembly to {}", out.display()))?;
            info!(
                "Synthesized {} stacks to {}",
                assembly.manifest.artifacts.len(),
                assembly.directory.display()
            );
            for name in app.stack_names() {
                println!("{}", name);
            }
        }
        Commands::List => {
            let app = build_app(&load_context()?, &target)?;
            for name in app.stack_names() {
                println!("{}", name);
            }
        }
        Commands::Template { stack } => {
            let app = build_app(&load_context()?, &target)?;
            let Some(found) = app.stack(&stack) else {
                bail!(
                    "No stack named '{}' (available: {})",
                    stack,
                    app.stack_names().join(", ")
                );
            };
            let template = synth::synthesize(found)?;
            println!("{}", serde_json::to_string_pretty(&template)?);
        }
        Commands::Userdata { section, encode } => {
            let script = BootstrapScript::new(BootstrapParams::default())?;
            println!("{}", script.user_data(section)?.encode(encode)?);
        }
        Commands::Bootstrap => {
            let params = BootstrapParams::default();
            let host = SystemHost::for_params(&params)?;
            let report = BootstrapRunner::new(&host, &params)
                .run()
                .await
                .context("bootstrap sequence")?;

            match &report.data_device {
                Some(device) => info!(
                    "Data volume {} mounted at {}",
                    device.display(),
                    params.mount_point.display()
                ),
                None => warn!("Running on the root volume only"),
            }
            if !report.failed_steps.is_empty() {
                warn!("Failed steps: {}", report.failed_steps.join(", "));
            }
            if report.is_degraded() {
                info!("Bootstrap finished in degraded mode");
            } else {
                info!("Bootstrap finished");
            }
        }
        Commands::PublicIp => {
            let params = BootstrapParams::default();
            let client = MetadataClient::with_base_url(params.metadata_endpoint.as_str())?;
            println!("{}", client.public_ipv4_or(&params.fallback_address).await);
        }
    }

    Ok(())
}
