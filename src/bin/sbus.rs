//! sbus: command-line client for the sbus service bus
//!
//! ## Commands
//! - `send <routing-key> <request-body>` (default): publish a command and
//!   print its reply, or publish an event with `--event`
//! - `register <name>`: mint a signing identity and print its exports
//! - `config`: pull broker URLs for `--env` from AWS Secrets Manager
//!
//! ## Configuration
//! - `~/.sbus/config.yml` (or `SBUS_CONFIG`)
//! - `SBUS_USER`, `SBUS_<ENV>_PRIVATE_KEY`, `SBUS_AMQP_<ENV>_URL`, `SBUS_KAFKA_<ENV>_URL`
//! - `SBUS_LOG`: log filter (default: info), logs go to stderr

use std::io::Write;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::{error, warn};

use sbus_cli::config::{self, AppConfig, EnvironmentName, ProcessEnv};
use sbus_cli::dispatch::{Dispatcher, ExitOutcome, SendRequest};
use sbus_cli::envelope::Message;
use sbus_cli::registration::{
    export_lines, ConsulPublisher, Identity, IdentityPublisher, IdentityRecord,
    DEFAULT_IDENTITIES_PATH, DEFAULT_PUBLIC_KEY_PATH,
};
use sbus_cli::utils::bootstrap::init_tracing;
use sbus_cli::TransportMode;

/// Send commands and events to sbus services
#[derive(Parser, Debug)]
#[command(name = "sbus", version)]
#[command(about = "Command-line client for the sbus service bus")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Environment name, selects credentials and broker URLs
    #[arg(long, global = true, default_value = EnvironmentName::LOCAL)]
    env: String,

    #[command(subcommand)]
    command: Option<Command>,

    /// `send` arguments given without the subcommand name
    #[command(flatten)]
    default_send: DefaultSendArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a command (and wait for its reply) or an event
    Send(SendArgs),

    /// Register a new user
    Register(RegisterArgs),

    /// Fetch broker URLs for --env from AWS Secrets Manager into the config file
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Routing key of the target handler
    routing_key: String,

    /// JSON request body
    request_body: String,

    #[command(flatten)]
    options: SendOptions,
}

#[derive(Args, Debug)]
struct DefaultSendArgs {
    /// Routing key of the target handler
    routing_key: Option<String>,

    /// JSON request body
    request_body: Option<String>,

    #[command(flatten)]
    options: SendOptions,
}

#[derive(Args, Debug, Clone, Copy)]
struct SendOptions {
    /// Publish as an event; no reply is awaited
    #[arg(long)]
    event: bool,

    /// rabbitmq, kafka, or all (rabbitmq with kafka fallback)
    #[arg(long, default_value = "rabbitmq")]
    transport: TransportMode,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    /// Name of the user
    name: String,

    /// Group for the user (repeatable)
    #[arg(long = "group")]
    groups: Vec<String>,

    /// Consul address to publish the identity to
    #[arg(long = "save-to-consul")]
    consul: Option<String>,

    /// Consul KV prefix for public keys
    #[arg(long, default_value = DEFAULT_PUBLIC_KEY_PATH)]
    public_key_path: String,

    /// Consul KV prefix for identities
    #[arg(long, default_value = DEFAULT_IDENTITIES_PATH)]
    identities_path: String,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Exact Secrets Manager key holding the AMQP URL
    #[arg(long)]
    sm_amqp_key: Option<String>,

    /// Exact Secrets Manager key holding the Kafka URL
    #[arg(long)]
    sm_kafka_key: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let env = EnvironmentName::new(&cli.env);

    match cli.command {
        Some(Command::Send(args)) => {
            send(&env, args.routing_key, args.request_body, args.options).await
        }
        Some(Command::Register(args)) => register(&env, args).await,
        Some(Command::Config(args)) => fetch_config(&env, args).await,
        None => match (cli.default_send.routing_key, cli.default_send.request_body) {
            (Some(routing_key), Some(request_body)) => {
                send(&env, routing_key, request_body, cli.default_send.options).await
            }
            _ => Cli::command()
                .error(
                    ErrorKind::MissingRequiredArgument,
                    "<ROUTING_KEY> and <REQUEST_BODY> are required",
                )
                .exit(),
        },
    }
}

async fn send(
    env: &EnvironmentName,
    routing_key: String,
    request_body: String,
    options: SendOptions,
) -> ExitCode {
    let app_config = load_config_or_default();
    let credentials = app_config.resolve(env, &ProcessEnv);

    let message = if options.event {
        Message::event(routing_key, request_body)
    } else {
        Message::command(routing_key, request_body)
    };
    let request = SendRequest {
        message,
        mode: options.transport,
    };

    let dispatcher = Dispatcher::from_credentials(&credentials);
    let mut stdout = std::io::stdout();
    let outcome = dispatcher.send(&request, &mut stdout).await;
    flush_output(&mut stdout);
    outcome.into()
}

/// Flush printed replies, logging rather than dropping a failure.
fn flush_output<W: Write>(out: &mut W) -> bool {
    match out.flush() {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Failed to flush reply output");
            false
        }
    }
}

fn load_config_or_default() -> AppConfig {
    let loaded = config::config_path(&ProcessEnv).and_then(|path| AppConfig::load(&path));
    match loaded {
        Ok(app_config) => app_config,
        Err(e) => {
            warn!(error = %e, "Could not load config, using defaults");
            AppConfig::default()
        }
    }
}

async fn register(env: &EnvironmentName, args: RegisterArgs) -> ExitCode {
    let identity = Identity::generate();

    if let Some(address) = args.consul.as_deref().filter(|a| !a.is_empty()) {
        let publisher = ConsulPublisher::new(address, env.clone())
            .with_public_key_path(args.public_key_path)
            .with_identities_path(args.identities_path);
        let record = IdentityRecord::new(args.name.clone(), &identity, args.groups);

        if let Err(e) = publisher.publish(&record).await {
            error!(error = %e, "Failed to publish identity");
            return ExitOutcome::Failure.into();
        }
    }

    let mut stdout = std::io::stdout().lock();
    for line in export_lines(&args.name, env, &identity) {
        if let Err(e) = writeln!(stdout, "{}", line) {
            error!(error = %e, "Failed to write exports");
            return ExitOutcome::Failure.into();
        }
    }
    ExitOutcome::Success.into()
}

#[cfg(feature = "aws")]
async fn fetch_config(env: &EnvironmentName, args: ConfigArgs) -> ExitCode {
    use sbus_cli::secrets::{SecretsLookup, AMQP_KEY_SUFFIX, KAFKA_KEY_SUFFIX};

    let result = async {
        let lookup = SecretsLookup::connect(env.clone(), &ProcessEnv).await?;
        let amqp_url = lookup
            .fetch(args.sm_amqp_key.as_deref(), AMQP_KEY_SUFFIX)
            .await?;
        let kafka_url = lookup
            .fetch(args.sm_kafka_key.as_deref(), KAFKA_KEY_SUFFIX)
            .await?;
        Ok::<_, Box<dyn std::error::Error>>((amqp_url, kafka_url))
    }
    .await;

    let (amqp_url, kafka_url) = match result {
        Ok(urls) => urls,
        Err(e) => {
            error!(error = %e, "Failed to read broker URLs from Secrets Manager");
            return ExitOutcome::Failure.into();
        }
    };

    // The file is rewritten as-is; environment overrides never leak into it
    let saved = config::config_path(&ProcessEnv).and_then(|path| {
        let mut app_config = AppConfig::load(&path)?;
        app_config.set_amqp_url(env, amqp_url);
        app_config.set_kafka_url(env, kafka_url);
        app_config.save(&path)?;
        Ok(path)
    });

    match saved {
        Ok(path) => {
            tracing::info!(path = %path.display(), env = %env, "Saved broker URLs");
            ExitOutcome::Success.into()
        }
        Err(e) => {
            error!(error = %e, "Failed to save config");
            ExitOutcome::Failure.into()
        }
    }
}

#[cfg(not(feature = "aws"))]
async fn fetch_config(_env: &EnvironmentName, _args: ConfigArgs) -> ExitCode {
    error!("sbus was built without the aws feature");
    ExitOutcome::Failure.into()
}
