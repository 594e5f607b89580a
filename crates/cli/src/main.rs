mod channel_commands;
mod console_host;
mod run_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    dingbot_config::DingbotConfig,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "dingbot", about = "dingbot: DingTalk Stream-mode channel runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to `logging.level`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of ./dingbot.toml and ~/.config/dingbot/).
    #[arg(long, global = true, env = "DINGBOT_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured accounts and log routed messages until Ctrl-C.
    Run {
        /// Only start these accounts (repeatable).
        #[arg(long)]
        account: Vec<String>,
        /// Reply to every message with its own text.
        #[arg(long, default_value_t = false)]
        echo: bool,
    },
    /// Show configured accounts and security warnings.
    Status,
    /// Send one message through the robot API.
    Send {
        #[arg(long)]
        account: Option<String>,
        /// `user:<id>`, `chat:<cid>` or a bare ID.
        #[arg(long)]
        to: String,
        #[arg(short, long)]
        message: String,
        /// Send as markdown with this title.
        #[arg(long)]
        markdown_title: Option<String>,
    },
    /// Print the DingTalk channel config JSON schema.
    Schema,
    /// Account configuration.
    Channels {
        #[command(subcommand)]
        action: channel_commands::ChannelAction,
    },
}

fn init_telemetry(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Channels { action } => {
            init_telemetry(cli.log_level.as_deref().unwrap_or("warn"), cli.json_logs);
            return channel_commands::handle_channels(action, cli.config.as_deref());
        },
        command => command,
    };

    let root = run_commands::load_root(cli.config.as_deref())?;
    let config = DingbotConfig::from_value(&root)?;
    init_telemetry(
        cli.log_level.as_deref().unwrap_or(&config.logging.level),
        cli.json_logs || config.logging.json,
    );

    match command {
        Commands::Run { account, echo } => {
            info!(version = env!("CARGO_PKG_VERSION"), "dingbot starting");
            run_commands::run(&root, &account, echo, config.channels.history_limit).await
        },
        Commands::Status => run_commands::status(&root),
        Commands::Send {
            account,
            to,
            message,
            markdown_title,
        } => {
            let account = run_commands::pick_account(&root, account)?;
            run_commands::send(&root, run_commands::SendArgs {
                account: &account,
                to: &to,
                message: &message,
                markdown_title: markdown_title.as_deref(),
            })
            .await
        },
        Commands::Schema => run_commands::schema(),
        Commands::Channels { .. } => Ok(()),
    }
}
