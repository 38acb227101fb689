use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rebullos")]
#[command(about = "Telegram bot for confirmation-gated OS reinstalls", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the bot (long-polls Telegram). Needs TG_TOKEN and ADMIN_ID, from the environment or the config file.
    Run {
        /// Config file path (default: REBULLOS_CONFIG_PATH or ~/.rebullos/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Print the command the bot would propose for the given /reinstall arguments, without running it.
    Render {
        /// Config file path (default: REBULLOS_CONFIG_PATH or ~/.rebullos/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Arguments passed to the reinstall script, verbatim.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("rebullos {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Run { config }) => {
            if let Err(e) = run_bot(config).await {
                log::error!("bot failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Render { config, args }) => {
            if let Err(e) = run_render(config, args) {
                log::error!("render failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_bot(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    log::info!("loaded config from {}", path.display());
    lib::bot::run_bot(config).await
}

fn run_render(config_path: Option<std::path::PathBuf>, args: Vec<String>) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let settings = lib::engine::EngineSettings::from_config(&config)?;
    let builder = lib::command::CommandBuilder::new(settings.elevation);
    let command = builder.build(&settings.script_path, args);
    println!("{}", command.render());
    Ok(())
}
