use std::path::PathBuf;

use clap::Parser;
use indicatif::{MultiProgress, ProgressDrawTarget};
use once_cell::sync::Lazy;
use tracing_subscriber::{filter::LevelFilter, util::SubscriberInitExt, EnvFilter};

mod commands;
mod reporter;
mod writer;

/// Returns a global instance of [`indicatif::MultiProgress`].
///
/// Log lines are written through the same instance so they do not tear
/// progress bars that are being drawn.
pub fn global_multi_progress() -> MultiProgress {
    static GLOBAL_MP: Lazy<MultiProgress> = Lazy::new(|| {
        let mp = MultiProgress::new();
        mp.set_draw_target(ProgressDrawTarget::stderr_with_hz(20));
        mp
    });
    GLOBAL_MP.clone()
}

/// Share versioned data packages through a parcel registry
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The directory of the local package store
    #[clap(long, global = true, env = "PARCEL_STORE_DIR")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Upload a locally installed package and move its latest tag
    Push(commands::push::Opt),

    /// Download packages from the registry
    Install(commands::install::Opt),

    /// Show the push history of a package
    Log(commands::log::Opt),

    /// List, add or remove tags
    #[command(subcommand)]
    Tag(commands::tag::Command),

    /// List or add versions
    #[command(subcommand)]
    Version(commands::version::Command),

    /// List the locally installed packages
    Ls,

    /// Remove the local record of a package
    Rm(commands::remove::Opt),
}

/// Entry point of the `parcel` cli.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer::IndicatifWriter::new(global_multi_progress()))
        .without_time()
        .finish()
        .try_init()?;

    let context = commands::Context::new(cli.store)?;
    match cli.command {
        Commands::Push(opt) => commands::push::push(&context, opt).await,
        Commands::Install(opt) => commands::install::install(&context, opt).await,
        Commands::Log(opt) => commands::log::log(&context, opt).await,
        Commands::Tag(command) => commands::tag::run(&context, command).await,
        Commands::Version(command) => commands::version::run(&context, command).await,
        Commands::Ls => commands::list::list(&context),
        Commands::Rm(opt) => commands::remove::remove(&context, opt),
    }
}
