//! `shelf`: keep a directory of comics in canonical `{key}.zip` form.

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result, miette};
use shelf_config::Config;
use shelf_library::{Import, Library};
use shelf_store::{ContentKey, Database, Repository, StoreHandle};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "shelf", version, about = "Comic archive library manager")]
struct Cli {
    /// Configuration file, merged over the platform config directory.
    #[arg(long, short, global = true, env = "SHELF_CONFIG")]
    config: Option<PathBuf>,

    /// Log debug output.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Take ownership of archives or page directories.
    Import {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Remove a comic and delete its file.
    Remove { key: String },
    /// Move the whole library to a new root directory.
    Relocate { root: PathBuf },
    /// List every comic.
    List,
    /// Finish moves interrupted by a previous run.
    Resume,
}

/// Render an error tree for the terminal.
fn report(err: impl Debug) -> miette::Report {
    miette!("{err:?}")
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info,shelf=debug,shelf_library=debug,shelf_storage=debug,shelf_store=debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = Config::load(cli.config.as_deref()).map_err(report)?;
    let database = Database::connect(&config.database).await.map_err(report)?;
    let store: StoreHandle = Arc::new(Repository::from(&database));
    let library = Library::open(&config, store);
    library.start().await.map_err(report)?;

    let outcome = run(&library, &mut config, cli.command).await;
    // Whatever happened, let running jobs finish so nothing is left half-written.
    tokio::select! {
        () = library.wait_idle() => {},
        signal = tokio::signal::ctrl_c() => {
            signal.into_diagnostic()?;
            tracing::warn!("interrupted; unfinished moves resume on the next run");
        },
    }
    database.close().await;
    outcome
}

async fn run(library: &Library, config: &mut Config, command: Command) -> Result<()> {
    match command {
        Command::Import { paths } => {
            for path in paths {
                match library.import(&path).await {
                    Ok(Import::AlreadyExists(key)) => println!("{key}\talready in library\t{}", path.display()),
                    Ok(Import::Moved(key) | Import::Queued(key)) => println!("{key}\timported\t{}", path.display()),
                    Err(e) => tracing::error!(path = %path.display(), error = ?e, "import failed"),
                }
            }
        },
        Command::Remove { key } => {
            let key: ContentKey = key.parse().map_err(report)?;
            if !library.remove(&key).await.map_err(report)? {
                return Err(miette!("no comic with key {key}"));
            }
        },
        Command::Relocate { root } => {
            let root = std::path::absolute(root).into_diagnostic()?;
            let requested = library.relocate(&root).await.map_err(report)?;
            config.set_library(&root).map_err(report)?;
            println!("moving {requested} comics to {}", root.display());
        },
        Command::List => {
            for comic in library.list().await.map_err(report)? {
                println!("{}\t{}", comic.key, comic.title);
            }
        },
        Command::Resume => {
            // Recovery already ran during startup; waiting is all that's left.
            let running = library.supervisor().running();
            println!("resuming {} moves", running.len());
        },
    }
    Ok(())
}
