//! Cellar CLI - execute and cache Jupyter notebooks.

mod cache;
mod colors;
mod kernels;
mod report;
mod run;
mod settings;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cellar")]
#[command(about = "Execute Jupyter notebooks and cache their outputs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to ./cellar.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute notebooks
    Run {
        /// Notebook files or directories to search for .ipynb files
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Execution mode (off, force, auto, lazy, cache, inline)
        #[arg(short, long)]
        mode: Option<String>,

        /// Per-cell timeout in seconds (-1 for no limit)
        #[arg(long, allow_hyphen_values = true)]
        timeout: Option<i64>,

        /// Record cell errors and keep executing
        #[arg(long)]
        allow_errors: bool,

        /// Exit with an error if any notebook fails
        #[arg(long)]
        raise_on_error: bool,

        /// Include tracebacks in failure warnings
        #[arg(long)]
        show_traceback: bool,

        /// Execute in a temporary directory
        #[arg(long)]
        in_temp: bool,

        /// Cache directory
        #[arg(long)]
        cache_path: Option<PathBuf>,

        /// Where produced files are copied
        #[arg(long)]
        artifact_dir: Option<PathBuf>,

        /// Where failure tracebacks are written
        #[arg(long)]
        report_dir: Option<PathBuf>,

        /// Extra kernelspec directory (repeatable)
        #[arg(long = "kernel-path")]
        kernel_paths: Vec<PathBuf>,

        /// Glob of notebooks never to execute (repeatable)
        #[arg(long = "exclude")]
        exclude_patterns: Vec<String>,

        /// Directory document names are relative to (defaults to the current directory)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Write executed notebooks here instead of overwriting them
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Number of notebooks executed in parallel
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Print the statistics of the last run
    Report {
        /// Cache directory the statistics were stored in
        #[arg(long)]
        cache_path: Option<PathBuf>,
    },

    /// Inspect or clear the cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,

        /// Cache directory
        #[arg(long, global = true)]
        cache_path: Option<PathBuf>,
    },

    /// List installed kernels
    Kernels {
        /// Extra kernelspec directory (repeatable)
        #[arg(long = "kernel-path")]
        kernel_paths: Vec<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cache entries
    List,
    /// Remove all cache entries
    Clear,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            paths,
            mode,
            timeout,
            allow_errors,
            raise_on_error,
            show_traceback,
            in_temp,
            cache_path,
            artifact_dir,
            report_dir,
            kernel_paths,
            exclude_patterns,
            root,
            output_dir,
            jobs,
        } => {
            if let Some(mode) = mode {
                config.mode = mode.parse()?;
            }
            if let Some(timeout) = timeout {
                config.timeout = u64::try_from(timeout).ok();
            }
            config.allow_errors |= allow_errors;
            config.raise_on_error |= raise_on_error;
            config.show_traceback |= show_traceback;
            config.in_temp |= in_temp;
            config.cache_path = cache_path.unwrap_or(config.cache_path);
            config.artifact_dir = artifact_dir.or(config.artifact_dir);
            config.report_dir = report_dir.or(config.report_dir);
            // Flag directories are searched before configured ones
            config.kernel_paths = kernel_paths.into_iter().chain(config.kernel_paths).collect();
            config.exclude_patterns.extend(exclude_patterns);

            run::execute(
                config,
                run::RunOptions {
                    paths,
                    root,
                    output_dir,
                    jobs,
                },
            )?;
        }

        Commands::Report { cache_path } => {
            let cache_path = cache_path.unwrap_or(config.cache_path);
            report::execute(&cache_path)?;
        }

        Commands::Cache { action, cache_path } => {
            let cache_path = cache_path.unwrap_or(config.cache_path);
            match action {
                CacheAction::List => cache::list(&cache_path)?,
                CacheAction::Clear => cache::clear(&cache_path)?,
            }
        }

        Commands::Kernels { kernel_paths } => {
            let paths: Vec<PathBuf> = kernel_paths.into_iter().chain(config.kernel_paths).collect();
            kernels::execute(&paths);
        }
    }

    Ok(())
}
