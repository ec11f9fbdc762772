//! Tandem CLI - run functions on pooled worker threads and processes.

mod colors;
mod run;

use clap::{Parser, Subcommand};
use tandem_core::Adapter;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Run functions on pooled worker threads and processes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a function of a built-in module on a worker
    Run {
        /// Module to load
        module: String,

        /// Arguments as JSON; an array is spread into separate arguments
        args: Option<String>,

        /// Exported function to call
        #[arg(long = "fn", default_value = "default")]
        function: String,

        /// Terminate the worker after this many milliseconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Keep the worker in the pool after the call
        #[arg(long)]
        keep_alive: bool,

        /// Worker kind: thread or process
        #[arg(long, default_value = "thread")]
        adapter: Adapter,

        /// Print yielded values as they arrive
        #[arg(long)]
        iterate: bool,

        /// Upper bound on live workers
        #[arg(long)]
        max_workers: Option<usize>,

        /// Number of times to run the call concurrently
        #[arg(long, default_value = "1")]
        repeat: usize,
    },

    /// List built-in modules and their exports
    Modules,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
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
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Helper to format tandem-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(tandem_err) = err.downcast_ref::<tandem_core::Error>() {
            anyhow::anyhow!("{}", tandem_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Run {
            module,
            args,
            function,
            timeout,
            keep_alive,
            adapter,
            iterate,
            max_workers,
            repeat,
        } => {
            let request = run::Request {
                module,
                args,
                function,
                timeout,
                keep_alive,
                adapter,
                iterate,
                max_workers,
                repeat,
            };
            run::execute(request).await.map_err(format_error)?;
        }

        Commands::Modules => list_modules(),
    }

    Ok(())
}

fn list_modules() {
    let modules = tandem_worker::builtin_modules();
    for name in modules.names() {
        let exports = modules
            .get(name)
            .map(|module| module.exports().join(", "))
            .unwrap_or_default();
        println!("{}{}{} {}{}{}", colors::BOLD, name, colors::RESET, colors::DIM, exports, colors::RESET);
    }
}
