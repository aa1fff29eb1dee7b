use stampede_core::config::Config;
use stampede_core::controller::Controller;
use stampede_core::listener::LogListener;
use stampede_core::process;
use stampede_core::registry::Registry;
use stampede_core::repository::is_in_process;
use stampede_core::worker::{self, ProcessLauncher};

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Random testing session controller", long_about = None)]
struct Cli {
    /// Configuration files describing the SUTs and fuzz jobs, merged in order.
    #[clap(value_parser)]
    config: Vec<PathBuf>,
    /// Set an option: SECT:OPT=VAL.
    #[clap(short = 'D', value_name = "SECT:OPT=VAL")]
    define: Vec<String>,
    /// Remove a section or an option: SECT[:OPT].
    #[clap(short = 'U', value_name = "SECT[:OPT]")]
    undefine: Vec<String>,
    /// Stop scheduling fuzz jobs after this many rounds over all of them.
    #[clap(long, value_name = "N")]
    max_cycles: Option<u64>,
    /// Validate the stored issues of a SUT (of all SUTs without a name) before fuzzing.
    #[clap(long, value_name = "NAME", num_args = 0..=1)]
    validate: Option<Option<String>>,
    /// Validate the stored issues of every SUT before fuzzing.
    #[clap(long)]
    validate_all: bool,
    /// Reduce the unreduced issues of a SUT (of all SUTs without a name) before fuzzing.
    #[clap(long, value_name = "NAME", num_args = 0..=1)]
    reduce: Option<Option<String>>,
    /// Reduce the unreduced issues of every SUT before fuzzing.
    #[clap(long)]
    reduce_all: bool,
    /// Print the effective configuration and exit.
    #[clap(long)]
    show_config: bool,
    /// Log filter used when RUST_LOG is not set.
    #[clap(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
    /// Run one job described on stdin and report on stdout.
    #[clap(long, hide = true)]
    worker: bool,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config, anyhow::Error> {
    let mut config = Config::load(&cli.config)?;
    for definition in &cli.define {
        config.define(definition)?;
    }
    for undefinition in &cli.undefine {
        config.undefine(undefinition)?;
    }
    Ok(config)
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let registry = Arc::new(Registry::with_builtins());

    if cli.worker {
        return worker::serve(std::io::stdin().lock(), std::io::stdout(), registry);
    }

    let config = load_config(&cli)?;
    if cli.show_config {
        print!("{}", config.to_toml_string());
        return Ok(());
    }

    let session = config.session()?;
    let mut controller = Controller::new(config, registry)?.with_max_cycles(cli.max_cycles);
    if !is_in_process(&session.db_uri) {
        let program = std::env::current_exe().context("Cannot locate the worker executable")?;
        let args = vec![
            "--worker".to_string(),
            "--log-level".to_string(),
            cli.log_level.clone(),
        ];
        controller = controller.with_launcher(Box::new(ProcessLauncher::new(program, args)))?;
    }

    controller.add_listener(Box::new(LogListener));

    let handle = controller.handle();
    if cli.validate_all {
        handle.validate_all(None);
    } else if let Some(sut) = &cli.validate {
        handle.validate_all(sut.as_deref());
    }
    if cli.reduce_all {
        handle.reduce_all(None);
    } else if let Some(sut) = &cli.reduce {
        handle.reduce_all(sut.as_deref());
    }

    process::install_interrupt_handler();
    controller.run()?;
    info!("bye");
    Ok(())
}
