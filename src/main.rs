mod app;
mod cli;

use clap::Parser;
use cli::{Cli, Command, RunArgs};

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let Command::Run(args) = cli.command.unwrap_or(Command::Run(RunArgs::default()));
    cmd_run(args)
}

fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let _guard = init_logging(&args);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let application = app::Application::build(&args)?;
        application.serve().await
    })
}

fn init_logging(args: &RunArgs) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if args.log_to_file {
        let appender =
            tracing_appender::rolling::daily(std::path::Path::new(&args.data_dir), "relay.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}
