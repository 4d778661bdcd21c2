use chainwatch::cli::{self, Cli};
use clap::Parser;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging is set up before forking so daemon output lands in its stderr file.
    cli::init_logging(cli.debug);

    if cli.is_daemon() {
        cli::daemonize(&cli.data_dir())?;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(cli::run_cli(cli))
}
