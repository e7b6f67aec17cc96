use syncdeck::{cli, logging, run};

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("syncdeck error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> anyhow::Result<()> {
    let cli = cli::parse();
    logging::init_logging(cli.log_level.as_deref())?;
    run(cli).await
}
