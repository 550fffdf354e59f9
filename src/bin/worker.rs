use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "autograder-worker", version, about = "Autograder scheduled task engine")]
struct Cli {
    #[command(flatten)]
    config: autograder::ConfigArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(e) = autograder::run_worker(cli.config).await {
        eprintln!("autograder-worker fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
