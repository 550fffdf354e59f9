use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "autograder", version, about = "Autograder API server")]
struct Cli {
    #[command(flatten)]
    config: autograder::ConfigArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(e) = autograder::run(cli.config).await {
        eprintln!("autograder fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
