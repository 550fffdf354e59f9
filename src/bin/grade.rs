use clap::Parser;

/// Grade a single submission and print the transcript.
#[derive(Debug, Parser)]
#[command(name = "autograder-grade", version)]
struct Cli {
    #[command(flatten)]
    config: autograder::ConfigArgs,
    #[command(flatten)]
    grade: autograder::GradeArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match autograder::run_grade(cli.config, cli.grade).await {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(2),
        Err(e) => {
            eprintln!("autograder-grade fatal: {e:#}");
            std::process::exit(1);
        }
    }
}
