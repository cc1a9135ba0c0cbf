use clap::Parser;

#[tokio::main]
async fn main() {
    trellis_cli::init_tracing();
    let cli = trellis_cli::Cli::parse();
    if let Err(error) = trellis_cli::run(cli).await {
        eprintln!("trellis: {error:#}");
        std::process::exit(1);
    }
}
