use cosim_comms::cli::initialize_from_arguments;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("cosim-comms v{}", env!("CARGO_PKG_VERSION"));
    initialize_from_arguments().await
}
