use eyre::Result;

mod channel;
mod cli;
pub(crate) mod config;
mod dump;
mod link;
mod reactor;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    cli::run().await
}
