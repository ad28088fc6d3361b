//! Stream Demo - Entry Point

#[tokio::main]
async fn main() -> eyre::Result<()> {
    stream_demo::run().await
}
