#[tokio::main]
async fn main() -> anyhow::Result<()> {
    complaints_indexer::run().await
}
