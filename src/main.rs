#[tokio::main]
async fn main() -> eyre::Result<()> {
    taskworker::run().start().await
}
