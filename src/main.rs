#[tokio::main]
async fn main() -> anyhow::Result<()> {
    messaging_core::run().await
}
