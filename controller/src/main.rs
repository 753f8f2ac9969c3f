mod counters;
mod host;
mod shelly;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
