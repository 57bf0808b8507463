#[tokio::main]
async fn main() -> anyhow::Result<()> {
    van_sales_lib::run().await
}
