#[tokio::main]
async fn main() {
    if let Err(e) = tandem::server::run().await {
        tandem::tlog_crit!("tandem-relay: {}", e);
        std::process::exit(1);
    }
}
