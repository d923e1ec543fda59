use log::error;

#[tokio::main]
async fn main() {
    staged_net::init_tracing();

    if let Err(e) = staged_net::run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}
