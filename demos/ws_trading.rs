//! Authenticate with `BFX_API_KEY`/`BFX_API_SECRET`, place a small limit
//! order and cancel it again.
//!
//! Run with: `cargo run --example ws_trading`

use bitfinex_ws_client::{AuthArgs, Manager, ManagerConfig, OrderPayload, PoolEvent};
use rust_decimal::Decimal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let _ = dotenv::dotenv();

    let auth = AuthArgs::try_from_env().expect("BFX_API_KEY and BFX_API_SECRET must be set");
    let manager = Manager::new(ManagerConfig::builder().auth(auth).build());
    let mut events = manager.events();

    manager.open_connection().await?;
    loop {
        match events.recv().await? {
            PoolEvent::AuthSuccess { .. } => break,
            PoolEvent::AuthError { error, .. } => {
                eprintln!("auth failed: {error}");
                return Ok(());
            }
            _ => {}
        }
    }

    // A limit order far below market so it rests on the book.
    let order = OrderPayload::new("EXCHANGE LIMIT", "tBTCUSD", Decimal::new(1, 3))
        .with_price(Decimal::new(1000, 0));
    let confirmed = manager.submit_order(order).await?;
    println!("order placed: {confirmed}");

    let order_id = confirmed[0].as_u64().expect("order id in confirmation");
    let cancelled = manager.cancel_order(order_id).await?;
    println!("order cancelled: {cancelled}");

    manager.close().await?;
    Ok(())
}
