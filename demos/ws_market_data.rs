//! Subscribe to public market data and print events as they arrive.
//!
//! Run with: `cargo run --example ws_market_data`

use bitfinex_ws_client::{Manager, ManagerConfig, PoolEvent, flags};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let manager = Manager::new(ManagerConfig::default());
    let mut events = manager.events();

    manager.open_connection().await?;
    manager.enable_flag(flags::OB_CHECKSUM).await?;

    manager.subscribe_trades("tBTCUSD").await?;
    manager.subscribe_ticker("tBTCUSD").await?;
    manager.subscribe_book("tBTCUSD").await?;

    while let Ok(event) = events.recv().await {
        match event {
            PoolEvent::Subscribed { chan_id, channel, .. } => {
                println!("subscribed {chan_id}: {} {:?}", channel.kind(), channel.symbol());
            }
            PoolEvent::Data { event, .. } => {
                println!("{}: {}", event.kind, event.requested);
            }
            PoolEvent::BookChecksum { checksum, .. } => {
                println!("book checksum: {checksum}");
            }
            PoolEvent::ConnectionClosed { id } => {
                println!("connection {id} closed");
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
