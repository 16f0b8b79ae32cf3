use std::sync::Arc;

use stormq::broker::{Dispatcher, Engine};
use stormq::config::load_config;
use stormq::persistence::MessageStore;
use stormq::transport::websocket::start_websocket_server;
use stormq::utils::logging;

#[tokio::main]
async fn main() {
    logging::init("info");

    let config = load_config().expect("Failed to load configuration");
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let store = Arc::new(MessageStore::open(&config.store.path).expect("Failed to open message store"));
    let engine = Arc::new(Engine::new(store));
    let dispatcher = Arc::new(Dispatcher::new(engine));

    start_websocket_server(&addr, dispatcher, config.broker.max_connections).await;
}
