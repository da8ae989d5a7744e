use gcounter_cluster::{EmergencyPersistence, PersistentGCounter};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "demo_node=info,gcounter_cluster=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let a = PersistentGCounter::new("a", "a.gcounter");
    let b = PersistentGCounter::new("b", "b.gcounter");
    a.increment();
    b.increment();

    EmergencyPersistence::global().add_for_persistence(Arc::new(a));
    EmergencyPersistence::global().add_for_persistence(Arc::new(b));
    info!("added 2 counters to persist in case of signals. Press Ctrl+C to persist and exit");
    EmergencyPersistence::global()
        .persist_and_exit_on_signal()
        .await;
}
