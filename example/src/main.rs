use tracing::{Instrument, trace_span};
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use pgpipe::Result;

mod connection;
mod pipeline;
mod stream;
mod transaction;
mod pubsub;
mod pool;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::Registry::default()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    connection::main().instrument(trace_span!("connection")).await?;
    pipeline::main().instrument(trace_span!("pipeline")).await?;
    stream::main().instrument(trace_span!("stream")).await?;
    transaction::main().instrument(trace_span!("transaction")).await?;
    pubsub::main().instrument(trace_span!("pubsub")).await?;
    pool::main().instrument(trace_span!("pool")).await?;

    Ok(())
}
