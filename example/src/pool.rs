use pgpipe::{Pool, PoolConfig, Result};
use tracing::{Instrument, trace_span};

pub async fn main() -> Result<()> {
    let pool = Pool::connect_with(PoolConfig::from_env().max_connection(4)).await?;

    let handles = (0..48i32).map(|i| {
        let pool = pool.clone();
        tokio::spawn(async move {
            let conn = pool.acquire().await?;
            if i % 6 == 0 {
                conn.query("SELECT foo").await?;
            } else {
                conn.prepared_query("SELECT $1::int4", (i,)).await?;
            }
            Ok::<_, pgpipe::Error>(())
        }.instrument(trace_span!("task", i)))
    });

    for h in handles {
        if let Err(err) = h.await.unwrap() {
            tracing::warn!("{err}");
        }
    }

    Ok(())
}
