use std::env::var;
use pgpipe::{Config, Connection, Result};

pub async fn main() -> Result<()> {
    let conn = Connection::connect(&var("DATABASE_URL").unwrap()).await?;
    conn.query("SELECT 1").await?;
    conn.close();
    conn.closed().await;

    let conn = Connection::connect_env().await?;
    tracing::info!(
        "server_version={:?} key={:?}",
        conn.parameter("server_version"),
        conn.backend_key(),
    );
    conn.close();

    let mut config = Config::from_env();
    config
        .set_pipelining_limit(4)
        .set_cache_prepared_statements(false)
        .set_application_name("pgpipe-example");
    let conn = Connection::connect_with(config).await?;

    conn.on_exception(|err| tracing::error!("connection failure: {err}"));
    conn.on_close(|| tracing::info!("connection closed"));

    let err = conn.query("").await.unwrap_err();
    tracing::info!("empty query: {err}");

    let err = conn.query("SELECT foo").await.unwrap_err();
    tracing::info!("database error: {err}");

    // connection is still usable after an error
    conn.query("SELECT 1").await?;
    conn.close();

    Ok(())
}
