use std::time::Duration;
use futures::StreamExt;
use pgpipe::{Config, Connection, Result, Subscriber};

pub async fn main() -> Result<()> {
    let subscriber = Subscriber::connect_with(Config::from_env(), |attempt| {
        (attempt <= 5).then(|| Duration::from_millis(100 * u64::from(attempt)))
    }).await?;

    let mut jobs = subscriber.channel("jobs").await?;

    let conn = Connection::connect_env().await?;
    conn.query("NOTIFY jobs, 'first'").await?;
    conn.query("SELECT pg_notify('jobs', 'second')").await?;

    assert_eq!(jobs.next().await.as_deref(), Some("first"));
    assert_eq!(jobs.next().await.as_deref(), Some("second"));

    subscriber.close();
    assert_eq!(jobs.next().await, None);

    conn.close();
    Ok(())
}
