use futures::StreamExt;
use pgpipe::{Connection, Result};

pub async fn main() -> Result<()> {
    let conn = Connection::connect_env().await?;

    // portals only outlive a `Sync` inside a transaction
    let tx = conn.begin().await?;
    let stmt = tx.prepare("SELECT generate_series(1, $1::int4)").await?;

    let mut cursor = stmt.cursor((100i32,))?;
    while cursor.has_more() {
        let chunk = cursor.read(30).await?;
        tracing::info!("read {} rows, suspended={}", chunk.rows().len(), chunk.is_suspended());
    }

    let mut stream = stmt.stream(25, (100i32,))?;
    let mut sum = 0i64;
    while let Some(row) = stream.next().await {
        sum += i64::from(row?.try_get::<_, i32>(0)?);
    }
    assert_eq!(sum, 5050);

    stmt.close().await?;
    tx.commit().await?;
    conn.close();
    Ok(())
}
