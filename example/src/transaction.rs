use pgpipe::{Connection, ErrorKind, Result};

pub async fn main() -> Result<()> {
    let conn = Connection::connect_env().await?;
    conn.query("CREATE TEMP TABLE tx(id int4 PRIMARY KEY)").await?;

    let tx = conn.begin().await?;
    tx.prepared_query("INSERT INTO tx(id) VALUES($1)", (1i32,)).await?;
    tx.commit().await?;

    {
        let tx = conn.begin().await?;
        tx.prepared_query("INSERT INTO tx(id) VALUES($1)", (2i32,)).await?;
        // rolled back on drop
    }

    let tx = conn.begin().await?;
    let _ = tx.prepared_query("INSERT INTO tx(id) VALUES($1)", (1i32,)).await;
    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TransactionRolledBack(_)));

    let ids = conn.prepared_query("SELECT id FROM tx", ()).await?;
    assert_eq!(ids.rows().len(), 1);

    conn.close();
    Ok(())
}
