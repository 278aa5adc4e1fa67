use pgpipe::{Connection, Result, collector};

pub async fn main() -> Result<()> {
    let conn = Connection::connect_env().await?;

    conn.query("CREATE TEMP TABLE pipeline(id int4, name text)").await?;

    let stmt = conn.prepare("INSERT INTO pipeline(id, name) VALUES($1, $2)").await?;

    // every command is written before the first result arrives
    let inserts = (0..16i32)
        .map(|i| stmt.execute((i, format!("name-{i}"))))
        .collect::<Vec<_>>();

    for insert in inserts {
        assert_eq!(insert.await?.rows_affected(), 1);
    }

    let batch = stmt.batch((16..32i32).map(|i|(i, format!("name-{i}")))).await?;
    assert_eq!(batch.rows_affected(), 16);

    let count = conn.prepared_query_with(
        "SELECT id FROM pipeline",
        (),
        collector::fold(0usize, |n, _row| {
            *n += 1;
            Ok(())
        }),
    ).await?;
    assert_eq!(*count.rows(), 32);

    let result = conn.query("SELECT 1; SELECT 2; UPDATE pipeline SET name = 'x'").await?;
    assert_eq!(result.len(), 3);
    assert_eq!(result.last().map(|r|r.rows_affected()), Some(32));

    conn.close();
    Ok(())
}
