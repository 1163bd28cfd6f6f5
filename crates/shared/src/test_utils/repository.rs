use crate::error::CommonError;
use crate::libsql::{Connection, Migrations, merge_nested_migrations, run_migrations};

/// Fresh `:memory:` database with the given migration sets applied.
pub async fn setup_in_memory_database<'a>(
    migrations: Vec<Migrations<'a>>,
) -> Result<(libsql::Database, Connection), CommonError> {
    let db = libsql::Builder::new_local(":memory:").build().await?;
    let conn = Connection(db.connect()?);

    conn.execute("PRAGMA foreign_keys = ON", ()).await?;

    let migrations_to_run = merge_nested_migrations(migrations);
    run_migrations(&conn, &migrations_to_run).await?;

    Ok((db, conn))
}
