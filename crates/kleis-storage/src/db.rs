use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use sea_orm::{Database, DatabaseConnection, DbErr};

static CONNECTIONS: OnceLock<Mutex<HashMap<String, DatabaseConnection>>> = OnceLock::new();

/// One pooled connection per DSN for the whole process; adapters, the
/// proxy plane and the admin plane all share it.
pub async fn connect_shared(dsn: &str) -> Result<DatabaseConnection, DbErr> {
    let cache = CONNECTIONS.get_or_init(|| Mutex::new(HashMap::new()));

    if let Ok(guard) = cache.lock()
        && let Some(connection) = guard.get(dsn)
    {
        return Ok(connection.clone());
    }

    let connection = Database::connect(dsn).await?;
    if let Ok(mut guard) = cache.lock() {
        guard
            .entry(dsn.to_string())
            .or_insert_with(|| connection.clone());
    }
    Ok(connection)
}
