// sqlx -> AppError conversion

use afterburn_core::error::AppError;

/// Convert a sqlx error to AppError, surfacing the SQLite result codes a
/// caller needs when deciding whether a failed commit is worth retrying.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                let code = code.as_ref();
                match code {
                    // SQLITE_CONSTRAINT_UNIQUE / SQLITE_CONSTRAINT_PRIMARYKEY
                    "2067" | "1555" => AppError::Database(format!(
                        "unique constraint violation: {} ({})",
                        db_err.message(),
                        code
                    )),
                    // SQLITE_CONSTRAINT_FOREIGNKEY
                    "787" | "3850" => AppError::Database(format!(
                        "foreign key constraint violation: {} ({})",
                        db_err.message(),
                        code
                    )),
                    // SQLITE_BUSY
                    "5" => {
                        AppError::Database(format!("database locked: {}", db_err.message()))
                    }
                    _ => AppError::Database(format!(
                        "database error [{}]: {}",
                        code,
                        db_err.message()
                    )),
                }
            } else {
                AppError::Database(format!("database error: {}", db_err.message()))
            }
        }
        sqlx::Error::RowNotFound => AppError::NotFound("row not found".to_string()),
        _ => AppError::Database(err.to_string()),
    }
}
