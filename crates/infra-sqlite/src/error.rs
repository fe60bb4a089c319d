// sqlx::Error -> AppError
//
// Lives here rather than as a From impl in core because of orphan rules.

use crashmon_core::error::AppError;

/// Convert a driver error, keeping the SQLite result code in the message
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                let code_str = code.as_ref();

                // SQLite error codes: https://www.sqlite.org/rescode.html
                match code_str {
                    // UNIQUE / PRIMARY KEY constraint failed
                    "2067" | "1555" => AppError::DuplicateJob(db_err.message().to_string()),
                    "5" => AppError::Database(format!(
                        "Database locked (SQLITE_BUSY): {}",
                        db_err.message()
                    )),
                    "13" => AppError::Database(format!("Database full: {}", db_err.message())),
                    _ => AppError::Database(format!(
                        "Database error [{}]: {}",
                        code_str,
                        db_err.message()
                    )),
                }
            } else {
                AppError::Database(format!("Database error: {}", db_err.message()))
            }
        }
        sqlx::Error::RowNotFound => AppError::Database("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => {
            AppError::Database(format!("Column not found: {}", col))
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            AppError::Connection(err.to_string())
        }
        _ => AppError::Database(err.to_string()),
    }
}

/// Whether the error is a plain SQLITE_ERROR (bad statement, missing
/// table, no open transaction); busy, locked and I/O failures are not
pub(crate) fn is_statement_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("1"),
        _ => false,
    }
}
