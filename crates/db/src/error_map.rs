use watchroom_common::Error;

/// Postgres unique_violation / MySQL duplicate entry.
const PG_UNIQUE_VIOLATION: &str = "23505";
const MYSQL_DUP_ENTRY: &str = "1062";

/// Postgres foreign_key_violation / MySQL no referenced row.
const PG_FK_VIOLATION: &str = "23503";
const MYSQL_FK_VIOLATION: &str = "1452";

/// Translates a raw `sqlx::Error` into a domain error, per the single
/// translation layer described for persistence errors: `NoRows` maps to
/// `NotFound`, unique/FK violation codes from either backend map to
/// `Conflict`/`NotFound`, everything else is logged and surfaced as
/// `Internal`.
pub fn map_sqlx_error(err: sqlx::Error, not_found_msg: &str, conflict_msg: &str) -> Error {
    match &err {
        sqlx::Error::RowNotFound => Error::NotFound(not_found_msg.to_string()),
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                if code == PG_UNIQUE_VIOLATION || code == MYSQL_DUP_ENTRY {
                    return Error::Conflict(conflict_msg.to_string());
                }
                if code == PG_FK_VIOLATION || code == MYSQL_FK_VIOLATION {
                    return Error::NotFound(not_found_msg.to_string());
                }
            }
            tracing::error!(error = %db_err, "database error");
            Error::internal(anyhow::anyhow!(err.to_string()))
        },
        other => {
            tracing::error!(error = %other, "database error");
            Error::internal(anyhow::anyhow!(other.to_string()))
        },
    }
}

/// Shorthand for call sites that never hit a conflict path (SELECT/UPDATE
/// on a primary key, not an INSERT).
pub fn map_sqlx_error_nf(err: sqlx::Error, not_found_msg: &str) -> Error {
    map_sqlx_error(err, not_found_msg, "")
}
