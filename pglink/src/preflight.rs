use pg_escape::quote_literal;
use tracing::info;

use crate::bail;
use crate::client::{self, PgControlConnection};
use crate::error::{ErrorKind, LinkError, LinkResult};

/// Minimum `server_version_num` this tool manages (PostgreSQL 10, the first
/// release with native logical replication).
pub const MIN_SERVER_VERSION_NUM: u32 = 100_000;

/// Role whose membership stands in for superuser on managed deployments.
const ELEVATED_ROLE: &str = "rds_superuser";

/// Fatal preconditions, checked once per connection before any registry
/// operation and never retried automatically.
pub async fn ensure_manageable(conn: &PgControlConnection) -> LinkResult<()> {
    if !has_elevated_privileges(conn).await? {
        bail!(
            ErrorKind::InsufficientPrivilege,
            "connected role lacks the privileges required to manage replication",
            format!(
                "{}: superuser or {ELEVATED_ROLE} membership is required",
                conn.display_name()
            )
        );
    }

    let version = server_version_num(conn).await?;
    if version < MIN_SERVER_VERSION_NUM {
        bail!(
            ErrorKind::UnsupportedServerVersion,
            "PostgreSQL 10 or higher is required",
            format!(
                "{} reports server_version_num {version}",
                conn.display_name()
            )
        );
    }

    info!("{} passed preflight checks", conn.display_name());

    Ok(())
}

/// Whether the connected role is a superuser or a member of the elevated role.
pub async fn has_elevated_privileges(conn: &PgControlConnection) -> LinkResult<bool> {
    if is_superuser(conn).await? {
        return Ok(true);
    }

    member_of(conn, ELEVATED_ROLE).await
}

async fn is_superuser(conn: &PgControlConnection) -> LinkResult<bool> {
    let rows = conn
        .query("SELECT usesuper FROM pg_user WHERE usename = CURRENT_USER")
        .await?;

    match rows.first() {
        Some(row) => client::row_bool(row, "usesuper", "pg_user"),
        None => Ok(false),
    }
}

/// Whether the connected role is a direct member of `role`.
///
/// A role that does not exist on this instance simply yields no membership.
pub async fn member_of(conn: &PgControlConnection, role: &str) -> LinkResult<bool> {
    let query = format!(
        "SELECT count(*) AS member_count \
         FROM pg_roles granted \
         JOIN pg_auth_members m ON m.roleid = granted.oid \
         JOIN pg_roles member ON member.oid = m.member \
         WHERE granted.rolname = {} AND member.rolname = CURRENT_USER",
        quote_literal(role)
    );
    let rows = conn.query(&query).await?;
    let row = rows
        .first()
        .ok_or_else(|| crate::link_error!(ErrorKind::QueryFailed, "membership query returned no row"))?;
    let count: u64 = client::row_value(row, "member_count", "pg_auth_members")?;

    Ok(count > 0)
}

/// Reads the server's numeric version.
pub async fn server_version_num(conn: &PgControlConnection) -> LinkResult<u32> {
    let rows = conn.query("SHOW server_version_num").await?;
    let row = rows.first().ok_or_else(|| {
        crate::link_error!(ErrorKind::QueryFailed, "server_version_num query returned no row")
    })?;

    client::row_value(row, "server_version_num", "server_version_num")
}
