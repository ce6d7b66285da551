use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use haven_core::types::PrincipalRole;

use crate::claims::Claims;
use crate::error::{AuthError, Result};

/// Maximum subject → id pairs kept in the in-process cache. Simple eviction:
/// when full, drop the oldest half.
const CACHE_MAX: usize = 256;

/// Local mirror of an authenticated identity.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub id: i64,
    pub subject: String,
    pub email: Option<String>,
    pub display_name: String,
    pub role: PrincipalRole,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Translates verified issuer claims into first-class local principals.
///
/// Hot path: every authenticated request calls resolve(). The subject → id
/// mapping is cached in memory to avoid a DB round-trip per request for
/// known principals.
pub struct PrincipalStore {
    db: Mutex<Connection>,
    cache: Mutex<HashMap<String, i64>>,
    cache_order: Mutex<Vec<String>>,
}

const SELECT_COLUMNS: &str =
    "id, subject, email, display_name, role, active, created_at, updated_at";

impl PrincipalStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
            cache: Mutex::new(HashMap::new()),
            cache_order: Mutex::new(Vec::new()),
        }
    }

    /// Resolve verified claims to a principal, auto-provisioning on first
    /// sight and refreshing stored fields when the claims changed.
    pub fn resolve(&self, claims: &Claims) -> Result<Principal> {
        let role = PrincipalRole::from_claim_roles(&claims.realm_access.roles);

        if let Some(id) = self.cache_lookup(&claims.sub) {
            debug!(subject = %claims.sub, id, "principal cache hit");
            let conn = self.db.lock().unwrap();
            if let Some(principal) = get_by_id(&conn, id)? {
                if claims_match(&principal, claims, role) {
                    return Ok(principal);
                }
                drop(conn);
                return self.update_from_claims(id, claims, role);
            }
            // Row was deleted externally; fall through to the upsert.
            self.cache_remove(&claims.sub);
        }

        let conn = self.db.lock().unwrap();
        if let Some(principal) = get_by_subject(&conn, &claims.sub)? {
            let id = principal.id;
            drop(conn);
            self.cache_insert(claims.sub.clone(), id);
            if claims_match(&principal, claims, role) {
                return Ok(principal);
            }
            return self.update_from_claims(id, claims, role);
        }

        info!(subject = %claims.sub, "new identity; provisioning principal");
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO principals
             (subject, email, display_name, role, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
            rusqlite::params![
                claims.sub,
                claims.email,
                claims.display_name(),
                role.as_str(),
                now
            ],
        )?;

        // Read back — handles the race where two requests provision the same
        // subject simultaneously.
        let principal = get_by_subject(&conn, &claims.sub)?
            .ok_or_else(|| AuthError::PrincipalNotFound(claims.sub.clone()))?;
        self.cache_insert(claims.sub.clone(), principal.id);
        Ok(principal)
    }

    /// Look up a principal by local id.
    pub fn get(&self, id: i64) -> Result<Option<Principal>> {
        let conn = self.db.lock().unwrap();
        get_by_id(&conn, id)
    }

    /// Admin: list all principals, newest first.
    pub fn list(&self) -> Result<Vec<Principal>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM principals ORDER BY created_at DESC",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_principal)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Admin: soft-deactivate a principal. Principals are never hard-deleted.
    pub fn deactivate(&self, id: i64) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.db.lock().unwrap();
        let rows = conn.execute(
            "UPDATE principals SET active = 0, updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, id],
        )?;
        if rows == 0 {
            return Err(AuthError::PrincipalNotFound(id.to_string()));
        }
        let subject: Option<String> = conn
            .query_row(
                "SELECT subject FROM principals WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .ok();
        drop(conn);
        if let Some(sub) = subject {
            self.cache_remove(&sub);
        }
        Ok(())
    }

    /// Update a principal's self-editable fields (display name).
    pub fn update_profile(&self, id: i64, display_name: &str) -> Result<Principal> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.db.lock().unwrap();
        let rows = conn.execute(
            "UPDATE principals SET display_name = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![display_name, now, id],
        )?;
        if rows == 0 {
            return Err(AuthError::PrincipalNotFound(id.to_string()));
        }
        get_by_id(&conn, id)?.ok_or_else(|| AuthError::PrincipalNotFound(id.to_string()))
    }

    fn update_from_claims(
        &self,
        id: i64,
        claims: &Claims,
        role: PrincipalRole,
    ) -> Result<Principal> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.db.lock().unwrap();
        conn.execute(
            "UPDATE principals
             SET email = ?1, display_name = ?2, role = ?3, updated_at = ?4
             WHERE id = ?5",
            rusqlite::params![claims.email, claims.display_name(), role.as_str(), now, id],
        )?;
        get_by_id(&conn, id)?.ok_or_else(|| AuthError::PrincipalNotFound(id.to_string()))
    }

    // ── cache helpers ─────────────────────────────────────────────────────────

    fn cache_lookup(&self, subject: &str) -> Option<i64> {
        self.cache.lock().unwrap().get(subject).copied()
    }

    fn cache_remove(&self, subject: &str) {
        let mut cache = self.cache.lock().unwrap();
        let mut order = self.cache_order.lock().unwrap();
        cache.remove(subject);
        order.retain(|k| k != subject);
    }

    fn cache_insert(&self, subject: String, id: i64) {
        let mut cache = self.cache.lock().unwrap();
        let mut order = self.cache_order.lock().unwrap();

        if cache.contains_key(&subject) {
            cache.insert(subject, id);
            return;
        }

        if cache.len() >= CACHE_MAX {
            let evict_count = CACHE_MAX / 2;
            let to_remove: Vec<_> = order.drain(..evict_count).collect();
            for k in to_remove {
                cache.remove(&k);
            }
        }

        order.push(subject.clone());
        cache.insert(subject, id);
    }
}

fn claims_match(principal: &Principal, claims: &Claims, role: PrincipalRole) -> bool {
    principal.email.as_deref() == claims.email.as_deref()
        && principal.display_name == claims.display_name()
        && principal.role == role
}

fn get_by_id(conn: &Connection, id: i64) -> Result<Option<Principal>> {
    match conn.query_row(
        &format!("SELECT {} FROM principals WHERE id = ?1", SELECT_COLUMNS),
        [id],
        row_to_principal,
    ) {
        Ok(p) => Ok(Some(p)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(AuthError::Database(e)),
    }
}

fn get_by_subject(conn: &Connection, subject: &str) -> Result<Option<Principal>> {
    match conn.query_row(
        &format!("SELECT {} FROM principals WHERE subject = ?1", SELECT_COLUMNS),
        [subject],
        row_to_principal,
    ) {
        Ok(p) => Ok(Some(p)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(AuthError::Database(e)),
    }
}

fn row_to_principal(row: &rusqlite::Row<'_>) -> rusqlite::Result<Principal> {
    use std::str::FromStr;
    let role = PrincipalRole::from_str(&row.get::<_, String>(4)?).unwrap_or_default();
    Ok(Principal {
        id: row.get(0)?,
        subject: row.get(1)?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        role,
        active: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PrincipalStore {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        PrincipalStore::new(conn)
    }

    fn claims(sub: &str, roles: &[&str]) -> Claims {
        serde_json::from_value(serde_json::json!({
            "sub": sub,
            "email": format!("{}@example.com", sub),
            "preferred_username": sub,
            "realm_access": { "roles": roles },
        }))
        .unwrap()
    }

    #[test]
    fn resolve_provisions_on_first_sight() {
        let store = store();
        let p = store.resolve(&claims("alice", &["user"])).unwrap();
        assert_eq!(p.subject, "alice");
        assert_eq!(p.role, PrincipalRole::User);
        assert!(p.active);

        // Second resolve returns the same row, not a new one.
        let again = store.resolve(&claims("alice", &["user"])).unwrap();
        assert_eq!(again.id, p.id);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn resolve_applies_role_precedence() {
        let store = store();
        let p = store.resolve(&claims("root", &["user", "admin"])).unwrap();
        assert_eq!(p.role, PrincipalRole::Admin);
    }

    #[test]
    fn resolve_updates_changed_claims() {
        let store = store();
        let first = store.resolve(&claims("bob", &["user"])).unwrap();
        let second = store.resolve(&claims("bob", &["admin"])).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.role, PrincipalRole::Admin);
    }

    #[test]
    fn deactivate_is_soft() {
        let store = store();
        let p = store.resolve(&claims("carol", &["user"])).unwrap();
        store.deactivate(p.id).unwrap();
        let after = store.get(p.id).unwrap().unwrap();
        assert!(!after.active);
    }

    #[test]
    fn deactivate_unknown_principal_errors() {
        let store = store();
        assert!(matches!(
            store.deactivate(9999).unwrap_err(),
            AuthError::PrincipalNotFound(_)
        ));
    }
}
