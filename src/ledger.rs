//! Transactional persistence of issued-certificate metadata and append-only
//! revocation events, backed by an embedded `rusqlite` database.

use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::{Error, Result};
use crate::types::{CertificateFilter, CertificateStatus, IssuedCertificateMeta, Serial};

/// Transactional store for issued-certificate metadata and the revocation
/// log. Holds its `rusqlite::Connection` behind a `Mutex` since connections
/// aren't `Sync`, matching the concurrency model the rest of the manager
/// uses for its other shared, blocking resources.
pub struct CertificateLedger {
    conn: Mutex<Connection>,
}

impl CertificateLedger {
    /// Opens (or creates) the ledger tables against an already-open
    /// connection. `issued_certificates` and `certificate_revocations` are
    /// created defensively here (`CREATE TABLE IF NOT EXISTS`) rather than
    /// assumed pre-provisioned, since this crate has no separate migration
    /// entry point of its own.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS issued_certificates (
                serial_number      TEXT PRIMARY KEY,
                agent_id           TEXT,
                colony_id          TEXT NOT NULL,
                certificate_pem    TEXT NOT NULL,
                issued_at          TEXT NOT NULL,
                expires_at         TEXT NOT NULL,
                revoked_at         TEXT,
                revocation_reason  TEXT,
                status             TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS certificate_revocations (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                serial_number TEXT NOT NULL,
                revoked_at    TEXT NOT NULL,
                reason        TEXT NOT NULL,
                revoked_by    TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a new issued-certificate row. Fails `Duplicate` if the
    /// serial is already present — since serials are 128-bit random, a
    /// collision indicates a PRNG defect and callers treat it as fatal.
    pub fn store_certificate(&self, meta: &IssuedCertificateMeta) -> Result<()> {
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT serial_number FROM issued_certificates WHERE serial_number = ?1",
                params![meta.serial.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(Error::Duplicate(format!(
                "serial {} already present in ledger",
                meta.serial
            )));
        }

        conn.execute(
            "INSERT INTO issued_certificates
                (serial_number, agent_id, colony_id, certificate_pem, issued_at, expires_at,
                 revoked_at, revocation_reason, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                meta.serial.to_hex(),
                meta.agent_id,
                meta.colony_id,
                meta.certificate_pem,
                meta.issued_at.to_rfc3339(),
                meta.expires_at.to_rfc3339(),
                meta.revoked_at.map(|t| t.to_rfc3339()),
                meta.revocation_reason,
                meta.status.as_str(),
            ],
        )?;

        info!(serial = %meta.serial, colony_id = %meta.colony_id, "stored issued certificate");
        Ok(())
    }

    /// Looks up a certificate by serial. `NotFound` if absent.
    pub fn get_certificate(&self, serial: &Serial) -> Result<IssuedCertificateMeta> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT serial_number, agent_id, colony_id, certificate_pem, issued_at, expires_at,
                    revoked_at, revocation_reason, status
             FROM issued_certificates WHERE serial_number = ?1",
            params![serial.to_hex()],
            row_to_meta,
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("certificate with serial {serial}")))
    }

    /// Revokes a certificate in one transaction: flips its status and
    /// appends a row to the revocation log. Either both happen or neither
    /// does. A repeated call on an already-revoked serial succeeds again,
    /// updating `revoked_at` and appending another revocation row — the log
    /// is append-only by design.
    pub fn revoke_certificate(&self, serial: &Serial, reason: &str, revoked_by: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let updated = tx.execute(
            "UPDATE issued_certificates
             SET status = 'revoked', revoked_at = ?1, revocation_reason = ?2
             WHERE serial_number = ?3",
            params![now, reason, serial.to_hex()],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("certificate with serial {serial}")));
        }

        tx.execute(
            "INSERT INTO certificate_revocations (serial_number, revoked_at, reason, revoked_by)
             VALUES (?1, ?2, ?3, ?4)",
            params![serial.to_hex(), now, reason, revoked_by],
        )?;

        tx.commit()?;
        info!(%serial, reason, revoked_by, "revoked certificate");
        Ok(())
    }

    /// Lists certificates matching an AND-composed filter over agent id,
    /// colony id, and status.
    pub fn list_certificates(&self, filter: &CertificateFilter) -> Result<Vec<IssuedCertificateMeta>> {
        let conn = self.lock()?;
        let mut sql = String::from(
            "SELECT serial_number, agent_id, colony_id, certificate_pem, issued_at, expires_at,
                    revoked_at, revocation_reason, status
             FROM issued_certificates WHERE 1=1",
        );
        let mut bound: Vec<String> = Vec::new();

        if let Some(colony_id) = &filter.colony_id {
            sql.push_str(" AND colony_id = ?");
            bound.push(colony_id.clone());
        }
        if let Some(agent_id) = &filter.agent_id {
            sql.push_str(" AND agent_id = ?");
            bound.push(agent_id.clone());
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            bound.push(status.as_str().to_string());
        }

        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> =
            bound.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), row_to_meta)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::from)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::Storage(format!("ledger connection lock poisoned: {e}")))
    }
}

fn row_to_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<IssuedCertificateMeta> {
    Ok(IssuedCertificateMeta {
        serial: Serial::from_hex(&row.get::<_, String>(0)?)
            .map_err(|_| rusqlite::Error::InvalidColumnType(0, "serial_number".into(), rusqlite::types::Type::Text))?,
        agent_id: row.get(1)?,
        colony_id: row.get(2)?,
        certificate_pem: row.get(3)?,
        issued_at: parse_rfc3339(row.get::<_, String>(4)?, 4)?,
        expires_at: parse_rfc3339(row.get::<_, String>(5)?, 5)?,
        revoked_at: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_rfc3339(s, 6))
            .transpose()?,
        revocation_reason: row.get(7)?,
        status: CertificateStatus::parse(&row.get::<_, String>(8)?)
            .map_err(|_| rusqlite::Error::InvalidColumnType(8, "status".into(), rusqlite::types::Type::Text))?,
    })
}

fn parse_rfc3339(s: String, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidColumnType(col, "timestamp".into(), rusqlite::types::Type::Text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(serial: Serial, colony_id: &str, agent_id: Option<&str>) -> IssuedCertificateMeta {
        let now = Utc::now();
        IssuedCertificateMeta {
            serial,
            colony_id: colony_id.to_string(),
            agent_id: agent_id.map(str::to_string),
            certificate_pem: "-----BEGIN CERTIFICATE-----\n...\n-----END CERTIFICATE-----\n".to_string(),
            issued_at: now,
            expires_at: now + chrono::Duration::days(90),
            status: CertificateStatus::Active,
            revoked_at: None,
            revocation_reason: None,
        }
    }

    fn open_ledger() -> CertificateLedger {
        CertificateLedger::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn store_and_get_round_trips() {
        let ledger = open_ledger();
        let serial = Serial::random_128();
        ledger.store_certificate(&meta(serial.clone(), "colony-a", Some("agent-1"))).unwrap();

        let fetched = ledger.get_certificate(&serial).unwrap();
        assert_eq!(fetched.colony_id, "colony-a");
        assert_eq!(fetched.status, CertificateStatus::Active);
    }

    #[test]
    fn duplicate_serial_is_rejected() {
        let ledger = open_ledger();
        let serial = Serial::random_128();
        ledger.store_certificate(&meta(serial.clone(), "colony-a", None)).unwrap();

        let result = ledger.store_certificate(&meta(serial, "colony-a", None));
        assert!(matches!(result, Err(Error::Duplicate(_))));
    }

    #[test]
    fn get_missing_certificate_not_found() {
        let ledger = open_ledger();
        let result = ledger.get_certificate(&Serial::random_128());
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn revoke_updates_status_and_appends_log_row() {
        let ledger = open_ledger();
        let serial = Serial::random_128();
        ledger.store_certificate(&meta(serial.clone(), "colony-a", Some("agent-1"))).unwrap();

        ledger.revoke_certificate(&serial, "compromised", "admin").unwrap();

        let fetched = ledger.get_certificate(&serial).unwrap();
        assert_eq!(fetched.status, CertificateStatus::Revoked);
        assert_eq!(fetched.revocation_reason.as_deref(), Some("compromised"));

        let conn = ledger.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM certificate_revocations WHERE serial_number = ?1",
                params![serial.to_hex()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn repeated_revoke_appends_another_log_row() {
        let ledger = open_ledger();
        let serial = Serial::random_128();
        ledger.store_certificate(&meta(serial.clone(), "colony-a", None)).unwrap();

        ledger.revoke_certificate(&serial, "first", "admin").unwrap();
        ledger.revoke_certificate(&serial, "second", "admin").unwrap();

        let conn = ledger.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM certificate_revocations WHERE serial_number = ?1",
                params![serial.to_hex()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn list_certificates_filters_by_colony() {
        let ledger = open_ledger();
        ledger
            .store_certificate(&meta(Serial::random_128(), "colony-a", Some("agent-1")))
            .unwrap();
        ledger
            .store_certificate(&meta(Serial::random_128(), "colony-b", Some("agent-2")))
            .unwrap();

        let filter = CertificateFilter {
            colony_id: Some("colony-a".to_string()),
            ..CertificateFilter::default()
        };
        let results = ledger.list_certificates(&filter).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].colony_id, "colony-a");
    }
}
