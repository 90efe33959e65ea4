use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use contact_identity_core::{
    resolve_identity, Contact, ContactGateway, ContactId, Identity, LinkPrecedence, ResolveError,
    Resolution,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const CREATE_CONTACT_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contact (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  phone_number INTEGER,
  email TEXT,
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  linked_id INTEGER,
  created_at TEXT NOT NULL,
  CHECK (email IS NOT NULL OR phone_number IS NOT NULL),
  CHECK (
    (link_precedence = 'primary' AND linked_id IS NULL)
    OR (link_precedence = 'secondary' AND linked_id IS NOT NULL)
  ),
  FOREIGN KEY (linked_id) REFERENCES contact(id)
);

CREATE INDEX IF NOT EXISTS idx_contact_email ON contact(email);
CREATE INDEX IF NOT EXISTS idx_contact_phone_number ON contact(phone_number);
CREATE INDEX IF NOT EXISTS idx_contact_linked_id ON contact(linked_id);
";

const SELECT_CONTACT_COLUMNS: &str =
    "SELECT id, email, phone_number, link_precedence, linked_id, created_at FROM contact";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

/// A secondary contact whose link does not point at a primary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvalidLink {
    pub contact_id: ContactId,
    pub linked_id: ContactId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub invalid_links: Vec<InvalidLink>,
    pub contact_count: i64,
}

impl SqliteStore {
    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like [`SqliteStore::open`], waiting up to `busy_timeout` for the write lock.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(busy_timeout).context("failed to configure sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Create the contact table and its indexes when missing. Safe to call on every open.
    ///
    /// # Errors
    /// Returns an error when the schema statements fail.
    pub fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(CREATE_CONTACT_SQL).context("failed to create contact schema")
    }

    /// Resolve one identity atomically: the match query, the consolidation decision and
    /// any insert all run inside one `BEGIN IMMEDIATE` transaction, so concurrent
    /// resolutions against the same database are serialized.
    ///
    /// # Errors
    /// Returns [`ResolveError::Unavailable`] when the write lock cannot be taken,
    /// [`ResolveError::Lookup`]/[`ResolveError::Insert`] for statement failures, and
    /// [`ResolveError::Identity`] when stored rows break cluster invariants.
    pub fn resolve(
        &mut self,
        identity: &Identity,
    ) -> std::result::Result<Resolution, ResolveError<anyhow::Error>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to acquire contact write lock")
            .map_err(ResolveError::Unavailable)?;

        let resolution = resolve_identity(&mut ConnectionGateway { conn: &tx }, identity)?;

        tx.commit().context("failed to commit contact resolution").map_err(ResolveError::Insert)?;
        tracing::debug!(
            matched = resolution.matched,
            created = ?resolution.created,
            primary_contact_id = %resolution.view.primary_contact_id,
            "contact resolution committed"
        );
        Ok(resolution)
    }

    /// Contacts whose email or phone number equals the identity's, in creation order.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn find_matches(&self, identity: &Identity) -> Result<Vec<Contact>> {
        query_matches(&self.conn, identity)
    }

    /// Load all persisted contacts in creation order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self.conn.prepare(&format!("{SELECT_CONTACT_COLUMNS} ORDER BY id ASC"))?;
        let mut rows = stmt.query([])?;
        let mut contacts = Vec::new();
        while let Some(row) = rows.next()? {
            contacts.push(read_contact(row)?);
        }
        Ok(contacts)
    }

    /// # Errors
    /// Returns an error when lookup or row decoding fails.
    pub fn get_contact(&self, id: ContactId) -> Result<Option<Contact>> {
        let mut stmt = self.conn.prepare(&format!("{SELECT_CONTACT_COLUMNS} WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id.0])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_contact(row)?)),
            None => Ok(None),
        }
    }

    /// Run quick-check, foreign-key-check, and the primary-link probe.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;
        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.id, c.linked_id
                 FROM contact c
                 LEFT JOIN contact p ON p.id = c.linked_id
                 WHERE c.link_precedence = 'secondary'
                   AND (p.id IS NULL OR p.link_precedence <> 'primary')
                 ORDER BY c.id ASC",
            )
            .context("failed to prepare primary-link probe")?;
        let rows = stmt.query_map([], |row| {
            Ok(InvalidLink { contact_id: ContactId(row.get(0)?), linked_id: ContactId(row.get(1)?) })
        })?;
        let mut invalid_links = Vec::new();
        for row in rows {
            invalid_links.push(row?);
        }

        let contact_count = self
            .conn
            .query_row("SELECT COUNT(*) FROM contact", [], |row| row.get::<_, i64>(0))
            .context("failed to count contacts")?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            invalid_links,
            contact_count,
        })
    }
}

/// Gateway over a borrowed connection; inside [`SqliteStore::resolve`] it borrows the
/// open transaction.
struct ConnectionGateway<'a> {
    conn: &'a Connection,
}

impl ContactGateway for ConnectionGateway<'_> {
    type Error = anyhow::Error;

    fn find_matches(&mut self, identity: &Identity) -> Result<Vec<Contact>> {
        query_matches(self.conn, identity)
    }

    fn insert_primary(&mut self, email: Option<&str>, phone_number: Option<i64>) -> Result<ContactId> {
        insert_contact(self.conn, email, phone_number, LinkPrecedence::Primary, None)
    }

    fn insert_secondary(
        &mut self,
        email: Option<&str>,
        phone_number: Option<i64>,
        primary_id: ContactId,
    ) -> Result<ContactId> {
        let precedence = self
            .conn
            .query_row(
                "SELECT link_precedence FROM contact WHERE id = ?1",
                params![primary_id.0],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up primary contact {primary_id}"))?
            .ok_or_else(|| anyhow!("primary contact {primary_id} does not exist"))?;

        if LinkPrecedence::parse(&precedence) != Some(LinkPrecedence::Primary) {
            return Err(anyhow!(
                "contact {primary_id} is {precedence}; secondary contacts MUST link to a primary"
            ));
        }

        insert_contact(self.conn, email, phone_number, LinkPrecedence::Secondary, Some(primary_id))
    }
}

fn query_matches(conn: &Connection, identity: &Identity) -> Result<Vec<Contact>> {
    let mut stmt = conn
        .prepare(&format!(
            "{SELECT_CONTACT_COLUMNS} WHERE email = ?1 OR phone_number = ?2 ORDER BY id ASC"
        ))
        .context("failed to prepare contact match query")?;
    let mut rows = stmt
        .query(params![identity.email(), identity.phone_number()])
        .context("failed to run contact match query")?;

    let mut contacts = Vec::new();
    while let Some(row) = rows.next()? {
        contacts.push(read_contact(row)?);
    }
    Ok(contacts)
}

fn insert_contact(
    conn: &Connection,
    email: Option<&str>,
    phone_number: Option<i64>,
    link_precedence: LinkPrecedence,
    linked_id: Option<ContactId>,
) -> Result<ContactId> {
    if email.is_none() && phone_number.is_none() {
        return Err(anyhow!("contact MUST carry an email or a phone number"));
    }

    let id = conn
        .query_row(
            "INSERT INTO contact(phone_number, email, link_precedence, linked_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             RETURNING id",
            params![
                phone_number,
                email,
                link_precedence.as_str(),
                linked_id.map(|id| id.0),
                now_rfc3339()?
            ],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to insert {} contact", link_precedence.as_str()))?;
    Ok(ContactId(id))
}

fn read_contact(row: &Row<'_>) -> Result<Contact> {
    let link_precedence_raw: String = row.get(3)?;
    let created_at_raw: String = row.get(5)?;

    let contact = Contact {
        id: ContactId(row.get(0)?),
        email: row.get(1)?,
        phone_number: row.get(2)?,
        link_precedence: LinkPrecedence::parse(&link_precedence_raw)
            .ok_or_else(|| anyhow!("unknown link_precedence: {link_precedence_raw}"))?,
        linked_id: row.get::<_, Option<i64>>(4)?.map(ContactId),
        created_at: parse_rfc3339(&created_at_raw)?,
    };
    contact.validate().map_err(|err| anyhow!("stored contact is invalid: {err}"))?;
    Ok(contact)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
