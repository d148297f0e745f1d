//! SQLite-backed persistence for clients, notifications and messages.
//!
//! [`DeliveryStore`] is the narrow set of queries the send pipeline needs;
//! [`NotifydDb`] implements it and adds the CRUD used by the gateway.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use notifyd_core::types::{
    Client, ClientRequest, Filter, Message, MessageState, Notification, NotificationRequest,
    SendPayload,
};
use notifyd_core::{NotifydError, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;

/// Queries the send pipeline runs against storage.
pub trait DeliveryStore: Send + Sync {
    /// Every stored notification, used to re-seed the scheduler at boot.
    fn all_notifications(&self) -> Result<Vec<Notification>>;

    /// Whether any message was ever created for the notification.
    fn has_messages(&self, notification_id: i64) -> Result<bool>;

    /// Clients matching the filter.
    fn matching_clients(&self, filter: &Filter) -> Result<Vec<Client>>;

    /// Clients matching the filter that have no message for this notification yet.
    fn unmessaged_clients(&self, notification_id: i64, filter: &Filter) -> Result<Vec<Client>>;

    /// Messages of this notification not yet in `SENT` state, ready to send again.
    fn unsent_messages(&self, notification_id: i64) -> Result<Vec<SendPayload>>;

    /// Insert a `CREATED` message. Fails if the pair already has one.
    fn create_message(&self, notification_id: i64, client_id: i64, text: &str) -> Result<Message>;

    fn set_message_state(&self, message_id: i64, state: MessageState) -> Result<()>;
}

/// Pagination for list queries. Pages start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Page {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 { 1 }
fn default_limit() -> u32 { 10 }

impl Default for Page {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl Page {
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }
    }

    fn limit(&self) -> i64 {
        i64::from(self.limit.max(1))
    }

    fn offset(&self) -> i64 {
        i64::from(self.page.max(1) - 1) * self.limit()
    }
}

/// SQLite database shared by the gateway and the pipeline.
pub struct NotifydDb {
    conn: Mutex<Connection>,
}

const CLIENT_COLUMNS: &str = "c.id, c.phone_number, c.phone_code, c.tag, c.time_zone";
const NOTIFICATION_COLUMNS: &str = "id, text, filter_phone_code, filter_tag, start_at, end_at";
const MESSAGE_COLUMNS: &str = "id, client_id, notification_id, text, state, created_at";

impl NotifydDb {
    /// Open or create the database. `:memory:` gives a private in-memory store.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| NotifydError::database(format!("DB open error: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(db_err)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        tracing::debug!("🗄️ Database ready at {}", path.display());
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS clients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phone_number INTEGER NOT NULL,
                phone_code TEXT NOT NULL DEFAULT '',
                tag TEXT NOT NULL DEFAULT '',
                time_zone TEXT NOT NULL DEFAULT ''
            );

            -- NULL filter column = field not set
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                text TEXT NOT NULL,
                filter_phone_code TEXT,
                filter_tag TEXT,
                start_at TEXT NOT NULL,
                end_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id INTEGER NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
                notification_id INTEGER NOT NULL REFERENCES notifications(id) ON DELETE CASCADE,
                text TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'CREATED',  -- CREATED, ERROR, SENT
                created_at TEXT NOT NULL,
                UNIQUE (notification_id, client_id)
            );

            CREATE INDEX IF NOT EXISTS idx_clients_phone_code ON clients(phone_code);
            CREATE INDEX IF NOT EXISTS idx_clients_tag ON clients(tag);
            ",
        )
        .map_err(|e| NotifydError::database(format!("Migration: {e}")))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| NotifydError::database(format!("Lock: {e}")))
    }

    // ─── Clients ──────────────────────────────────────────────

    pub fn create_client(&self, req: ClientRequest) -> Result<Client> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO clients (phone_number, phone_code, tag, time_zone) VALUES (?1, ?2, ?3, ?4)",
            params![req.phone_number, req.phone_code, req.tag, req.time_zone],
        )
        .map_err(db_err)?;
        Ok(req.into_client(conn.last_insert_rowid()))
    }

    pub fn get_client(&self, id: i64) -> Result<Client> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {CLIENT_COLUMNS} FROM clients c WHERE c.id = ?1"),
            params![id],
            client_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| NotifydError::not_found(format!("client {id}")))
    }

    pub fn list_clients(&self) -> Result<Vec<Client>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {CLIENT_COLUMNS} FROM clients c ORDER BY c.id"))
            .map_err(db_err)?;
        let rows = stmt.query_map([], client_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn update_client(&self, id: i64, req: ClientRequest) -> Result<Client> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE clients SET phone_number=?1, phone_code=?2, tag=?3, time_zone=?4 WHERE id=?5",
                params![req.phone_number, req.phone_code, req.tag, req.time_zone, id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(NotifydError::not_found(format!("client {id}")));
        }
        Ok(req.into_client(id))
    }

    pub fn delete_client(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute("DELETE FROM clients WHERE id=?1", params![id])
            .map_err(db_err)?;
        if changed == 0 {
            return Err(NotifydError::not_found(format!("client {id}")));
        }
        Ok(())
    }

    // ─── Notifications ────────────────────────────────────────

    pub fn create_notification(&self, req: NotificationRequest) -> Result<Notification> {
        let conn = self.conn()?;
        let filter = req.filter.clone().normalized();
        conn.execute(
            "INSERT INTO notifications (text, filter_phone_code, filter_tag, start_at, end_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                req.text,
                filter.phone_code,
                filter.tag,
                req.start_at.to_rfc3339(),
                req.end_at.to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(req.into_notification(conn.last_insert_rowid()))
    }

    pub fn get_notification(&self, id: i64) -> Result<Notification> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1"),
            params![id],
            notification_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| NotifydError::not_found(format!("notification {id}")))
    }

    pub fn list_notifications(&self, page: Page) -> Result<Vec<Notification>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {NOTIFICATION_COLUMNS} FROM notifications ORDER BY id LIMIT ?1 OFFSET ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![page.limit(), page.offset()], notification_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn update_notification(&self, id: i64, req: NotificationRequest) -> Result<Notification> {
        let conn = self.conn()?;
        let filter = req.filter.clone().normalized();
        let changed = conn
            .execute(
                "UPDATE notifications SET text=?1, filter_phone_code=?2, filter_tag=?3, start_at=?4, end_at=?5
                 WHERE id=?6",
                params![
                    req.text,
                    filter.phone_code,
                    filter.tag,
                    req.start_at.to_rfc3339(),
                    req.end_at.to_rfc3339(),
                    id
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(NotifydError::not_found(format!("notification {id}")));
        }
        Ok(req.into_notification(id))
    }

    /// Delete a notification and, by cascade, its messages.
    pub fn delete_notification(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute("DELETE FROM notifications WHERE id=?1", params![id])
            .map_err(db_err)?;
        if changed == 0 {
            return Err(NotifydError::not_found(format!("notification {id}")));
        }
        Ok(())
    }

    // ─── Messages ─────────────────────────────────────────────

    pub fn messages_for_notification(&self, notification_id: i64, page: Page) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE notification_id = ?1
                 ORDER BY id LIMIT ?2 OFFSET ?3"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![notification_id, page.limit(), page.offset()],
                message_from_row,
            )
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn get_message(&self, id: i64) -> Result<Message> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id],
            message_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| NotifydError::not_found(format!("message {id}")))
    }
}

impl DeliveryStore for NotifydDb {
    fn all_notifications(&self) -> Result<Vec<Notification>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications ORDER BY id"))
            .map_err(db_err)?;
        let rows = stmt.query_map([], notification_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn has_messages(&self, notification_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM messages WHERE notification_id = ?1)",
            params![notification_id],
            |row| row.get::<_, bool>(0),
        )
        .map_err(db_err)
    }

    fn matching_clients(&self, filter: &Filter) -> Result<Vec<Client>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CLIENT_COLUMNS} FROM clients c
                 WHERE (?1 IS NOT NULL AND c.phone_code = ?1) OR (?2 IS NOT NULL AND c.tag = ?2)
                 ORDER BY c.id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![filter.phone_code.as_deref(), filter.tag.as_deref()],
                client_from_row,
            )
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn unmessaged_clients(&self, notification_id: i64, filter: &Filter) -> Result<Vec<Client>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CLIENT_COLUMNS} FROM clients c
                 WHERE ((?1 IS NOT NULL AND c.phone_code = ?1) OR (?2 IS NOT NULL AND c.tag = ?2))
                   AND NOT EXISTS (
                       SELECT 1 FROM messages m WHERE m.client_id = c.id AND m.notification_id = ?3
                   )
                 ORDER BY c.id"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![filter.phone_code.as_deref(), filter.tag.as_deref(), notification_id],
                client_from_row,
            )
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn unsent_messages(&self, notification_id: i64) -> Result<Vec<SendPayload>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT m.id, n.text, c.phone_number FROM messages m
                 JOIN clients c ON c.id = m.client_id
                 JOIN notifications n ON n.id = m.notification_id
                 WHERE m.notification_id = ?1 AND m.state <> 'SENT'
                 ORDER BY m.id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![notification_id], |row| {
                Ok(SendPayload {
                    id: row.get(0)?,
                    text: row.get(1)?,
                    phone_number: row.get(2)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn create_message(&self, notification_id: i64, client_id: i64, text: &str) -> Result<Message> {
        let conn = self.conn()?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO messages (client_id, notification_id, text, state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                client_id,
                notification_id,
                text,
                MessageState::Created.as_str(),
                created_at.to_rfc3339()
            ],
        )
        .map_err(|e| {
            NotifydError::database(format!(
                "create message for notification {notification_id}, client {client_id}: {e}"
            ))
        })?;
        Ok(Message {
            id: conn.last_insert_rowid(),
            client_id,
            notification_id,
            text: text.to_string(),
            state: MessageState::Created,
            created_at,
        })
    }

    fn set_message_state(&self, message_id: i64, state: MessageState) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE messages SET state=?1 WHERE id=?2",
                params![state.as_str(), message_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(NotifydError::not_found(format!("message {message_id}")));
        }
        Ok(())
    }
}

fn db_err(e: rusqlite::Error) -> NotifydError {
    NotifydError::database(e.to_string())
}

fn parse_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn client_from_row(row: &Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        phone_number: row.get(1)?,
        phone_code: row.get(2)?,
        tag: row.get(3)?,
        time_zone: row.get(4)?,
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let phone_code: Option<String> = row.get(2)?;
    let tag: Option<String> = row.get(3)?;
    let start_at: String = row.get(4)?;
    let end_at: String = row.get(5)?;
    Ok(Notification {
        id: row.get(0)?,
        text: row.get(1)?,
        filter: Filter { phone_code, tag }.normalized(),
        start_at: parse_time(4, &start_at)?,
        end_at: parse_time(5, &end_at)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let state: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        client_id: row.get(1)?,
        notification_id: row.get(2)?,
        text: row.get(3)?,
        state: state
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        created_at: parse_time(5, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn temp_db() -> NotifydDb {
        NotifydDb::open(Path::new(":memory:")).unwrap()
    }

    fn client(db: &NotifydDb, phone: i64, code: &str, tag: &str) -> Client {
        db.create_client(ClientRequest {
            phone_number: phone,
            phone_code: code.into(),
            tag: tag.into(),
            time_zone: "Europe/Moscow".into(),
        })
        .unwrap()
    }

    fn notification(db: &NotifydDb, text: &str, filter: Filter) -> Notification {
        let now = Utc::now();
        db.create_notification(NotificationRequest {
            text: text.into(),
            filter,
            start_at: now,
            end_at: now + Duration::hours(1),
        })
        .unwrap()
    }

    #[test]
    fn test_client_crud() {
        let db = temp_db();
        let c = client(&db, 79990001111, "999", "vip");
        assert_eq!(db.get_client(c.id).unwrap(), c);

        let updated = db
            .update_client(
                c.id,
                ClientRequest {
                    phone_number: 79990002222,
                    phone_code: "999".into(),
                    tag: "basic".into(),
                    time_zone: "UTC".into(),
                },
            )
            .unwrap();
        assert_eq!(db.get_client(c.id).unwrap(), updated);
        assert_eq!(db.list_clients().unwrap().len(), 1);

        db.delete_client(c.id).unwrap();
        assert!(matches!(db.get_client(c.id), Err(NotifydError::NotFound(_))));
        assert!(matches!(db.delete_client(c.id), Err(NotifydError::NotFound(_))));
    }

    #[test]
    fn test_notification_round_trip_keeps_filter_and_times() {
        let db = temp_db();
        let n = notification(&db, "Sale", Filter::by_tag("vip"));
        let loaded = db.get_notification(n.id).unwrap();
        assert_eq!(loaded.filter, Filter::by_tag("vip"));
        assert_eq!(loaded.start_at, n.start_at);
        assert_eq!(loaded.end_at, n.end_at);
        assert_eq!(db.all_notifications().unwrap(), vec![loaded]);
    }

    #[test]
    fn test_notification_pages() {
        let db = temp_db();
        for i in 0..5 {
            notification(&db, &format!("n{i}"), Filter::by_tag("vip"));
        }
        let first = db.list_notifications(Page::new(1, 2)).unwrap();
        let third = db.list_notifications(Page::new(3, 2)).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].text, "n0");
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].text, "n4");
        assert!(db.list_notifications(Page::new(4, 2)).unwrap().is_empty());
    }

    #[test]
    fn test_update_missing_notification() {
        let db = temp_db();
        let now = Utc::now();
        let err = db
            .update_notification(
                99,
                NotificationRequest {
                    text: "x".into(),
                    filter: Filter::default(),
                    start_at: now,
                    end_at: now,
                },
            )
            .unwrap_err();
        assert!(matches!(err, NotifydError::NotFound(_)));
    }

    #[test]
    fn test_matching_by_code_or_tag() {
        let db = temp_db();
        let a = client(&db, 1, "999", "basic");
        let b = client(&db, 2, "111", "vip");
        client(&db, 3, "111", "basic");

        let ids = |cs: Vec<Client>| cs.into_iter().map(|c| c.id).collect::<Vec<_>>();
        assert_eq!(ids(db.matching_clients(&Filter::by_phone_code("999")).unwrap()), vec![a.id]);
        assert_eq!(ids(db.matching_clients(&Filter::by_tag("vip")).unwrap()), vec![b.id]);
        assert_eq!(
            ids(db.matching_clients(&Filter::new(Some("999"), Some("vip"))).unwrap()),
            vec![a.id, b.id]
        );
        assert!(db.matching_clients(&Filter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_messages_are_unique_per_pair() {
        let db = temp_db();
        let c = client(&db, 1, "999", "vip");
        let n = notification(&db, "Sale", Filter::by_tag("vip"));

        assert!(!db.has_messages(n.id).unwrap());
        let m = db.create_message(n.id, c.id, "Sale").unwrap();
        assert_eq!(m.state, MessageState::Created);
        assert!(db.has_messages(n.id).unwrap());
        assert!(matches!(
            db.create_message(n.id, c.id, "Sale"),
            Err(NotifydError::Database(_))
        ));
    }

    #[test]
    fn test_unmessaged_and_unsent_are_scoped_to_notification() {
        let db = temp_db();
        let a = client(&db, 100, "999", "vip");
        let b = client(&db, 200, "999", "vip");
        let first = notification(&db, "First", Filter::by_tag("vip"));
        let second = notification(&db, "Second", Filter::by_tag("vip"));

        let m = db.create_message(first.id, a.id, "First").unwrap();
        db.create_message(second.id, b.id, "Second").unwrap();

        let fresh: Vec<i64> = db
            .unmessaged_clients(first.id, &first.filter)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(fresh, vec![b.id]);

        let unsent = db.unsent_messages(first.id).unwrap();
        assert_eq!(
            unsent,
            vec![SendPayload {
                id: m.id,
                text: "First".into(),
                phone_number: 100,
            }]
        );

        db.set_message_state(m.id, MessageState::Sent).unwrap();
        assert!(db.unsent_messages(first.id).unwrap().is_empty());
        assert_eq!(db.unsent_messages(second.id).unwrap().len(), 1);
    }

    #[test]
    fn test_set_state_and_listing() {
        let db = temp_db();
        let c = client(&db, 1, "999", "vip");
        let n = notification(&db, "Sale", Filter::by_tag("vip"));
        let m = db.create_message(n.id, c.id, "Sale").unwrap();

        db.set_message_state(m.id, MessageState::Error).unwrap();
        assert_eq!(db.get_message(m.id).unwrap().state, MessageState::Error);
        assert_eq!(db.unsent_messages(n.id).unwrap().len(), 1);

        let listed = db.messages_for_notification(n.id, Page::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, MessageState::Error);

        assert!(matches!(
            db.set_message_state(9999, MessageState::Sent),
            Err(NotifydError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_notification_cascades() {
        let db = temp_db();
        let c = client(&db, 1, "999", "vip");
        let n = notification(&db, "Sale", Filter::by_tag("vip"));
        db.create_message(n.id, c.id, "Sale").unwrap();

        db.delete_notification(n.id).unwrap();
        assert!(!db.has_messages(n.id).unwrap());
        assert!(matches!(db.get_notification(n.id), Err(NotifydError::NotFound(_))));
    }

    #[test]
    fn test_page_offsets() {
        assert_eq!(Page::default().offset(), 0);
        assert_eq!(Page::new(3, 10).offset(), 20);
        assert_eq!(Page::new(0, 0).limit(), 1);
        assert_eq!(Page::new(0, 5).offset(), 0);
    }
}
