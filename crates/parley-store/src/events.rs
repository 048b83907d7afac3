//! Event history CRUD.

use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::models::ChatEvent;

impl Database {
    /// Persist one event. Events are immutable; replays of the same id are
    /// ignored.
    pub fn save_event(&self, event: &ChatEvent) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO events (event_id, room_id, sender, type, content, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.event_id,
                event.room_id,
                event.sender,
                event.kind,
                event.content.to_string(),
                event.timestamp,
            ],
        )?;
        Ok(())
    }

    /// The most recent `limit` events of a room, oldest first.
    pub fn room_history(&self, room_id: &str, limit: u32) -> Result<Vec<ChatEvent>> {
        let mut stmt = self.conn().prepare(
            "SELECT event_id, room_id, sender, type, content, timestamp
             FROM events
             WHERE room_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![room_id, limit], |row| {
            let content: String = row.get(4)?;
            Ok((
                ChatEvent {
                    event_id: row.get(0)?,
                    room_id: row.get(1)?,
                    sender: row.get(2)?,
                    kind: row.get(3)?,
                    content: serde_json::Value::Null,
                    timestamp: row.get(5)?,
                },
                content,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (mut event, raw_content) = row?;
            event.content = serde_json::from_str(&raw_content)?;
            events.push(event);
        }
        events.reverse();
        Ok(events)
    }
}
