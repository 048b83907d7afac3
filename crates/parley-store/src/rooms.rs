//! Room and membership CRUD.

use std::collections::HashMap;

use rusqlite::params;

use parley_shared::types::now_ms;
use parley_shared::Role;

use crate::database::Database;
use crate::error::Result;
use crate::models::Room;

impl Database {
    /// Insert or replace a room row. Membership is persisted separately via
    /// [`Database::add_member`].
    pub fn save_room(&self, room: &Room) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO rooms
             (room_id, name, creator, password_hash, password_salt, public, created_at, topic)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                room.room_id,
                room.name,
                room.creator,
                room.password_hash,
                room.password_salt,
                room.public as i64,
                room.created_at,
                room.topic,
            ],
        )?;
        Ok(())
    }

    /// Load every persisted room with its membership attached.
    pub fn load_rooms(&self) -> Result<Vec<Room>> {
        let mut stmt = self.conn().prepare(
            "SELECT room_id, name, creator, password_hash, password_salt,
                    public, created_at, topic
             FROM rooms",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(Room {
                room_id: row.get(0)?,
                name: row.get(1)?,
                creator: row.get(2)?,
                password_hash: row.get(3)?,
                password_salt: row.get(4)?,
                public: row.get::<_, i64>(5)? != 0,
                created_at: row.get(6)?,
                topic: row.get(7)?,
                members: HashMap::new(),
            })
        })?;

        let mut rooms = Vec::new();
        for row in rows {
            let mut room = row?;
            room.members = self.load_members(&room.room_id)?;
            rooms.push(room);
        }
        Ok(rooms)
    }

    /// Delete a room and everything keyed under it.
    pub fn delete_room(&self, room_id: &str) -> Result<()> {
        for table in ["members", "events", "files", "banned", "rooms"] {
            self.conn().execute(
                &format!("DELETE FROM {table} WHERE room_id = ?1"),
                params![room_id],
            )?;
        }
        Ok(())
    }

    pub fn add_member(&self, room_id: &str, username: &str, role: Role) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO members (room_id, username, role, joined_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![room_id, username, role.as_str(), now_ms()],
        )?;
        Ok(())
    }

    pub fn remove_member(&self, room_id: &str, username: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM members WHERE room_id = ?1 AND username = ?2",
            params![room_id, username],
        )?;
        Ok(())
    }

    pub fn load_members(&self, room_id: &str) -> Result<HashMap<String, Role>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT username, role FROM members WHERE room_id = ?1")?;

        let rows = stmt.query_map(params![room_id], |row| {
            let username: String = row.get(0)?;
            let role: String = row.get(1)?;
            Ok((username, Role::parse(&role)))
        })?;

        let mut members = HashMap::new();
        for row in rows {
            let (username, role) = row?;
            members.insert(username, role);
        }
        Ok(members)
    }
}
