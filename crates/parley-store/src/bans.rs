//! Room ban CRUD.
//!
//! Bans are remembered across reconnects and server restarts; banning also
//! revokes the target's current membership in the same transaction scope.

use rusqlite::params;

use parley_shared::types::now_ms;

use crate::database::Database;
use crate::error::Result;
use crate::models::BanRecord;

impl Database {
    pub fn is_banned(&self, room_id: &str, username: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM banned WHERE room_id = ?1 AND username = ?2",
            params![room_id, username],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Record a ban and drop the target's membership.
    pub fn ban_member(
        &self,
        room_id: &str,
        username: &str,
        banned_by: &str,
        reason: &str,
    ) -> Result<()> {
        self.conn().execute(
            "DELETE FROM members WHERE room_id = ?1 AND username = ?2",
            params![room_id, username],
        )?;
        self.conn().execute(
            "INSERT OR REPLACE INTO banned (room_id, username, banned_by, reason, banned_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![room_id, username, banned_by, reason, now_ms()],
        )?;
        Ok(())
    }

    pub fn list_bans(&self, room_id: &str) -> Result<Vec<BanRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT room_id, username, banned_by, reason, banned_at
             FROM banned WHERE room_id = ?1",
        )?;

        let rows = stmt.query_map(params![room_id], |row| {
            Ok(BanRecord {
                room_id: row.get(0)?,
                username: row.get(1)?,
                banned_by: row.get(2)?,
                reason: row.get(3)?,
                banned_at: row.get(4)?,
            })
        })?;

        let mut bans = Vec::new();
        for row in rows {
            bans.push(row?);
        }
        Ok(bans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::Role;

    #[test]
    fn ban_revokes_membership_and_is_remembered() {
        let db = Database::open_in_memory().unwrap();
        db.add_member("!r:lan", "mallory", Role::Member).unwrap();

        db.ban_member("!r:lan", "mallory", "alice", "spam").unwrap();

        assert!(db.is_banned("!r:lan", "mallory").unwrap());
        assert!(!db.load_members("!r:lan").unwrap().contains_key("mallory"));

        let bans = db.list_bans("!r:lan").unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].banned_by, "alice");
        assert_eq!(bans[0].reason, "spam");
    }

    #[test]
    fn bans_are_scoped_per_room() {
        let db = Database::open_in_memory().unwrap();
        db.ban_member("!one:lan", "mallory", "alice", "").unwrap();

        assert!(db.is_banned("!one:lan", "mallory").unwrap());
        assert!(!db.is_banned("!two:lan", "mallory").unwrap());
    }
}
