//! Stored-file metadata CRUD.

use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::StoredFile;

impl Database {
    pub fn save_file(&self, file: &StoredFile) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO files
             (file_id, room_id, sender, filename, size, checksum, stored_name, uploaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                file.file_id,
                file.room_id,
                file.sender,
                file.filename,
                file.size as i64,
                file.checksum,
                file.stored_name,
                file.uploaded_at,
            ],
        )?;
        Ok(())
    }

    /// All files uploaded to a room, newest first.
    pub fn list_files(&self, room_id: &str) -> Result<Vec<StoredFile>> {
        let mut stmt = self.conn().prepare(
            "SELECT file_id, room_id, sender, filename, size, checksum, stored_name, uploaded_at
             FROM files
             WHERE room_id = ?1
             ORDER BY uploaded_at DESC",
        )?;

        let rows = stmt.query_map(params![room_id], row_to_file)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    pub fn get_file(&self, file_id: &str) -> Result<StoredFile> {
        self.conn()
            .query_row(
                "SELECT file_id, room_id, sender, filename, size, checksum, stored_name, uploaded_at
                 FROM files WHERE file_id = ?1",
                params![file_id],
                row_to_file,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredFile> {
    Ok(StoredFile {
        file_id: row.get(0)?,
        room_id: row.get(1)?,
        sender: row.get(2)?,
        filename: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        checksum: row.get(5)?,
        stored_name: row.get(6)?,
        uploaded_at: row.get(7)?,
    })
}
