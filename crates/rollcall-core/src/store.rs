//! Persistent mapping of student identifier to face signature.
//!
//! Backed by SQLite. Reads go through an in-memory copy of the whole
//! gallery that is dropped on every mutation and reloaded lazily.

use crate::types::{Enrollment, FaceSignature, StudentId};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt signature for {0}")]
    Corrupt(String),
}

/// What `remove` actually found and deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub signature: bool,
    pub image: bool,
}

pub struct IdentityStore {
    conn: Connection,
    /// Where registration frames are archived; `None` disables archiving.
    faces_dir: Option<PathBuf>,
    cache: Option<Vec<Enrollment>>,
}

impl IdentityStore {
    /// Open (or create) the store at `db_path`.
    ///
    /// A missing database is not an error: the store simply starts empty.
    pub fn open(db_path: &Path, faces_dir: Option<PathBuf>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        migrate(&conn)?;
        tracing::debug!(path = %db_path.display(), "identity store opened");
        Ok(Self {
            conn,
            faces_dir,
            cache: None,
        })
    }

    /// In-memory store without image archiving. Useful for testing.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn,
            faces_dir: None,
            cache: None,
        })
    }

    /// Every registration, in first-registration order.
    pub fn all(&mut self) -> Result<&[Enrollment], StoreError> {
        if self.cache.is_none() {
            self.cache = Some(load_all(&self.conn)?);
        }
        Ok(self.cache.as_deref().unwrap_or_default())
    }

    pub fn contains(&mut self, id: &StudentId) -> Result<bool, StoreError> {
        Ok(self.all()?.iter().any(|e| &e.student_id == id))
    }

    /// Register or re-register `id`. The latest signature wins; a
    /// re-registered student keeps their original position.
    ///
    /// `image` is the grayscale frame (data, width, height) the signature
    /// came from, archived as a reference picture when archiving is enabled.
    pub fn add(
        &mut self,
        id: &StudentId,
        signature: &FaceSignature,
        image: Option<(&[u8], u32, u32)>,
    ) -> Result<(), StoreError> {
        let registered_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        self.conn.execute(
            "INSERT INTO identities (student_id, signature, dim, registered_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(student_id) DO UPDATE SET
                signature = excluded.signature,
                dim = excluded.dim,
                registered_at = excluded.registered_at",
            params![id.as_str(), signature.to_bytes(), signature.dim() as i64, registered_at],
        )?;
        self.cache = None;

        if let (Some(dir), Some((data, width, height))) = (&self.faces_dir, image) {
            if let Err(e) = archive_image(dir, id, data, width, height) {
                tracing::warn!(id = %id, error = %e, "could not archive registration image");
            }
        }
        Ok(())
    }

    /// Delete the signature and archived image for `id`.
    ///
    /// Absent parts are reported in the returned [`Removal`], not as errors.
    pub fn remove(&mut self, id: &StudentId) -> Result<Removal, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM identities WHERE student_id = ?1", params![id.as_str()])?;
        self.cache = None;

        let image = match &self.faces_dir {
            Some(dir) => {
                let path = image_path(dir, id);
                match std::fs::remove_file(&path) {
                    Ok(()) => true,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                    Err(e) => return Err(e.into()),
                }
            }
            None => false,
        };

        let removal = Removal {
            signature: deleted > 0,
            image,
        };
        tracing::info!(id = %id, signature = removal.signature, image = removal.image, "deregistered");
        Ok(removal)
    }

    /// Path of the archived reference image for `id`, if archiving is enabled.
    pub fn image_path(&self, id: &StudentId) -> Option<PathBuf> {
        self.faces_dir.as_deref().map(|dir| image_path(dir, id))
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS identities (
            student_id    TEXT PRIMARY KEY,
            signature     BLOB NOT NULL,
            dim           INTEGER NOT NULL,
            registered_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn load_all(conn: &Connection) -> Result<Vec<Enrollment>, StoreError> {
    let mut stmt = conn.prepare("SELECT student_id, signature FROM identities ORDER BY rowid")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?;

    let mut gallery = Vec::new();
    for row in rows {
        let (raw_id, blob) = row?;
        let student_id = raw_id.parse().map_err(|_| StoreError::Corrupt(raw_id.clone()))?;
        let signature = FaceSignature::from_bytes(&blob).ok_or_else(|| StoreError::Corrupt(raw_id.clone()))?;
        gallery.push(Enrollment { student_id, signature });
    }
    Ok(gallery)
}

/// File name for an archived image; anything outside `[A-Za-z0-9._-]` becomes `_`.
fn image_path(dir: &Path, id: &StudentId) -> PathBuf {
    let safe: String = id
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "._-".contains(c) { c } else { '_' })
        .collect();
    dir.join(format!("{safe}.png"))
}

fn archive_image(dir: &Path, id: &StudentId, data: &[u8], width: u32, height: u32) -> Result<(), String> {
    std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
    let img = image::GrayImage::from_raw(width, height, data.to_vec())
        .ok_or_else(|| format!("frame buffer does not match {width}x{height}"))?;
    img.save(image_path(dir, id)).map_err(|e| e.to_string())
}
