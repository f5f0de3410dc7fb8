//! The database wrapper: the statement-level contract the index requires.
//!
//! The default back-end keeps the whole catalog in a single SQLite file. A
//! plugin can substitute any other implementation of [`IndexDatabase`]; the
//! index itself only composes these primitives into transactions.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::compression::CompressionScheme;
use crate::errors::{VaultError, VaultResult};
use crate::storage::FileContentKind;
use crate::DATABASE_SCHEMA_VERSION;

use super::{Attachment, ChangeEvent, ChangeKind, ResourceType};

/// Keys of the `global_properties` table. Values below 1024 are reserved for
/// the server; plugins store their own state at or above 1024.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalProperty {
    DatabaseSchemaVersion,
    FlushSleep,
    AnonymizationSequence,
    TotalCompressedSize,
    TotalUncompressedSize,
    User(i64),
}

impl GlobalProperty {
    pub fn to_db(self) -> i64 {
        match self {
            GlobalProperty::DatabaseSchemaVersion => 1,
            GlobalProperty::FlushSleep => 2,
            GlobalProperty::AnonymizationSequence => 3,
            GlobalProperty::TotalCompressedSize => 4,
            GlobalProperty::TotalUncompressedSize => 5,
            GlobalProperty::User(key) => key,
        }
    }
}

/// Contract between the index and its persistence layer. All mutations are
/// assumed to happen between `begin` and `commit`; the index guarantees that
/// pairing and rolls back on any failure.
pub trait IndexDatabase: Send {
    fn begin(&mut self) -> VaultResult<()>;
    fn commit(&mut self) -> VaultResult<()>;
    fn rollback(&mut self) -> VaultResult<()>;

    fn create_resource(
        &mut self,
        public_id: &str,
        kind: ResourceType,
        parent: Option<i64>,
    ) -> VaultResult<i64>;
    fn lookup_resource(&mut self, public_id: &str) -> VaultResult<Option<(i64, ResourceType)>>;
    fn get_public_id(&mut self, id: i64) -> VaultResult<String>;
    fn get_resource_type(&mut self, id: i64) -> VaultResult<ResourceType>;
    fn get_parent(&mut self, id: i64) -> VaultResult<Option<i64>>;
    fn get_children(&mut self, id: i64) -> VaultResult<Vec<i64>>;
    fn delete_resource(&mut self, id: i64) -> VaultResult<()>;
    fn list_resources(&mut self, kind: ResourceType) -> VaultResult<Vec<String>>;
    fn count_resources(&mut self, kind: ResourceType) -> VaultResult<u64>;

    fn set_main_dicom_tag(&mut self, id: i64, group: u16, element: u16, value: &str)
        -> VaultResult<()>;
    fn get_main_dicom_tags(&mut self, id: i64) -> VaultResult<Vec<(u16, u16, String)>>;

    fn set_identifier_tag(&mut self, id: i64, group: u16, element: u16, value: &str)
        -> VaultResult<()>;
    fn lookup_identifier_exact(
        &mut self,
        kind: ResourceType,
        group: u16,
        element: u16,
        value: &str,
        case_sensitive: bool,
    ) -> VaultResult<Vec<i64>>;
    fn lookup_identifier_wildcard(
        &mut self,
        kind: ResourceType,
        group: u16,
        element: u16,
        pattern: &str,
    ) -> VaultResult<Vec<i64>>;
    fn lookup_identifier_range(
        &mut self,
        kind: ResourceType,
        group: u16,
        element: u16,
        lower: &str,
        upper: &str,
    ) -> VaultResult<Vec<i64>>;

    fn set_metadata(&mut self, id: i64, kind: i64, value: &str) -> VaultResult<()>;
    fn get_metadata(&mut self, id: i64, kind: i64) -> VaultResult<Option<String>>;
    fn list_metadata(&mut self, id: i64) -> VaultResult<Vec<(i64, String)>>;
    fn remove_metadata(&mut self, id: i64, kind: i64) -> VaultResult<()>;

    fn add_attachment(&mut self, id: i64, attachment: &Attachment) -> VaultResult<()>;
    fn get_attachment(&mut self, id: i64, kind: FileContentKind)
        -> VaultResult<Option<Attachment>>;
    fn list_attachments(&mut self, id: i64) -> VaultResult<Vec<Attachment>>;
    fn remove_attachment(&mut self, id: i64, kind: FileContentKind) -> VaultResult<()>;
    fn list_all_attachments(&mut self) -> VaultResult<Vec<Attachment>>;

    fn log_change(
        &mut self,
        kind: ChangeKind,
        resource_type: ResourceType,
        public_id: &str,
        date: &str,
    ) -> VaultResult<i64>;
    fn get_changes(&mut self, since: i64, limit: u64) -> VaultResult<(Vec<ChangeEvent>, bool)>;
    fn last_change_seq(&mut self) -> VaultResult<i64>;

    fn get_global_property(&mut self, property: GlobalProperty) -> VaultResult<Option<String>>;
    fn set_global_property(&mut self, property: GlobalProperty, value: &str) -> VaultResult<()>;

    fn touch_patient_recycling(&mut self, patient: i64) -> VaultResult<()>;
    fn oldest_recyclable_patient(&mut self, exclude: Option<i64>) -> VaultResult<Option<i64>>;
    fn set_patient_protected(&mut self, patient: i64, protected: bool) -> VaultResult<()>;
    fn is_patient_protected(&mut self, patient: i64) -> VaultResult<bool>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS global_properties(
    property INTEGER PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS resources(
    internal_id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_type INTEGER NOT NULL,
    public_id TEXT NOT NULL UNIQUE,
    parent_id INTEGER REFERENCES resources(internal_id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_resources_parent ON resources(parent_id);
CREATE INDEX IF NOT EXISTS idx_resources_public ON resources(public_id);
CREATE TABLE IF NOT EXISTS main_dicom_tags(
    id INTEGER NOT NULL REFERENCES resources(internal_id) ON DELETE CASCADE,
    tag_group INTEGER NOT NULL,
    tag_element INTEGER NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY(id, tag_group, tag_element)
);
CREATE TABLE IF NOT EXISTS dicom_identifiers(
    id INTEGER NOT NULL REFERENCES resources(internal_id) ON DELETE CASCADE,
    tag_group INTEGER NOT NULL,
    tag_element INTEGER NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY(id, tag_group, tag_element)
);
CREATE INDEX IF NOT EXISTS idx_identifier_values
    ON dicom_identifiers(tag_group, tag_element, value);
CREATE TABLE IF NOT EXISTS metadata(
    id INTEGER NOT NULL REFERENCES resources(internal_id) ON DELETE CASCADE,
    type INTEGER NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY(id, type)
);
CREATE TABLE IF NOT EXISTS attached_files(
    id INTEGER NOT NULL REFERENCES resources(internal_id) ON DELETE CASCADE,
    file_type INTEGER NOT NULL,
    uuid TEXT NOT NULL,
    compressed_size INTEGER NOT NULL,
    uncompressed_size INTEGER NOT NULL,
    compression_type INTEGER NOT NULL,
    compressed_md5 TEXT NOT NULL,
    uncompressed_md5 TEXT NOT NULL,
    PRIMARY KEY(id, file_type)
);
CREATE TABLE IF NOT EXISTS changes(
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    change_type INTEGER NOT NULL,
    resource_type INTEGER NOT NULL,
    public_id TEXT NOT NULL,
    date TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS patient_recycling_order(
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id INTEGER NOT NULL UNIQUE REFERENCES resources(internal_id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS protected_patients(
    patient_id INTEGER PRIMARY KEY REFERENCES resources(internal_id) ON DELETE CASCADE
);
";

/// The default, single-file SQLite back-end.
pub struct SqliteIndexDatabase {
    conn: Connection,
}

impl SqliteIndexDatabase {
    pub fn open(path: &std::path::Path, allow_upgrade: bool) -> VaultResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Index database: {}", path.display());
        let conn = Connection::open(path)?;
        Self::initialize(conn, allow_upgrade)
    }

    /// In-memory database, used by the tests.
    pub fn open_in_memory() -> VaultResult<Self> {
        Self::initialize(Connection::open_in_memory()?, false)
    }

    fn initialize(conn: Connection, allow_upgrade: bool) -> VaultResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;

        let fresh: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='resources'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n == 0)?;

        conn.execute_batch(SCHEMA)?;

        let mut db = SqliteIndexDatabase { conn };
        if fresh {
            db.set_global_property(
                GlobalProperty::DatabaseSchemaVersion,
                &DATABASE_SCHEMA_VERSION.to_string(),
            )?;
            db.set_global_property(GlobalProperty::TotalCompressedSize, "0")?;
            db.set_global_property(GlobalProperty::TotalUncompressedSize, "0")?;
        } else {
            db.check_schema_version(allow_upgrade)?;
        }
        Ok(db)
    }

    fn schema_version(&mut self) -> VaultResult<u32> {
        let value = self
            .get_global_property(GlobalProperty::DatabaseSchemaVersion)?
            .ok_or_else(|| VaultError::BadFileFormat {
                message: "the index database has no schema version".to_string(),
            })?;
        value.parse().map_err(|_| VaultError::BadFileFormat {
            message: format!("invalid schema version \"{}\"", value),
        })
    }

    fn check_schema_version(&mut self, allow_upgrade: bool) -> VaultResult<()> {
        let mut version = self.schema_version()?;

        if version > DATABASE_SCHEMA_VERSION {
            return Err(VaultError::IncompatibleDatabaseVersion {
                found: version,
                expected: DATABASE_SCHEMA_VERSION,
            });
        }

        if version < DATABASE_SCHEMA_VERSION {
            if !allow_upgrade {
                warn!(
                    "The database schema must be upgraded from version {} to {}: \
                     run with the \"--upgrade\" command-line option",
                    version, DATABASE_SCHEMA_VERSION
                );
                return Err(VaultError::IncompatibleDatabaseVersion {
                    found: version,
                    expected: DATABASE_SCHEMA_VERSION,
                });
            }

            while version < DATABASE_SCHEMA_VERSION {
                info!("Upgrading database schema from version {}", version);
                self.upgrade_from(version)?;
                version += 1;
                self.set_global_property(
                    GlobalProperty::DatabaseSchemaVersion,
                    &version.to_string(),
                )?;
            }

            // re-read, as the migration itself could have touched the property
            if self.schema_version()? != DATABASE_SCHEMA_VERSION {
                return Err(VaultError::IncompatibleDatabaseVersion {
                    found: self.schema_version()?,
                    expected: DATABASE_SCHEMA_VERSION,
                });
            }
        }

        Ok(())
    }

    fn upgrade_from(&mut self, version: u32) -> VaultResult<()> {
        match version {
            4 => {
                // version 5 introduced the identifier index; rebuild it from
                // the main tags already present
                self.conn.execute_batch(
                    "DELETE FROM dicom_identifiers;
                     INSERT INTO dicom_identifiers (id, tag_group, tag_element, value)
                       SELECT id, tag_group, tag_element, value FROM main_dicom_tags
                       WHERE (tag_group = 16 AND tag_element = 32)
                          OR (tag_group = 32 AND tag_element = 13)
                          OR (tag_group = 32 AND tag_element = 14)
                          OR (tag_group = 8 AND tag_element = 24)
                          OR (tag_group = 8 AND tag_element = 80);",
                )?;
                Ok(())
            }
            5 => {
                // version 6 added the running size totals
                let (compressed, uncompressed) = self.conn.query_row(
                    "SELECT COALESCE(SUM(compressed_size), 0),
                            COALESCE(SUM(uncompressed_size), 0)
                     FROM attached_files",
                    [],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )?;
                self.set_global_property(
                    GlobalProperty::TotalCompressedSize,
                    &compressed.to_string(),
                )?;
                self.set_global_property(
                    GlobalProperty::TotalUncompressedSize,
                    &uncompressed.to_string(),
                )?;
                Ok(())
            }
            _ => Err(VaultError::IncompatibleDatabaseVersion {
                found: version,
                expected: DATABASE_SCHEMA_VERSION,
            }),
        }
    }

    fn row_to_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, i64, Attachment)> {
        let id: i64 = row.get(0)?;
        let file_type: i64 = row.get(1)?;
        Ok((
            id,
            file_type,
            Attachment {
                // kind/compression decoded by the caller, which can report
                // a proper taxonomy error
                kind: FileContentKind::Dicom,
                compression: CompressionScheme::None,
                uuid: row.get(2)?,
                compressed_size: row.get::<_, i64>(3)? as u64,
                uncompressed_size: row.get::<_, i64>(4)? as u64,
                compressed_md5: row.get(6)?,
                uncompressed_md5: row.get(7)?,
            },
        ))
    }

    fn decode_attachment(row: (i64, i64, Attachment), raw_compression: i64) -> VaultResult<Attachment> {
        let (_, file_type, mut attachment) = row;
        attachment.kind = FileContentKind::from_db(file_type)?;
        attachment.compression = CompressionScheme::from_db(raw_compression)?;
        Ok(attachment)
    }
}

const ATTACHMENT_COLUMNS: &str =
    "id, file_type, uuid, compressed_size, uncompressed_size, compression_type, \
     compressed_md5, uncompressed_md5";

impl IndexDatabase for SqliteIndexDatabase {
    fn begin(&mut self) -> VaultResult<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> VaultResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> VaultResult<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn create_resource(
        &mut self,
        public_id: &str,
        kind: ResourceType,
        parent: Option<i64>,
    ) -> VaultResult<i64> {
        self.conn.execute(
            "INSERT INTO resources (resource_type, public_id, parent_id) VALUES (?1, ?2, ?3)",
            params![kind.to_db(), public_id, parent],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn lookup_resource(&mut self, public_id: &str) -> VaultResult<Option<(i64, ResourceType)>> {
        let row = self
            .conn
            .query_row(
                "SELECT internal_id, resource_type FROM resources WHERE public_id = ?1",
                params![public_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        match row {
            Some((id, kind)) => Ok(Some((id, ResourceType::from_db(kind)?))),
            None => Ok(None),
        }
    }

    fn get_public_id(&mut self, id: i64) -> VaultResult<String> {
        self.conn
            .query_row(
                "SELECT public_id FROM resources WHERE internal_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| VaultError::InexistentItem {
                what: format!("resource #{}", id),
            })
    }

    fn get_resource_type(&mut self, id: i64) -> VaultResult<ResourceType> {
        let kind: Option<i64> = self
            .conn
            .query_row(
                "SELECT resource_type FROM resources WHERE internal_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match kind {
            Some(kind) => ResourceType::from_db(kind),
            None => Err(VaultError::InexistentItem {
                what: format!("resource #{}", id),
            }),
        }
    }

    fn get_parent(&mut self, id: i64) -> VaultResult<Option<i64>> {
        let parent: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT parent_id FROM resources WHERE internal_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match parent {
            Some(parent) => Ok(parent),
            None => Err(VaultError::InexistentItem {
                what: format!("resource #{}", id),
            }),
        }
    }

    fn get_children(&mut self, id: i64) -> VaultResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT internal_id FROM resources WHERE parent_id = ?1 ORDER BY internal_id",
        )?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        let mut children = Vec::new();
        for row in rows {
            children.push(row?);
        }
        Ok(children)
    }

    fn delete_resource(&mut self, id: i64) -> VaultResult<()> {
        self.conn.execute(
            "DELETE FROM resources WHERE internal_id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn list_resources(&mut self, kind: ResourceType) -> VaultResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT public_id FROM resources WHERE resource_type = ?1 ORDER BY internal_id",
        )?;
        let rows = stmt.query_map(params![kind.to_db()], |row| row.get(0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn count_resources(&mut self, kind: ResourceType) -> VaultResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM resources WHERE resource_type = ?1",
            params![kind.to_db()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn set_main_dicom_tag(
        &mut self,
        id: i64,
        group: u16,
        element: u16,
        value: &str,
    ) -> VaultResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO main_dicom_tags (id, tag_group, tag_element, value)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, group, element, value],
        )?;
        Ok(())
    }

    fn get_main_dicom_tags(&mut self, id: i64) -> VaultResult<Vec<(u16, u16, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT tag_group, tag_element, value FROM main_dicom_tags
             WHERE id = ?1 ORDER BY tag_group, tag_element",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((
                row.get::<_, i64>(0)? as u16,
                row.get::<_, i64>(1)? as u16,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut tags = Vec::new();
        for row in rows {
            tags.push(row?);
        }
        Ok(tags)
    }

    fn set_identifier_tag(
        &mut self,
        id: i64,
        group: u16,
        element: u16,
        value: &str,
    ) -> VaultResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO dicom_identifiers (id, tag_group, tag_element, value)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, group, element, value],
        )?;
        Ok(())
    }

    fn lookup_identifier_exact(
        &mut self,
        kind: ResourceType,
        group: u16,
        element: u16,
        value: &str,
        case_sensitive: bool,
    ) -> VaultResult<Vec<i64>> {
        let sql = if case_sensitive {
            "SELECT d.id FROM dicom_identifiers AS d
             INNER JOIN resources AS r ON r.internal_id = d.id
             WHERE r.resource_type = ?1 AND d.tag_group = ?2 AND d.tag_element = ?3
               AND d.value = ?4 ORDER BY d.id"
        } else {
            "SELECT d.id FROM dicom_identifiers AS d
             INNER JOIN resources AS r ON r.internal_id = d.id
             WHERE r.resource_type = ?1 AND d.tag_group = ?2 AND d.tag_element = ?3
               AND d.value = ?4 COLLATE NOCASE ORDER BY d.id"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(
            params![kind.to_db(), group, element, value],
            |row| row.get(0),
        )?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    fn lookup_identifier_wildcard(
        &mut self,
        kind: ResourceType,
        group: u16,
        element: u16,
        pattern: &str,
    ) -> VaultResult<Vec<i64>> {
        let like = wildcard_to_like(pattern);
        let mut stmt = self.conn.prepare(
            "SELECT d.id FROM dicom_identifiers AS d
             INNER JOIN resources AS r ON r.internal_id = d.id
             WHERE r.resource_type = ?1 AND d.tag_group = ?2 AND d.tag_element = ?3
               AND d.value LIKE ?4 ESCAPE '\\' ORDER BY d.id",
        )?;
        let rows = stmt.query_map(
            params![kind.to_db(), group, element, like],
            |row| row.get(0),
        )?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    fn lookup_identifier_range(
        &mut self,
        kind: ResourceType,
        group: u16,
        element: u16,
        lower: &str,
        upper: &str,
    ) -> VaultResult<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.id FROM dicom_identifiers AS d
             INNER JOIN resources AS r ON r.internal_id = d.id
             WHERE r.resource_type = ?1 AND d.tag_group = ?2 AND d.tag_element = ?3
               AND d.value >= ?4 AND d.value <= ?5 ORDER BY d.id",
        )?;
        let rows = stmt.query_map(
            params![kind.to_db(), group, element, lower, upper],
            |row| row.get(0),
        )?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    fn set_metadata(&mut self, id: i64, kind: i64, value: &str) -> VaultResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (id, type, value) VALUES (?1, ?2, ?3)",
            params![id, kind, value],
        )?;
        Ok(())
    }

    fn get_metadata(&mut self, id: i64, kind: i64) -> VaultResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE id = ?1 AND type = ?2",
                params![id, kind],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn list_metadata(&mut self, id: i64) -> VaultResult<Vec<(i64, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT type, value FROM metadata WHERE id = ?1 ORDER BY type")?;
        let rows = stmt.query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn remove_metadata(&mut self, id: i64, kind: i64) -> VaultResult<()> {
        self.conn.execute(
            "DELETE FROM metadata WHERE id = ?1 AND type = ?2",
            params![id, kind],
        )?;
        Ok(())
    }

    fn add_attachment(&mut self, id: i64, attachment: &Attachment) -> VaultResult<()> {
        self.conn.execute(
            "INSERT INTO attached_files
               (id, file_type, uuid, compressed_size, uncompressed_size,
                compression_type, compressed_md5, uncompressed_md5)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                attachment.kind.to_db(),
                attachment.uuid,
                attachment.compressed_size as i64,
                attachment.uncompressed_size as i64,
                attachment.compression as i64,
                attachment.compressed_md5,
                attachment.uncompressed_md5,
            ],
        )?;
        Ok(())
    }

    fn get_attachment(
        &mut self,
        id: i64,
        kind: FileContentKind,
    ) -> VaultResult<Option<Attachment>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM attached_files WHERE id = ?1 AND file_type = ?2",
                    ATTACHMENT_COLUMNS
                ),
                params![id, kind.to_db()],
                |row| {
                    let decoded = Self::row_to_attachment(row)?;
                    let compression: i64 = row.get(5)?;
                    Ok((decoded, compression))
                },
            )
            .optional()?;
        match row {
            Some((decoded, compression)) => {
                Ok(Some(Self::decode_attachment(decoded, compression)?))
            }
            None => Ok(None),
        }
    }

    fn list_attachments(&mut self, id: i64) -> VaultResult<Vec<Attachment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM attached_files WHERE id = ?1 ORDER BY file_type",
            ATTACHMENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![id], |row| {
            let decoded = Self::row_to_attachment(row)?;
            let compression: i64 = row.get(5)?;
            Ok((decoded, compression))
        })?;
        let mut result = Vec::new();
        for row in rows {
            let (decoded, compression) = row?;
            result.push(Self::decode_attachment(decoded, compression)?);
        }
        Ok(result)
    }

    fn remove_attachment(&mut self, id: i64, kind: FileContentKind) -> VaultResult<()> {
        self.conn.execute(
            "DELETE FROM attached_files WHERE id = ?1 AND file_type = ?2",
            params![id, kind.to_db()],
        )?;
        Ok(())
    }

    fn list_all_attachments(&mut self) -> VaultResult<Vec<Attachment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM attached_files ORDER BY uuid",
            ATTACHMENT_COLUMNS
        ))?;
        let rows = stmt.query_map([], |row| {
            let decoded = Self::row_to_attachment(row)?;
            let compression: i64 = row.get(5)?;
            Ok((decoded, compression))
        })?;
        let mut result = Vec::new();
        for row in rows {
            let (decoded, compression) = row?;
            result.push(Self::decode_attachment(decoded, compression)?);
        }
        Ok(result)
    }

    fn log_change(
        &mut self,
        kind: ChangeKind,
        resource_type: ResourceType,
        public_id: &str,
        date: &str,
    ) -> VaultResult<i64> {
        self.conn.execute(
            "INSERT INTO changes (change_type, resource_type, public_id, date)
             VALUES (?1, ?2, ?3, ?4)",
            params![kind.to_db(), resource_type.to_db(), public_id, date],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_changes(&mut self, since: i64, limit: u64) -> VaultResult<(Vec<ChangeEvent>, bool)> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, change_type, resource_type, public_id, date FROM changes
             WHERE seq > ?1 ORDER BY seq LIMIT ?2",
        )?;
        // fetch one extra row to detect whether the log is exhausted
        let rows = stmt.query_map(params![since, (limit + 1) as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (seq, change_type, resource_type, public_id, date) = row?;
            events.push(ChangeEvent {
                seq,
                kind: ChangeKind::from_db(change_type)?,
                resource_type: ResourceType::from_db(resource_type)?,
                public_id,
                date,
            });
        }

        let done = events.len() <= limit as usize;
        events.truncate(limit as usize);
        Ok((events, done))
    }

    fn last_change_seq(&mut self) -> VaultResult<i64> {
        let seq: Option<i64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM changes", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(seq.unwrap_or(0))
    }

    fn get_global_property(&mut self, property: GlobalProperty) -> VaultResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM global_properties WHERE property = ?1",
                params![property.to_db()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_global_property(&mut self, property: GlobalProperty, value: &str) -> VaultResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO global_properties (property, value) VALUES (?1, ?2)",
            params![property.to_db(), value],
        )?;
        Ok(())
    }

    fn touch_patient_recycling(&mut self, patient: i64) -> VaultResult<()> {
        // delete + insert moves the patient to the back of the recycling queue
        self.conn.execute(
            "DELETE FROM patient_recycling_order WHERE patient_id = ?1",
            params![patient],
        )?;
        self.conn.execute(
            "INSERT INTO patient_recycling_order (patient_id) VALUES (?1)",
            params![patient],
        )?;
        Ok(())
    }

    fn oldest_recyclable_patient(&mut self, exclude: Option<i64>) -> VaultResult<Option<i64>> {
        let sql = "SELECT patient_id FROM patient_recycling_order
                   WHERE patient_id NOT IN (SELECT patient_id FROM protected_patients)
                     AND (?1 IS NULL OR patient_id != ?1)
                   ORDER BY seq, patient_id LIMIT 1";
        Ok(self
            .conn
            .query_row(sql, params![exclude], |row| row.get(0))
            .optional()?)
    }

    fn set_patient_protected(&mut self, patient: i64, protected: bool) -> VaultResult<()> {
        if protected {
            self.conn.execute(
                "INSERT OR IGNORE INTO protected_patients (patient_id) VALUES (?1)",
                params![patient],
            )?;
        } else {
            self.conn.execute(
                "DELETE FROM protected_patients WHERE patient_id = ?1",
                params![patient],
            )?;
        }
        Ok(())
    }

    fn is_patient_protected(&mut self, patient: i64) -> VaultResult<bool> {
        let row: Option<i64> = self
            .conn
            .query_row(
                "SELECT patient_id FROM protected_patients WHERE patient_id = ?1",
                params![patient],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }
}

/// Translate a DICOM wildcard pattern (`*`, `?`) into a SQL LIKE pattern.
fn wildcard_to_like(pattern: &str) -> String {
    let mut result = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '*' => result.push('%'),
            '?' => result.push('_'),
            '%' => result.push_str("\\%"),
            '_' => result.push_str("\\_"),
            '\\' => result.push_str("\\\\"),
            c => result.push(c),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_translation() {
        assert_eq!(wildcard_to_like("CT*"), "CT%");
        assert_eq!(wildcard_to_like("J?HN"), "J_HN");
        assert_eq!(wildcard_to_like("100%"), "100\\%");
    }

    #[test]
    fn fresh_database_is_at_current_version() {
        let mut db = SqliteIndexDatabase::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), DATABASE_SCHEMA_VERSION);
    }

    #[test]
    fn future_schema_version_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        {
            let mut db = SqliteIndexDatabase::open(&path, false).unwrap();
            db.set_global_property(
                GlobalProperty::DatabaseSchemaVersion,
                &(DATABASE_SCHEMA_VERSION + 1).to_string(),
            )
            .unwrap();
        }
        assert!(matches!(
            SqliteIndexDatabase::open(&path, true),
            Err(VaultError::IncompatibleDatabaseVersion { .. })
        ));
    }

    #[test]
    fn upgrade_runs_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        {
            let mut db = SqliteIndexDatabase::open(&path, false).unwrap();
            db.set_global_property(GlobalProperty::DatabaseSchemaVersion, "4").unwrap();
        }
        // without the flag, an old schema refuses to open
        assert!(matches!(
            SqliteIndexDatabase::open(&path, false),
            Err(VaultError::IncompatibleDatabaseVersion { .. })
        ));
        {
            let mut db = SqliteIndexDatabase::open(&path, true).unwrap();
            assert_eq!(db.schema_version().unwrap(), DATABASE_SCHEMA_VERSION);
        }
        // upgrading a database already at the target version is a no-op
        let mut db = SqliteIndexDatabase::open(&path, true).unwrap();
        assert_eq!(db.schema_version().unwrap(), DATABASE_SCHEMA_VERSION);
    }

    #[test]
    fn recycling_order_tracks_touches() {
        let mut db = SqliteIndexDatabase::open_in_memory().unwrap();
        let a = db.create_resource("patient-a", ResourceType::Patient, None).unwrap();
        let b = db.create_resource("patient-b", ResourceType::Patient, None).unwrap();
        db.touch_patient_recycling(a).unwrap();
        db.touch_patient_recycling(b).unwrap();
        assert_eq!(db.oldest_recyclable_patient(None).unwrap(), Some(a));

        // touching A again makes B the oldest
        db.touch_patient_recycling(a).unwrap();
        assert_eq!(db.oldest_recyclable_patient(None).unwrap(), Some(b));

        // protected patients are never candidates
        db.set_patient_protected(b, true).unwrap();
        assert_eq!(db.oldest_recyclable_patient(None).unwrap(), Some(a));
        assert_eq!(db.oldest_recyclable_patient(Some(a)).unwrap(), None);
    }
}
