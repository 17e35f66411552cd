//! Device registry repository

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::DbPool;
use crate::{Error, Result};

/// Device lifecycle states
pub mod status {
    pub const ACTIVATED: &str = "activated";
    pub const INACTIVATED: &str = "inactivated";
    pub const DISABLED: &str = "disabled";
    pub const SCRAPPED: &str = "scrapped";
}

/// One registered device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Serial number
    pub sn: String,
    /// Owning vendor
    pub vendor: String,
    /// Device model/type code
    pub device_type: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Lifecycle state (see [`status`])
    #[serde(default)]
    pub status: String,
}

/// Repository over the device table
#[derive(Clone)]
pub struct DeviceRepo {
    pool: DbPool,
}

impl DeviceRepo {
    /// Wrap a pool
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<super::DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// All registered devices, ordered by serial number
    ///
    /// # Errors
    ///
    /// Returns an error on query failure.
    pub fn list(&self) -> Result<Vec<Device>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sn, vendor, device_type, name, status FROM devices ORDER BY sn",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Device {
                sn: row.get(0)?,
                vendor: row.get(1)?,
                device_type: row.get(2)?,
                name: row.get(3)?,
                status: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Look up one device by serial number
    ///
    /// # Errors
    ///
    /// Returns an error on query failure.
    pub fn get(&self, sn: &str) -> Result<Option<Device>> {
        let conn = self.conn()?;
        let device = conn
            .query_row(
                "SELECT sn, vendor, device_type, name, status FROM devices WHERE sn = ?1",
                params![sn],
                |row| {
                    Ok(Device {
                        sn: row.get(0)?,
                        vendor: row.get(1)?,
                        device_type: row.get(2)?,
                        name: row.get(3)?,
                        status: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(device)
    }

    /// Whether a device with this serial number is registered
    ///
    /// # Errors
    ///
    /// Returns an error on query failure.
    pub fn exists(&self, sn: &str) -> Result<bool> {
        Ok(self.get(sn)?.is_some())
    }

    /// Insert or update a device
    ///
    /// # Errors
    ///
    /// Returns an error on statement failure.
    pub fn upsert(&self, device: &Device) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let status = if device.status.is_empty() {
            status::INACTIVATED
        } else {
            device.status.as_str()
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO devices (sn, vendor, device_type, name, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(sn) DO UPDATE SET
                vendor = excluded.vendor,
                device_type = excluded.device_type,
                name = excluded.name,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![device.sn, device.vendor, device.device_type, device.name, status, now],
        )?;
        Ok(())
    }

    /// Delete a device; returns whether a row was removed
    ///
    /// # Errors
    ///
    /// Returns an error on statement failure.
    pub fn delete(&self, sn: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM devices WHERE sn = ?1", params![sn])?;
        Ok(removed > 0)
    }
}
