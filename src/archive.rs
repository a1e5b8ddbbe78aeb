// src/archive.rs
//
// =============================================================================
// GRAVITATION: SNAPSHOT ARCHIVE
// =============================================================================
//
// The Persistence Layer.
//
// Architecture:
// - SQLite using the "hybrid relational" pattern.
// - Hot fields (length, dtype) are columns.
// - Datasets (r, v, m, name) are raw little-endian BLOBs in the
//   snapshot's dtype.
// - Attributes are canonical JSON text.
// - Group identity is the canonical-JSON group name; the PRIMARY KEY
//   rejects duplicate writes atomically, even across processes.
// - HPC-safe journaling (DELETE mode) plus a generous busy timeout:
//   workers append while the driver reads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::errors::StorageError;
use crate::mass::DIMS;
use crate::platform::Platform;
use crate::variation::{Dtype, Variation};

// ============================================================================
// 1. GROUP KEYS
// ============================================================================

/// Identity of one snapshot: the run point it was taken at. Encoded as
/// canonical JSON (sorted keys, no whitespace) to name the group; two
/// snapshots are the same run point iff their encoded keys are equal.
///
/// Variation and platform are optional so that the driver's shared
/// zero-state groups (`kernel="zero"`) stay addressable by every
/// worker regardless of its own configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupKey {
    pub kernel: String,
    pub length: u64,
    pub iteration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<Variation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl GroupKey {
    pub fn new(
        kernel: impl Into<String>,
        length: u64,
        iteration: u64,
        variation: Variation,
        platform: Platform,
    ) -> Self {
        Self {
            kernel: kernel.into(),
            length,
            iteration,
            variation: Some(variation),
            platform: Some(platform),
        }
    }

    /// Key of a shared initial state written by the driver.
    pub fn zero(length: u64) -> Self {
        Self {
            kernel: "zero".into(),
            length,
            iteration: 0,
            variation: None,
            platform: None,
        }
    }

    /// Canonical JSON group name. Routed through `serde_json::Value`
    /// so keys come out sorted at every nesting level.
    pub fn encode(&self) -> String {
        serde_json::to_value(self)
            .expect("group key fields are always serializable")
            .to_string()
    }

    pub fn decode(raw: &str) -> Result<Self, StorageError> {
        serde_json::from_str(raw)
            .map_err(|_| StorageError::MalformedGroup(format!("unparsable group name: {raw}")))
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

// ============================================================================
// 2. SNAPSHOT PAYLOAD
// ============================================================================

/// Group attributes. `variation` and `platform` are stored as their
/// canonical JSON strings; anything the universe carried in `meta`
/// rides along untyped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotAttrs {
    pub scale_m: f64,
    pub scale_r: f64,
    pub t: f64,
    #[serde(rename = "T")]
    pub t_step: f64,
    #[serde(rename = "G")]
    pub g: f64,
    pub variation: String,
    pub platform: String,
    pub iteration: u64,
    #[serde(flatten)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

/// One serialized universe state: per-body datasets plus attributes.
/// Scalars are held as f64 in memory; the archive narrows them to the
/// snapshot's dtype on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub dtype: Dtype,
    pub names: Vec<String>,
    pub r: Vec<[f64; DIMS]>,
    pub v: Vec<[f64; DIMS]>,
    pub m: Vec<f64>,
    pub attrs: SnapshotAttrs,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.m.len()
    }

    pub fn is_empty(&self) -> bool {
        self.m.is_empty()
    }
}

// ============================================================================
// 3. THE ARCHIVE
// ============================================================================

pub struct SnapshotArchive {
    path: PathBuf,
}

impl SnapshotArchive {
    /// Opens (and if necessary initializes) an archive file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let archive = Self {
            path: path.as_ref().to_path_buf(),
        };
        archive.init()?;
        Ok(archive)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                grp        TEXT PRIMARY KEY,
                length     INTEGER NOT NULL,
                dtype      TEXT NOT NULL,
                name_width INTEGER NOT NULL,
                r          BLOB NOT NULL,
                v          BLOB NOT NULL,
                m          BLOB NOT NULL,
                name       BLOB NOT NULL,
                attrs      TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// One connection per operation: write-and-close append semantics,
    /// safe for the worker/driver/verifier sharing one file.
    fn conn(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open(&self.path)?;
        // DELETE journal mode avoids WAL sidecars on shared filesystems;
        // the busy timeout covers reader/writer contention.
        conn.execute_batch(
            "PRAGMA journal_mode=DELETE;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;",
        )?;
        Ok(conn)
    }

    /// Writes one snapshot under its group name. At most one snapshot
    /// may exist per key; a second write fails.
    pub fn write(&self, key: &GroupKey, snapshot: &Snapshot) -> Result<(), StorageError> {
        let group = key.encode();
        let length = snapshot.len();
        if snapshot.r.len() != length || snapshot.v.len() != length || snapshot.names.len() != length
        {
            return Err(StorageError::MalformedGroup(format!(
                "dataset lengths disagree in {group}"
            )));
        }

        let dtype = snapshot.dtype;
        let r = encode_vectors(&snapshot.r, dtype);
        let v = encode_vectors(&snapshot.v, dtype);
        let m = encode_scalars(&snapshot.m, dtype);
        let (name, name_width) = encode_names(&snapshot.names);
        let attrs = serde_json::to_string(&snapshot.attrs)?;

        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO snapshots (grp, length, dtype, name_width, r, v, m, name, attrs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                group,
                length as i64,
                dtype.name(),
                name_width as i64,
                r,
                v,
                m,
                name,
                attrs
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::DuplicateGroup(group))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Loads one snapshot by group name.
    pub fn read(&self, key: &GroupKey) -> Result<Snapshot, StorageError> {
        let group = key.encode();
        let conn = self.conn()?;

        let row = conn
            .query_row(
                "SELECT length, dtype, name_width, r, v, m, name, attrs
                 FROM snapshots WHERE grp = ?1",
                params![group],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                        row.get::<_, Vec<u8>>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| StorageError::MissingGroup(group.clone()))?;

        let (length, dtype_name, name_width, r, v, m, name, attrs) = row;
        let length = length as usize;
        let dtype = Dtype::parse(&dtype_name)
            .ok_or_else(|| StorageError::MalformedGroup(format!("unknown dtype in {group}")))?;

        let attrs: SnapshotAttrs = serde_json::from_str(&attrs)
            .map_err(|_| StorageError::MalformedGroup(format!("unreadable attributes in {group}")))?;
        if attrs.variation.is_empty() || attrs.platform.is_empty() {
            return Err(StorageError::MalformedGroup(format!(
                "empty attributes in {group}"
            )));
        }

        let snapshot = Snapshot {
            dtype,
            names: decode_names(&name, name_width as usize, length, &group)?,
            r: decode_vectors(&r, dtype, length, &group)?,
            v: decode_vectors(&v, dtype, length, &group)?,
            m: decode_scalars(&m, dtype, length, &group)?,
            attrs,
        };
        Ok(snapshot)
    }

    pub fn contains(&self, key: &GroupKey) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM snapshots WHERE grp = ?1",
                params![key.encode()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All group keys in the archive, in insertion order.
    pub fn groups(&self) -> Result<Vec<GroupKey>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT grp FROM snapshots ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(GroupKey::decode(&row?)?);
        }
        Ok(keys)
    }
}

// ============================================================================
// 4. DATASET ENCODING
// ============================================================================
//
// float32 -> little-endian 4 byte, float64 -> little-endian 8 byte.
// Narrowing to f32 happens here, so snapshot precision matches the
// variation's dtype no matter what the kernel computed in.

fn encode_scalars(values: &[f64], dtype: Dtype) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * dtype.width());
    for &value in values {
        match dtype {
            Dtype::Float32 => bytes.extend_from_slice(&(value as f32).to_le_bytes()),
            Dtype::Float64 => bytes.extend_from_slice(&value.to_le_bytes()),
        }
    }
    bytes
}

fn encode_vectors(vectors: &[[f64; DIMS]], dtype: Dtype) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vectors.len() * DIMS * dtype.width());
    for vector in vectors {
        for &component in vector {
            match dtype {
                Dtype::Float32 => bytes.extend_from_slice(&(component as f32).to_le_bytes()),
                Dtype::Float64 => bytes.extend_from_slice(&component.to_le_bytes()),
            }
        }
    }
    bytes
}

fn decode_raw(bytes: &[u8], dtype: Dtype, count: usize, group: &str) -> Result<Vec<f64>, StorageError> {
    if bytes.len() != count * dtype.width() {
        return Err(StorageError::MalformedGroup(format!(
            "dataset size mismatch in {group}: expected {} scalars",
            count
        )));
    }
    let values = bytes
        .chunks_exact(dtype.width())
        .map(|chunk| match dtype {
            Dtype::Float32 => f32::from_le_bytes(chunk.try_into().expect("chunk width")) as f64,
            Dtype::Float64 => f64::from_le_bytes(chunk.try_into().expect("chunk width")),
        })
        .collect();
    Ok(values)
}

fn decode_scalars(bytes: &[u8], dtype: Dtype, length: usize, group: &str) -> Result<Vec<f64>, StorageError> {
    decode_raw(bytes, dtype, length, group)
}

fn decode_vectors(
    bytes: &[u8],
    dtype: Dtype,
    length: usize,
    group: &str,
) -> Result<Vec<[f64; DIMS]>, StorageError> {
    let flat = decode_raw(bytes, dtype, length * DIMS, group)?;
    Ok(flat
        .chunks_exact(DIMS)
        .map(|chunk| [chunk[0], chunk[1], chunk[2]])
        .collect())
}

/// Names go out as fixed-width UTF-8, zero-padded to the longest name.
fn encode_names(names: &[String]) -> (Vec<u8>, usize) {
    let width = names.iter().map(|name| name.len()).max().unwrap_or(0).max(1);
    let mut bytes = vec![0u8; names.len() * width];
    for (index, name) in names.iter().enumerate() {
        bytes[index * width..index * width + name.len()].copy_from_slice(name.as_bytes());
    }
    (bytes, width)
}

fn decode_names(
    bytes: &[u8],
    width: usize,
    length: usize,
    group: &str,
) -> Result<Vec<String>, StorageError> {
    if width == 0 || bytes.len() != length * width {
        return Err(StorageError::MalformedGroup(format!(
            "name dataset size mismatch in {group}"
        )));
    }
    bytes
        .chunks_exact(width)
        .map(|chunk| {
            let trimmed = chunk.split(|&b| b == 0).next().unwrap_or(chunk);
            String::from_utf8(trimmed.to_vec())
                .map_err(|_| StorageError::MalformedGroup(format!("non-UTF-8 name in {group}")))
        })
        .collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variation::{Target, Threads};

    fn sample_snapshot(dtype: Dtype) -> Snapshot {
        let variation = Variation::new(dtype, Target::Cpu, Threads::Single);
        Snapshot {
            dtype,
            names: vec!["back hole".into(), "disk star".into()],
            r: vec![[0.0, 0.0, 0.0], [1.5, -2.25, 0.125]],
            v: vec![[0.0, 0.0, 0.0], [0.5, 0.25, -0.75]],
            m: vec![4.0e10, 2.0],
            attrs: SnapshotAttrs {
                scale_m: 1.0e-30,
                scale_r: 1.0e-10,
                t: 0.0,
                t_step: 2.0e12,
                g: 6.6740831e-11,
                variation: variation.to_json(),
                platform: Platform::current().to_json(),
                iteration: 0,
                meta: BTreeMap::new(),
            },
        }
    }

    fn scratch_archive() -> (tempfile::TempDir, SnapshotArchive) {
        let dir = tempfile::tempdir().unwrap();
        let archive = SnapshotArchive::open(dir.path().join("data.db")).unwrap();
        (dir, archive)
    }

    #[test]
    fn round_trip_is_bit_exact_for_f64() {
        let (_dir, archive) = scratch_archive();
        let key = GroupKey::zero(2);
        let snapshot = sample_snapshot(Dtype::Float64);

        archive.write(&key, &snapshot).unwrap();
        let loaded = archive.read(&key).unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn f32_round_trip_narrows_to_dtype_precision() {
        let (_dir, archive) = scratch_archive();
        let key = GroupKey::zero(2);
        let snapshot = sample_snapshot(Dtype::Float32);

        archive.write(&key, &snapshot).unwrap();
        let loaded = archive.read(&key).unwrap();

        for (stored, original) in loaded.r.iter().flatten().zip(snapshot.r.iter().flatten()) {
            assert_eq!(*stored, *original as f32 as f64);
        }
        assert_eq!(loaded.names, snapshot.names);
    }

    #[test]
    fn duplicate_write_is_rejected() {
        let (_dir, archive) = scratch_archive();
        let key = GroupKey::zero(2);
        let snapshot = sample_snapshot(Dtype::Float64);

        archive.write(&key, &snapshot).unwrap();
        let err = archive.write(&key, &snapshot).unwrap_err();
        assert!(matches!(err, StorageError::DuplicateGroup(_)));
    }

    #[test]
    fn missing_group_is_an_error() {
        let (_dir, archive) = scratch_archive();
        let err = archive.read(&GroupKey::zero(99)).unwrap_err();
        assert!(matches!(err, StorageError::MissingGroup(_)));
        assert!(!archive.contains(&GroupKey::zero(99)).unwrap());
    }

    #[test]
    fn group_keys_survive_listing() {
        let (_dir, archive) = scratch_archive();
        let snapshot = sample_snapshot(Dtype::Float64);
        let zero = GroupKey::zero(2);
        let full = GroupKey::new(
            "naive",
            2,
            3,
            Variation::default(),
            Platform::current().clone(),
        );

        archive.write(&zero, &snapshot).unwrap();
        archive.write(&full, &snapshot).unwrap();

        let groups = archive.groups().unwrap();
        assert_eq!(groups, vec![zero, full]);
    }

    #[test]
    fn zero_key_omits_variation_and_platform() {
        let encoded = GroupKey::zero(16).encode();
        assert_eq!(
            encoded,
            r#"{"iteration":0,"kernel":"zero","length":16}"#
        );
        assert_eq!(GroupKey::decode(&encoded).unwrap(), GroupKey::zero(16));
    }
}
