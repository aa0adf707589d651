use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Map, Value};

/// The editable demographic/contact fields, in column order. Identity and
/// bookkeeping columns (id, user_id, is_verified, verified_at, created_at,
/// updated_at) are deliberately not listed: everything that diffs, patches,
/// or imports goes through this list and can never touch them.
pub const EDITABLE_FIELDS: &[&str] = &[
    "nisn",
    "nik",
    "nama",
    "tempat_lahir",
    "tanggal_lahir",
    "jenis_kelamin",
    "agama",
    "alamat",
    "rt",
    "rw",
    "kelurahan",
    "kecamatan",
    "kota",
    "provinsi",
    "kode_pos",
    "nama_ayah",
    "nik_ayah",
    "nama_ibu",
    "nik_ibu",
    "no_hp",
    "email",
];

/// Fields a student may change about themselves without going through the
/// change-request workflow.
pub const SELF_SERVICE_FIELDS: &[&str] = &["no_hp", "email", "alamat"];

#[derive(Debug, Clone)]
pub struct Student {
    pub id: String,
    pub user_id: Option<String>,
    pub nisn: String,
    pub nik: Option<String>,
    pub nama: String,
    pub tempat_lahir: Option<String>,
    pub tanggal_lahir: Option<String>,
    pub jenis_kelamin: Option<String>,
    pub agama: Option<String>,
    pub alamat: Option<String>,
    pub rt: Option<String>,
    pub rw: Option<String>,
    pub kelurahan: Option<String>,
    pub kecamatan: Option<String>,
    pub kota: Option<String>,
    pub provinsi: Option<String>,
    pub kode_pos: Option<String>,
    pub nama_ayah: Option<String>,
    pub nik_ayah: Option<String>,
    pub nama_ibu: Option<String>,
    pub nik_ibu: Option<String>,
    pub no_hp: Option<String>,
    pub email: Option<String>,
    pub is_verified: bool,
    pub verified_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Student {
    pub fn blank(id: String, now: &str) -> Self {
        Student {
            id,
            user_id: None,
            nisn: String::new(),
            nik: None,
            nama: String::new(),
            tempat_lahir: None,
            tanggal_lahir: None,
            jenis_kelamin: None,
            agama: None,
            alamat: None,
            rt: None,
            rw: None,
            kelurahan: None,
            kecamatan: None,
            kota: None,
            provinsi: None,
            kode_pos: None,
            nama_ayah: None,
            nik_ayah: None,
            nama_ibu: None,
            nik_ibu: None,
            no_hp: None,
            email: None,
            is_verified: false,
            verified_at: None,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }

    /// Value of an editable field, or None if the name is not editable.
    pub fn field_value(&self, name: &str) -> Option<Option<String>> {
        let v = match name {
            "nisn" => Some(self.nisn.clone()),
            "nik" => self.nik.clone(),
            "nama" => Some(self.nama.clone()),
            "tempat_lahir" => self.tempat_lahir.clone(),
            "tanggal_lahir" => self.tanggal_lahir.clone(),
            "jenis_kelamin" => self.jenis_kelamin.clone(),
            "agama" => self.agama.clone(),
            "alamat" => self.alamat.clone(),
            "rt" => self.rt.clone(),
            "rw" => self.rw.clone(),
            "kelurahan" => self.kelurahan.clone(),
            "kecamatan" => self.kecamatan.clone(),
            "kota" => self.kota.clone(),
            "provinsi" => self.provinsi.clone(),
            "kode_pos" => self.kode_pos.clone(),
            "nama_ayah" => self.nama_ayah.clone(),
            "nik_ayah" => self.nik_ayah.clone(),
            "nama_ibu" => self.nama_ibu.clone(),
            "nik_ibu" => self.nik_ibu.clone(),
            "no_hp" => self.no_hp.clone(),
            "email" => self.email.clone(),
            _ => return None,
        };
        Some(v)
    }

    pub fn set_field(&mut self, name: &str, value: Option<String>) -> Result<(), String> {
        match name {
            "nisn" | "nama" => {
                let Some(v) = value.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
                    return Err(format!("{} must not be empty", name));
                };
                if name == "nisn" {
                    self.nisn = v.to_string();
                } else {
                    self.nama = v.to_string();
                }
                Ok(())
            }
            _ => {
                let v = value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
                let slot = match name {
                    "nik" => &mut self.nik,
                    "tempat_lahir" => &mut self.tempat_lahir,
                    "tanggal_lahir" => &mut self.tanggal_lahir,
                    "jenis_kelamin" => &mut self.jenis_kelamin,
                    "agama" => &mut self.agama,
                    "alamat" => &mut self.alamat,
                    "rt" => &mut self.rt,
                    "rw" => &mut self.rw,
                    "kelurahan" => &mut self.kelurahan,
                    "kecamatan" => &mut self.kecamatan,
                    "kota" => &mut self.kota,
                    "provinsi" => &mut self.provinsi,
                    "kode_pos" => &mut self.kode_pos,
                    "nama_ayah" => &mut self.nama_ayah,
                    "nik_ayah" => &mut self.nik_ayah,
                    "nama_ibu" => &mut self.nama_ibu,
                    "nik_ibu" => &mut self.nik_ibu,
                    "no_hp" => &mut self.no_hp,
                    "email" => &mut self.email,
                    _ => return Err(format!("unknown field: {}", name)),
                };
                *slot = v;
                Ok(())
            }
        }
    }

    /// Apply a partial field map. Keys must be editable field names; values
    /// must be strings or null. The record is only mutated if every entry is
    /// valid, so a failed patch leaves the caller's copy untouched.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        for (k, v) in patch {
            match v {
                Value::String(_) | Value::Null => {}
                _ => return Err(format!("{} must be a string or null", k)),
            }
        }
        let mut next = self.clone();
        for (k, v) in patch {
            next.set_field(k, v.as_str().map(|s| s.to_string()))?;
        }
        *self = next;
        Ok(())
    }

    /// Field-level diff over the editable list: `field -> {old, new}` for
    /// every changed field. Bookkeeping columns are not in the list, so they
    /// never show up here no matter how the two records differ.
    pub fn diff(before: &Student, after: &Student) -> Map<String, Value> {
        let mut out = Map::new();
        for name in EDITABLE_FIELDS {
            let old = before.field_value(name).unwrap_or(None);
            let new = after.field_value(name).unwrap_or(None);
            if old != new {
                out.insert(
                    name.to_string(),
                    json!({ "old": old, "new": new }),
                );
            }
        }
        out
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".into(), json!(self.id));
        obj.insert("userId".into(), json!(self.user_id));
        for name in EDITABLE_FIELDS {
            obj.insert(name.to_string(), json!(self.field_value(name).unwrap_or(None)));
        }
        obj.insert("isVerified".into(), json!(self.is_verified));
        obj.insert("verifiedAt".into(), json!(self.verified_at));
        obj.insert("createdAt".into(), json!(self.created_at));
        obj.insert("updatedAt".into(), json!(self.updated_at));
        Value::Object(obj)
    }
}

const SELECT_COLS: &str = "id, user_id, nisn, nik, nama, tempat_lahir, tanggal_lahir, \
     jenis_kelamin, agama, alamat, rt, rw, kelurahan, kecamatan, kota, provinsi, kode_pos, \
     nama_ayah, nik_ayah, nama_ibu, nik_ibu, no_hp, email, is_verified, verified_at, \
     created_at, updated_at";

fn from_row(row: &Row) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        user_id: row.get(1)?,
        nisn: row.get(2)?,
        nik: row.get(3)?,
        nama: row.get(4)?,
        tempat_lahir: row.get(5)?,
        tanggal_lahir: row.get(6)?,
        jenis_kelamin: row.get(7)?,
        agama: row.get(8)?,
        alamat: row.get(9)?,
        rt: row.get(10)?,
        rw: row.get(11)?,
        kelurahan: row.get(12)?,
        kecamatan: row.get(13)?,
        kota: row.get(14)?,
        provinsi: row.get(15)?,
        kode_pos: row.get(16)?,
        nama_ayah: row.get(17)?,
        nik_ayah: row.get(18)?,
        nama_ibu: row.get(19)?,
        nik_ibu: row.get(20)?,
        no_hp: row.get(21)?,
        email: row.get(22)?,
        is_verified: row.get::<_, i64>(23)? != 0,
        verified_at: row.get(24)?,
        created_at: row.get(25)?,
        updated_at: row.get(26)?,
    })
}

pub fn get(conn: &Connection, id: &str) -> anyhow::Result<Option<Student>> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", SELECT_COLS);
    Ok(conn.query_row(&sql, [id], from_row).optional()?)
}

pub fn get_by_nisn(conn: &Connection, nisn: &str) -> anyhow::Result<Option<Student>> {
    // Duplicates can exist until the dedup routine runs; prefer the row
    // touched most recently.
    let sql = format!(
        "SELECT {} FROM students WHERE nisn = ? ORDER BY updated_at DESC, created_at DESC LIMIT 1",
        SELECT_COLS
    );
    Ok(conn.query_row(&sql, [nisn], from_row).optional()?)
}

pub fn list(conn: &Connection) -> anyhow::Result<Vec<Student>> {
    let sql = format!("SELECT {} FROM students ORDER BY nama, nisn", SELECT_COLS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn insert(conn: &Connection, s: &Student) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO students(
            id, user_id, nisn, nik, nama, tempat_lahir, tanggal_lahir, jenis_kelamin,
            agama, alamat, rt, rw, kelurahan, kecamatan, kota, provinsi, kode_pos,
            nama_ayah, nik_ayah, nama_ibu, nik_ibu, no_hp, email,
            is_verified, verified_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            s.id,
            s.user_id,
            s.nisn,
            s.nik,
            s.nama,
            s.tempat_lahir,
            s.tanggal_lahir,
            s.jenis_kelamin,
            s.agama,
            s.alamat,
            s.rt,
            s.rw,
            s.kelurahan,
            s.kecamatan,
            s.kota,
            s.provinsi,
            s.kode_pos,
            s.nama_ayah,
            s.nik_ayah,
            s.nama_ibu,
            s.nik_ibu,
            s.no_hp,
            s.email,
            s.is_verified as i64,
            s.verified_at,
            s.created_at,
            s.updated_at,
        ],
    )?;
    Ok(())
}

/// Persist the editable fields (plus updated_at). Verification state and
/// identity columns are written by their own dedicated operations.
pub fn save_fields(conn: &Connection, s: &Student, now: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE students SET
            nisn = ?, nik = ?, nama = ?, tempat_lahir = ?, tanggal_lahir = ?,
            jenis_kelamin = ?, agama = ?, alamat = ?, rt = ?, rw = ?, kelurahan = ?,
            kecamatan = ?, kota = ?, provinsi = ?, kode_pos = ?, nama_ayah = ?,
            nik_ayah = ?, nama_ibu = ?, nik_ibu = ?, no_hp = ?, email = ?,
            updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            s.nisn,
            s.nik,
            s.nama,
            s.tempat_lahir,
            s.tanggal_lahir,
            s.jenis_kelamin,
            s.agama,
            s.alamat,
            s.rt,
            s.rw,
            s.kelurahan,
            s.kecamatan,
            s.kota,
            s.provinsi,
            s.kode_pos,
            s.nama_ayah,
            s.nik_ayah,
            s.nama_ibu,
            s.nik_ibu,
            s.no_hp,
            s.email,
            now,
            s.id,
        ],
    )?;
    Ok(())
}
