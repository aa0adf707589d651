use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("siswadata.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            user_id TEXT,
            nisn TEXT NOT NULL,
            nik TEXT,
            nama TEXT NOT NULL,
            tempat_lahir TEXT,
            tanggal_lahir TEXT,
            jenis_kelamin TEXT,
            agama TEXT,
            alamat TEXT,
            rt TEXT,
            rw TEXT,
            kelurahan TEXT,
            kecamatan TEXT,
            kota TEXT,
            provinsi TEXT,
            kode_pos TEXT,
            nama_ayah TEXT,
            nik_ayah TEXT,
            nama_ibu TEXT,
            nik_ibu TEXT,
            no_hp TEXT,
            email TEXT,
            is_verified INTEGER NOT NULL DEFAULT 0,
            verified_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    // NISN is a natural key but intentionally NOT unique at the schema level:
    // bulk imports from school operators regularly carry duplicates, and the
    // dedup cleanup routine is the place that resolves them.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_nisn ON students(nisn)",
        [],
    )?;
    ensure_students_contact_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_salt BLOB NOT NULL,
            password_hash BLOB NOT NULL,
            role TEXT NOT NULL,
            student_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_student ON users(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            token_hash BLOB PRIMARY KEY,
            user_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            revoked_at INTEGER,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS change_requests(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            reason TEXT NOT NULL,
            original_data TEXT NOT NULL,
            proposed_changes TEXT,
            admin_notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_change_requests_student ON change_requests(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_change_requests_status ON change_requests(status)",
        [],
    )?;
    ensure_change_requests_admin_notes(&conn)?;

    // No foreign key on student_id: audit entries must outlive the rows they
    // describe (dedup cleanup deletes students, the log stays).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            student_name TEXT NOT NULL,
            actor_email TEXT NOT NULL,
            action TEXT NOT NULL,
            changes TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_student ON audit_log(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_created ON audit_log(created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_scores(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            exam_kind TEXT NOT NULL,
            subject TEXT NOT NULL,
            score REAL NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(student_id, exam_kind, subject),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_scores_student ON exam_scores(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_contact_columns(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces predate self-service contact updates.
    if !table_has_column(conn, "students", "no_hp")? {
        conn.execute("ALTER TABLE students ADD COLUMN no_hp TEXT", [])?;
    }
    if !table_has_column(conn, "students", "email")? {
        conn.execute("ALTER TABLE students ADD COLUMN email TEXT", [])?;
    }
    Ok(())
}

fn ensure_change_requests_admin_notes(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "change_requests", "admin_notes")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE change_requests ADD COLUMN admin_notes TEXT", [])?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    use rusqlite::OptionalExtension;
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, &raw),
    )?;
    Ok(())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
