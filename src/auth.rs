use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};

pub const SESSION_TTL_SECS: i64 = 60 * 60 * 24 * 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Admin,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

/// Resolved caller identity: the output of token verification, all a gated
/// handler ever needs to see.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
    pub role: Role,
    pub student_id: Option<String>,
}

/// URL-safe token from 32 OS-random bytes. Only its SHA-256 is stored.
pub fn generate_token() -> String {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

pub fn hash_token(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

pub fn new_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn hash_password(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

pub fn hashes_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn create_session(conn: &Connection, user_id: &str, now: i64) -> anyhow::Result<String> {
    let token = generate_token();
    let hash = hash_token(&token);
    conn.execute(
        "INSERT INTO sessions(token_hash, user_id, created_at, expires_at)
         VALUES(?, ?, ?, ?)",
        rusqlite::params![hash.as_slice(), user_id, now, now + SESSION_TTL_SECS],
    )?;
    Ok(token)
}

pub fn revoke_session(conn: &Connection, token: &str, now: i64) -> anyhow::Result<bool> {
    let hash = hash_token(token);
    let n = conn.execute(
        "UPDATE sessions SET revoked_at = ? WHERE token_hash = ? AND revoked_at IS NULL",
        rusqlite::params![now, hash.as_slice()],
    )?;
    Ok(n > 0)
}

/// Opaque token -> caller identity, or None for unknown/expired/revoked.
pub fn authenticate(conn: &Connection, token: &str, now: i64) -> anyhow::Result<Option<Identity>> {
    let hash = hash_token(token);
    let row = conn
        .query_row(
            "SELECT u.id, u.email, u.role, u.student_id
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token_hash = ?
               AND s.expires_at > ?
               AND s.revoked_at IS NULL",
            rusqlite::params![hash.as_slice(), now],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((user_id, email, role, student_id)) = row else {
        return Ok(None);
    };
    let Some(role) = Role::parse(&role) else {
        anyhow::bail!("user {} has unrecognized role {}", user_id, role);
    };
    Ok(Some(Identity {
        user_id,
        email,
        role,
        student_id,
    }))
}

pub fn verify_login(
    conn: &Connection,
    email: &str,
    password: &str,
) -> anyhow::Result<Option<(String, Role, Option<String>)>> {
    let row = conn
        .query_row(
            "SELECT id, password_salt, password_hash, role, student_id
             FROM users WHERE email = ?",
            [email],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Vec<u8>>(1)?,
                    r.get::<_, Vec<u8>>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((user_id, salt, stored, role, student_id)) = row else {
        return Ok(None);
    };
    let candidate = hash_password(&salt, password);
    if !hashes_equal(&candidate, &stored) {
        return Ok(None);
    }
    let Some(role) = Role::parse(&role) else {
        anyhow::bail!("user {} has unrecognized role {}", user_id, role);
    };
    Ok(Some((user_id, role, student_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_url_safe_no_pad() {
        let t = generate_token();
        assert!(t
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(t.len() >= 40);
    }

    #[test]
    fn password_hash_depends_on_salt() {
        let s1 = [1u8; 16];
        let s2 = [2u8; 16];
        assert_ne!(hash_password(&s1, "pw"), hash_password(&s2, "pw"));
        assert_eq!(hash_password(&s1, "pw"), hash_password(&s1, "pw"));
    }

    #[test]
    fn hashes_equal_rejects_length_mismatch() {
        let h = hash_token("abc");
        assert!(hashes_equal(&h, &h));
        assert!(!hashes_equal(&h, &h[..16]));
    }
}
