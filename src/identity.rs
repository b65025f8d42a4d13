//! Identity directory: credential storage and verification, kept apart
//! from the profile table the way the original system kept its auth
//! provider apart from application data. Handlers treat calls here as
//! delegated upstream operations; failure messages travel to the caller
//! verbatim.

use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug)]
pub struct IdentityError(pub String);

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn encode(salt: &str, password: &str) -> String {
    format!("{}${}", salt, hash_password(salt, password))
}

fn matches(stored: &str, password: &str) -> bool {
    let Some((salt, hash)) = stored.split_once('$') else {
        return false;
    };
    hash_password(salt, password) == hash
}

/// Create the credential record for a new profile.
pub fn register(conn: &Connection, profile_id: &str, password: &str) -> Result<(), IdentityError> {
    let salt = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO auth_users(profile_id, password_hash) VALUES(?, ?)",
        (profile_id, encode(&salt, password)),
    )
    .map_err(|e| IdentityError(e.to_string()))?;
    Ok(())
}

/// Administrative credential update for an existing user.
pub fn set_password(
    conn: &Connection,
    profile_id: &str,
    new_password: &str,
) -> Result<(), IdentityError> {
    let salt = Uuid::new_v4().to_string();
    let changed = conn
        .execute(
            "UPDATE auth_users SET password_hash = ? WHERE profile_id = ?",
            (encode(&salt, new_password), profile_id),
        )
        .map_err(|e| IdentityError(e.to_string()))?;
    if changed == 0 {
        return Err(IdentityError(format!(
            "no identity record for user {}",
            profile_id
        )));
    }
    Ok(())
}

/// True when the password matches the stored credential. A missing
/// credential record verifies false rather than erroring so login cannot
/// distinguish unknown users from wrong passwords.
pub fn verify(conn: &Connection, profile_id: &str, password: &str) -> Result<bool, IdentityError> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT password_hash FROM auth_users WHERE profile_id = ?",
            [profile_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| IdentityError(e.to_string()))?;
    Ok(stored.map(|s| matches(&s, password)).unwrap_or(false))
}
