//
// Small stdlib-adjacent helpers shared across modules.
//
// No Rocket fairings, cache headers, or upcase-deserialize JSON shim here —
// there's no web front-end in this crate. What's left is env parsing (used
// by config.rs), file I/O (used by the QR pair manager), and date
// formatting (used by session expiry checks).

use std::fs::{self, File};
use std::io::{Read as IoRead, Result as IOResult, Write as IoWrite};
use std::path::Path;
use std::str::FromStr;
use std::thread::sleep;
use std::time::Duration;

//
// File handling
//

pub fn file_exists(path: &str) -> bool {
    Path::new(path).exists()
}

pub fn read_file(path: &str) -> IOResult<Vec<u8>> {
    let mut contents: Vec<u8> = Vec::new();
    let mut file = File::open(Path::new(path))?;
    file.read_to_end(&mut contents)?;
    Ok(contents)
}

pub fn read_file_string(path: &str) -> IOResult<String> {
    let mut contents = String::new();
    let mut file = File::open(Path::new(path))?;
    file.read_to_string(&mut contents)?;
    Ok(contents)
}

pub fn write_file(path: &str, content: &[u8]) -> Result<(), crate::error::Error> {
    let mut f = File::create(path)?;
    f.write_all(content)?;
    f.flush()?;
    Ok(())
}

/// Writes to a sibling temp file and renames it into place, so a reader
/// polling `path` never observes a partially written frame.
pub fn write_file_atomic(path: &str, content: &[u8]) -> Result<(), crate::error::Error> {
    let tmp_path = format!("{path}.tmp-{}", get_uuid());
    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(content)?;
        f.flush()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn delete_file(path: &str) -> IOResult<()> {
    fs::remove_file(path)
}

pub fn ensure_dir(path: &str) -> IOResult<()> {
    fs::create_dir_all(path)
}

pub fn get_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

//
// String util methods
//

pub fn try_parse_string<S, T>(string: Option<S>) -> Option<T>
where
    S: AsRef<str>,
    T: FromStr,
{
    if let Some(Ok(value)) = string.map(|s| s.as_ref().parse::<T>()) {
        Some(value)
    } else {
        None
    }
}

//
// Env methods
//

use std::env;

pub fn get_env_str_value(key: &str) -> Option<String> {
    let key_file = format!("{key}_FILE");
    let value_from_env = env::var(key);
    let value_file = env::var(&key_file);

    match (value_from_env, value_file) {
        (Ok(_), Ok(_)) => panic!("You should not define both {key} and {key_file}!"),
        (Ok(v_env), Err(_)) => Some(v_env),
        (Err(_), Ok(v_file)) => match fs::read_to_string(v_file) {
            Ok(content) => Some(content.trim().to_string()),
            Err(e) => panic!("Failed to load {key}: {e:?}"),
        },
        _ => None,
    }
}

pub fn get_env<V>(key: &str) -> Option<V>
where
    V: FromStr,
{
    try_parse_string(get_env_str_value(key))
}

pub fn get_env_bool(key: &str) -> Option<bool> {
    const TRUE_VALUES: &[&str] = &["true", "t", "yes", "y", "1"];
    const FALSE_VALUES: &[&str] = &["false", "f", "no", "n", "0"];

    match get_env_str_value(key) {
        Some(val) if TRUE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(true),
        Some(val) if FALSE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(false),
        _ => None,
    }
}

//
// Date util methods
//

use chrono::{DateTime, Utc};

pub fn format_date(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

//
// Retry methods
//

pub fn retry<F, T, E>(func: F, max_tries: u32) -> Result<T, E>
where
    F: Fn() -> Result<T, E>,
{
    let mut tries = 0;

    loop {
        match func() {
            ok @ Ok(_) => return ok,
            err @ Err(_) => {
                tries += 1;
                if tries >= max_tries {
                    return err;
                }
                sleep(Duration::from_millis(500));
            }
        }
    }
}
