use getrandom::getrandom;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Random lowercase base36 string of `len` characters.
pub fn random_base36(len: usize) -> Result<String, getrandom::Error> {
    let mut bytes = vec![0u8; len];
    getrandom(&mut bytes)?;
    Ok(bytes
        .iter()
        .map(|b| BASE36[(*b as usize) % BASE36.len()] as char)
        .collect())
}
