use chrono::Utc;

/// Random URL-safe token of `len` bytes of entropy
pub fn generate_token(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

/// Current time as Unix milliseconds, the unit the lock store keeps
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
