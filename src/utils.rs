use chrono::{DateTime, Utc};

/// Generate a shared identifier of the form
/// `<prefix>-<UTC-YYYYMMDDThhmmss>-<5 random bytes hex>`. These IDs are
/// shared with the control plane in logs, so they carry no transport
/// secrets.
pub fn generate_shared_id(prefix: &str, now: DateTime<Utc>) -> String {
    let rnd: [u8; 5] = rand::random();
    let hex: String = rnd.iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}-{}-{hex}", now.format("%Y%m%dT%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_id_shape() {
        let now = "2026-03-01T12:34:56Z".parse().unwrap();
        let id = generate_shared_id("ssh-conn", now);
        assert!(id.starts_with("ssh-conn-20260301T123456-"));
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 10);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn shared_ids_are_unique() {
        let now = Utc::now();
        assert_ne!(
            generate_shared_id("sess", now),
            generate_shared_id("sess", now)
        );
    }
}
