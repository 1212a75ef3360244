use crate::peer::types::ServerConfig;
use rand::Rng;

/// Random 16-hex-digit identifier, used for call ids
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Milliseconds since the Unix epoch, as carried in the signaling envelope
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    // Если url уже начинается с "turn:" или "stun:", возвращаем как есть
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        // В зависимости от типа сервера добавляем нужную схему
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: &str, url: &str) -> ServerConfig {
        ServerConfig {
            id: "s".into(),
            r#type: kind.into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    #[test]
    fn adds_missing_scheme() {
        assert_eq!(add_ice_url_scheme(&server("turn", "relay.example.org:3478")), "turn:relay.example.org:3478");
        assert_eq!(add_ice_url_scheme(&server("stun", "stun.example.org")), "stun:stun.example.org");
        assert_eq!(add_ice_url_scheme(&server("turn", "stun:x.org")), "stun:x.org");
    }

    #[test]
    fn ids_are_distinct_hex() {
        let a = random_id();
        let b = random_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
