use crate::peer::types::ServerConfig;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Добавляет схему протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    // Если url уже начинается с "turn:" или "stun:", возвращаем как есть
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Время в формате `toISOString`: миллисекунды и `Z`
pub fn iso8601(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_iso8601(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

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
    fn ice_scheme_is_added_from_server_type() {
        assert_eq!(add_ice_url_scheme(&server("turn", "relay.example:3478")), "turn:relay.example:3478");
        assert_eq!(add_ice_url_scheme(&server("stun", "stun.example:3478")), "stun:stun.example:3478");
        assert_eq!(add_ice_url_scheme(&server("turn", "stun:x:1")), "stun:x:1");
    }

    #[test]
    fn iso8601_matches_browser_format() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        assert_eq!(iso8601(ts), "2024-05-01T12:30:00.000Z");
        assert_eq!(parse_iso8601("2024-05-01T12:30:00.000Z"), Some(ts));
        assert_eq!(parse_iso8601("yesterday"), None);
    }

    #[test]
    fn random_ids_are_sixteen_hex_chars() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
