//! Socks inbound port rewriting for engine configs

use serde_json::Value;
use crate::error::{Error, Result};

/// Rewrite the `port` of the first `"socks"` inbound to `port`.
///
/// A config without any socks inbound is returned unchanged.
pub fn replace_inbound_socks_port(config: &str, port: u16) -> Result<String> {
    let mut root: Value = serde_json::from_str(config)
        .map_err(|e| Error::ConfigInvalid(format!("invalid JSON config provided: {}", e)))?;

    let inbounds = root
        .get_mut("inbounds")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| Error::MissingField("inbounds".to_string()))?;

    let socks = inbounds
        .iter_mut()
        .filter_map(Value::as_object_mut)
        .find(|inbound| inbound.get("protocol").and_then(Value::as_str) == Some("socks"));

    match socks {
        Some(inbound) => {
            inbound.insert("port".to_string(), Value::from(port));
            Ok(serde_json::to_string(&root)?)
        }
        None => Ok(config.to_string()),
    }
}

/// Port of the first `"socks"` inbound, if the config has one
pub fn inbound_socks_port(config: &str) -> Option<u16> {
    let root: Value = serde_json::from_str(config).ok()?;
    root.get("inbounds")?
        .as_array()?
        .iter()
        .find(|inbound| inbound.get("protocol").and_then(Value::as_str) == Some("socks"))?
        .get("port")?
        .as_u64()
        .and_then(|port| u16::try_from(port).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound_ports(config: &str) -> Vec<Option<u64>> {
        let value: Value = serde_json::from_str(config).unwrap();
        value["inbounds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|inbound| inbound.get("port").and_then(Value::as_u64))
            .collect()
    }

    #[test]
    fn patches_socks_inbound_only() {
        let config = r#"{"inbounds":[{"protocol":"http"},{"protocol":"socks","port":1080}]}"#;
        let patched = replace_inbound_socks_port(config, 9000).unwrap();

        assert_eq!(inbound_ports(&patched), vec![None, Some(9000)]);
        let value: Value = serde_json::from_str(&patched).unwrap();
        assert_eq!(value["inbounds"][0], serde_json::json!({"protocol": "http"}));
    }

    #[test]
    fn only_first_socks_inbound_is_patched() {
        let config = r#"{"inbounds":[
            {"protocol":"socks","port":1080},
            {"protocol":"socks","port":1081}
        ]}"#;
        let patched = replace_inbound_socks_port(config, 2000).unwrap();
        assert_eq!(inbound_ports(&patched), vec![Some(2000), Some(1081)]);
    }

    #[test]
    fn missing_port_is_added() {
        let patched = replace_inbound_socks_port(r#"{"inbounds":[{"protocol":"socks"}]}"#, 7000).unwrap();
        assert_eq!(inbound_ports(&patched), vec![Some(7000)]);
    }

    #[test]
    fn no_socks_inbound_returns_input() {
        let config = "{ \"inbounds\": [ {\"protocol\": \"http\", \"port\": 8080} ], \"log\": {} }";
        assert_eq!(replace_inbound_socks_port(config, 9000).unwrap(), config);
    }

    #[test]
    fn key_order_is_preserved() {
        let config = r#"{"log":{},"inbounds":[{"tag":"in","protocol":"socks","port":1}],"outbounds":[]}"#;
        let patched = replace_inbound_socks_port(config, 2).unwrap();
        assert_eq!(patched, r#"{"log":{},"inbounds":[{"tag":"in","protocol":"socks","port":2}],"outbounds":[]}"#);
    }

    #[test]
    fn reads_socks_port() {
        let config = r#"{"inbounds":[{"protocol":"http","port":8080},{"protocol":"socks","port":1080}]}"#;
        assert_eq!(inbound_socks_port(config), Some(1080));
        assert_eq!(inbound_socks_port(r#"{"inbounds":[{"protocol":"socks"}]}"#), None);
        assert_eq!(inbound_socks_port("not json"), None);
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = replace_inbound_socks_port("{\"inbounds\": [", 1).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn missing_inbounds_is_rejected() {
        let err = replace_inbound_socks_port(r#"{"outbounds":[]}"#, 1).unwrap_err();
        assert!(matches!(err, Error::MissingField(field) if field == "inbounds"));

        let err = replace_inbound_socks_port(r#"{"inbounds":{}}"#, 1).unwrap_err();
        assert!(matches!(err, Error::MissingField(_)));
    }
}
