//! Control-plane messages exchanged with the offload broker

use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker-side listener family a control connection targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ConnectionType {
    ExternalIp = 0,
    Dns = 1,
    Tcp = 2,
    Kcp = 3,
    Ssl = 4,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::ExternalIp => "external-ip",
            ConnectionType::Dns => "dns",
            ConnectionType::Tcp => "tcp",
            ConnectionType::Kcp => "kcp",
            ConnectionType::Ssl => "ssl",
        }
    }
}

impl From<ConnectionType> for u8 {
    fn from(kind: ConnectionType) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for ConnectionType {
    type Error = UnknownConnectionType;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectionType::ExternalIp),
            1 => Ok(ConnectionType::Dns),
            2 => Ok(ConnectionType::Tcp),
            3 => Ok(ConnectionType::Kcp),
            4 => Ok(ConnectionType::Ssl),
            other => Err(UnknownConnectionType(other)),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for connection-type codes outside 0..=4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownConnectionType(pub u8);

impl fmt::Display for UnknownConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown connection type code: {}", self.0)
    }
}

impl std::error::Error for UnknownConnectionType {}

/// First frame on every control connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub prot: ConnectionType,
    pub bind: String,
    pub timeout: u32,
}

impl ControlRequest {
    pub fn new(prot: ConnectionType, bind: impl Into<String>) -> Self {
        Self {
            prot,
            bind: bind.into(),
            timeout: 0,
        }
    }

    pub fn with_timeout(mut self, timeout: u32) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Logical addressing of a forwarded peer, sent by the broker on the
/// acceptor path.
///
/// When `extra` is set, `data` names an entry of the caller's extra mapping
/// that must be sent back before the broker delivers the final info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub lhost: String,
    pub lport: u16,
    pub rhost: String,
    pub rport: u16,
    #[serde(default)]
    pub extra: bool,
    #[serde(default = "nil")]
    pub data: Value,
}

fn nil() -> Value {
    Value::Nil
}

impl ConnectionInfo {
    pub fn new(
        lhost: impl Into<String>,
        lport: u16,
        rhost: impl Into<String>,
        rport: u16,
    ) -> Self {
        Self {
            lhost: lhost.into(),
            lport,
            rhost: rhost.into(),
            rport,
            extra: false,
            data: Value::Nil,
        }
    }

    /// Mark this info as requiring the extra payload stored under `key`
    pub fn requesting_extra(mut self, key: impl Into<String>) -> Self {
        self.extra = true;
        self.data = Value::from(key.into());
        self
    }

    /// Lookup key for the extra mapping, if the broker asked for one.
    ///
    /// Keys sent as MessagePack binary are accepted when they are valid UTF-8.
    pub fn extra_key(&self) -> Option<&str> {
        if !self.extra {
            return None;
        }
        match &self.data {
            Value::String(s) => s.as_str(),
            Value::Binary(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

/// Reply to a type-0 control request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIpResponse {
    pub ip: String,
}

/// Whether a DNS-path request terminates the current control session.
///
/// Nil, `false`, zero and empty strings, binaries, arrays and maps all end
/// the session.
pub fn is_empty_request(request: &Value) -> bool {
    match request {
        Value::Nil => true,
        Value::Boolean(b) => !b,
        Value::Integer(i) => i.as_u64() == Some(0) || i.as_i64() == Some(0),
        Value::F32(f) => *f == 0.0,
        Value::F64(f) => *f == 0.0,
        Value::String(s) => s.as_bytes().is_empty(),
        Value::Binary(b) => b.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Map(m) => m.is_empty(),
        Value::Ext(..) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_keys(value: &Value) -> Vec<String> {
        value
            .as_map()
            .unwrap()
            .iter()
            .map(|(k, _)| k.as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_connection_type_codes() {
        let kinds = [
            ConnectionType::ExternalIp,
            ConnectionType::Dns,
            ConnectionType::Tcp,
            ConnectionType::Kcp,
            ConnectionType::Ssl,
        ];
        for (code, kind) in kinds.iter().enumerate() {
            assert_eq!(u8::from(*kind), code as u8);
            assert_eq!(ConnectionType::try_from(code as u8).unwrap(), *kind);
        }
        assert_eq!(
            ConnectionType::try_from(5),
            Err(UnknownConnectionType(5))
        );
    }

    #[test]
    fn test_control_request_is_named_map() {
        let request = ControlRequest::new(ConnectionType::Kcp, "8443");
        let bytes = rmp_serde::to_vec_named(&request).unwrap();
        let value: Value = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(map_keys(&value), vec!["prot", "bind", "timeout"]);
        let map = value.as_map().unwrap();
        assert_eq!(map[0].1.as_u64(), Some(3));
        assert_eq!(map[1].1.as_str(), Some("8443"));
        assert_eq!(map[2].1.as_u64(), Some(0));
    }

    #[test]
    fn test_connection_info_defaults_missing_extra() {
        let value = Value::Map(vec![
            (Value::from("lhost"), Value::from("10.0.0.1")),
            (Value::from("lport"), Value::from(4444)),
            (Value::from("rhost"), Value::from("8.8.8.8")),
            (Value::from("rport"), Value::from(53)),
        ]);
        let bytes = rmp_serde::to_vec(&value).unwrap();
        let info: ConnectionInfo = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(info, ConnectionInfo::new("10.0.0.1", 4444, "8.8.8.8", 53));
        assert_eq!(info.extra_key(), None);
    }

    #[test]
    fn test_extra_key() {
        let info = ConnectionInfo::new("a", 1, "b", 2).requesting_extra("cert");
        assert_eq!(info.extra_key(), Some("cert"));

        let mut binary_key = ConnectionInfo::new("a", 1, "b", 2);
        binary_key.extra = true;
        binary_key.data = Value::Binary(b"key".to_vec());
        assert_eq!(binary_key.extra_key(), Some("key"));

        let mut numeric_key = binary_key.clone();
        numeric_key.data = Value::from(7);
        assert_eq!(numeric_key.extra_key(), None);
    }

    #[test]
    fn test_empty_request() {
        assert!(is_empty_request(&Value::Nil));
        assert!(is_empty_request(&Value::from(false)));
        assert!(is_empty_request(&Value::from(0)));
        assert!(is_empty_request(&Value::from("")));
        assert!(is_empty_request(&Value::Binary(vec![])));
        assert!(is_empty_request(&Value::Array(vec![])));

        assert!(!is_empty_request(&Value::from(true)));
        assert!(!is_empty_request(&Value::from(-1)));
        assert!(!is_empty_request(&Value::Binary(vec![0])));
        assert!(!is_empty_request(&Value::Array(vec![Value::Nil])));
        assert!(!is_empty_request(&Value::Ext(1, vec![])));
    }
}
