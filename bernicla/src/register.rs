//!
//! The register-style configuration store
//!
//! Registers are dot-separated names mapped to string values. A register can
//! come from three places, in increasing precedence: programmatic defaults,
//! a register file, and the process environment. The environment encoding
//! uppercases the name and replaces each dot with a double underscore:
//! `uavcan.node.id` becomes `UAVCAN__NODE__ID`.
//!

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use bernicla_core::error::{Error, Result};
use bernicla_core::NodeId;

/// The environment-variable name of a register
pub fn env_name(register: &str) -> String {
    register.to_uppercase().replace('.', "__")
}

/// The register name encoded by an environment variable, if it is one
fn register_name(env: &str) -> Option<String> {
    if !env.starts_with("UAVCAN__") {
        return None;
    }
    Some(env.to_lowercase().replace("__", "."))
}

/// A key-value register store
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    values: BTreeMap<String, String>,
}

impl RegisterMap {
    pub fn new() -> Self {
        RegisterMap::default()
    }

    /// Loads every `UAVCAN__*` variable from the process environment
    pub fn from_env() -> Self {
        let mut map = RegisterMap::new();
        map.apply_env();
        map
    }

    /// Overrides current values with whatever the environment carries
    pub fn apply_env(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(name) = register_name(&key) {
                self.values.insert(name, value);
            }
        }
    }

    /// Reads `name=value` lines from a register file; environment overrides
    /// are applied on top, per the precedence rule
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(std::fs::File::open(path)?);
        let mut map = RegisterMap::new();
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some((name, value)) = trimmed.split_once('=') {
                map.set(name.trim(), value.trim());
            }
        }
        map.apply_env();
        Ok(map)
    }

    /// Persists the store as `name=value` lines
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        for (name, value) in &self.values {
            writeln!(file, "{}={}", name, value)?;
        }
        Ok(())
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Parses a register as an unsigned integer
    pub fn get_natural(&self, name: &str) -> Result<Option<u64>> {
        match self.get(name) {
            None => Ok(None),
            Some(value) if value.is_empty() => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| {
                Error::InvalidTransportConfiguration(format!(
                    "register {} is not a number: {:?}",
                    name, value
                ))
            }),
        }
    }

    /// The configured local node ID; absent or empty means anonymous
    pub fn node_id(&self) -> Result<Option<NodeId>> {
        Ok(self
            .get_natural("uavcan.node.id")?
            .map(|value| NodeId::new(value as u16)))
    }

    /// A transport endpoint register; empty means the transport is disabled
    pub fn iface(&self, transport: &str) -> Option<&str> {
        self.get(&format!("uavcan.{}.iface", transport))
            .filter(|value| !value.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_name_encoding() {
        assert_eq!(env_name("uavcan.node.id"), "UAVCAN__NODE__ID");
        assert_eq!(env_name("uavcan.pub.airspeed.id"), "UAVCAN__PUB__AIRSPEED__ID");
    }

    #[test]
    fn register_name_decoding() {
        assert_eq!(
            register_name("UAVCAN__NODE__ID").as_deref(),
            Some("uavcan.node.id")
        );
        assert_eq!(register_name("PATH"), None);
    }

    #[test]
    fn natural_parsing() {
        let mut map = RegisterMap::new();
        map.set("uavcan.node.id", "42");
        assert_eq!(map.get_natural("uavcan.node.id").unwrap(), Some(42));
        assert_eq!(map.node_id().unwrap(), Some(NodeId::new(42)));
        map.set("uavcan.node.id", "forty-two");
        assert!(map.get_natural("uavcan.node.id").is_err());
    }

    #[test]
    fn empty_iface_means_disabled() {
        let mut map = RegisterMap::new();
        map.set("uavcan.udp.iface", "");
        assert_eq!(map.iface("udp"), None);
        map.set("uavcan.udp.iface", "127.0.0.1");
        assert_eq!(map.iface("udp"), Some("127.0.0.1"));
    }
}
