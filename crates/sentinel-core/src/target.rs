//! The `Target` value type, the ordered target list, and the packed
//! 32-bit counter word shared between the registry (C3) and the
//! counter-threshold state machine (C4).

use serde::{Deserialize, Serialize};

/// A single monitored endpoint: `(ip, port, hostname)`, plus the optional
/// `Host:` header override used during active HTTP probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub ip: String,
    pub port: u16,
    pub hostname: Option<String>,
    pub hostheader: Option<String>,
}

impl Target {
    pub fn new(
        ip: impl Into<String>,
        port: u16,
        hostname: Option<String>,
        hostheader: Option<String>,
    ) -> Self {
        Self {
            ip: ip.into(),
            port,
            hostname,
            hostheader,
        }
    }

    /// The string used to key this target when `hostname` is absent: the
    /// ip itself, per §3's "hostname optional, defaults to ip for keying".
    pub fn key_hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.ip)
    }
}

/// The ordered target list persisted as a single blob under the
/// `target_list` key. Order is insertion order; it carries no semantic
/// weight beyond being stable for iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetList(pub Vec<Target>);

impl TargetList {
    pub fn contains(&self, ip: &str, port: u16, hostname: Option<&str>) -> bool {
        self.0
            .iter()
            .any(|t| t.ip == ip && t.port == port && t.hostname.as_deref() == hostname)
    }

    pub fn push(&mut self, target: Target) {
        self.0.push(target);
    }

    pub fn remove(&mut self, ip: &str, port: u16, hostname: Option<&str>) {
        self.0
            .retain(|t| !(t.ip == ip && t.port == port && t.hostname.as_deref() == hostname));
    }
}

/// Builds the string used to key a target's state/counter entries in the
/// shared store and its slot in the per-worker index.
pub fn target_key(ip: &str, port: u16, hostname: Option<&str>) -> String {
    match hostname {
        Some(h) => format!("{ip}:{port}:{h}"),
        None => format!("{ip}:{port}"),
    }
}

/// Which of the four 8-bit sub-counters an observation updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    Success,
    Http,
    Tcp,
    Timeout,
}

impl Selector {
    fn shift(self) -> u32 {
        match self {
            Selector::Success => 0,
            Selector::Http => 8,
            Selector::Tcp => 16,
            Selector::Timeout => 24,
        }
    }

    /// The delta to atomically add to the packed word to bump this
    /// counter by one.
    pub fn increment_delta(self) -> i64 {
        1i64 << self.shift()
    }
}

/// The packed 32-bit counter word: four independent 8-bit counters,
/// SUCCESS in the low byte through TIMEOUT in the high byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterWord(pub u32);

impl CounterWord {
    pub fn extract(self, selector: Selector) -> u8 {
        ((self.0 >> selector.shift()) & 0xff) as u8
    }

    /// A success observation clears the three failure bytes; any failure
    /// observation clears only the success byte. Returns the masked word.
    pub fn masked_for(self, selector: Selector) -> u32 {
        match selector {
            Selector::Success => self.0 & 0x0000_00ff,
            _ => self.0 & 0xffff_ff00,
        }
    }

    /// True if any of the three failure bytes (HTTP, TCP, TIMEOUT) is
    /// non-zero.
    pub fn has_any_failure(self) -> bool {
        (self.0 >> 8) & 0x00ff_ffff != 0
    }

    pub fn success_byte(self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_round_trips_each_byte() {
        let word = CounterWord(0x04_03_02_01);
        assert_eq!(word.extract(Selector::Success), 1);
        assert_eq!(word.extract(Selector::Http), 2);
        assert_eq!(word.extract(Selector::Tcp), 3);
        assert_eq!(word.extract(Selector::Timeout), 4);
    }

    #[test]
    fn success_report_clears_failure_bytes() {
        let word = CounterWord(0x04_03_02_01);
        assert_eq!(word.masked_for(Selector::Success), 0x0000_0001);
    }

    #[test]
    fn failure_report_clears_success_byte() {
        let word = CounterWord(0x04_03_02_01);
        assert_eq!(word.masked_for(Selector::Http), 0x0403_0200);
        assert_eq!(word.masked_for(Selector::Tcp), 0x0403_0200);
        assert_eq!(word.masked_for(Selector::Timeout), 0x0403_0200);
    }

    #[test]
    fn target_list_round_trips_through_json() {
        let mut list = TargetList::default();
        list.push(Target::new("10.0.0.1", 80, None, None));
        list.push(Target::new("10.0.0.2", 443, Some("api.example".into()), None));
        let encoded = serde_json::to_vec(&list).unwrap();
        let decoded: TargetList = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.0, list.0);
    }

    #[test]
    fn target_key_defaults_to_ip_when_hostname_absent() {
        let t = Target::new("10.0.0.1", 80, None, None);
        assert_eq!(t.key_hostname(), "10.0.0.1");
    }
}
