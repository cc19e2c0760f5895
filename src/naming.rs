//! Resource names, GC labels and runtime sequence numbers.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

pub const LABEL_ROOM_KEY: &str = "room_key";
pub const LABEL_RUN_TYPE: &str = "run_type";
pub const LABEL_SEQ_NO: &str = "rt_seq_num";

pub const KW_SERVICE_NAME: &str = "<YE_SERVICE_NAME>";
pub const KW_NETWORK_NAME: &str = "<YE_NETWORK_NAME>";
pub const KW_REQUEST_FILE: &str = "<YE_REQUEST_FILE>";

/// Sequence numbers wrap before this value.
pub const SEQ_NO_MODULUS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunType {
    Network,
    Service,
    Repl,
    Code,
}

impl RunType {
    pub fn as_str(self) -> &'static str {
        match self {
            RunType::Network => "network",
            RunType::Service => "service",
            RunType::Repl => "repl",
            RunType::Code => "code",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First 8 hex characters of the SHA-256 of the room key.
pub fn room_hash(room_key: &str) -> String {
    let digest = Sha256::digest(room_key.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

pub fn unique_name(room_key: &str, seq_no: u32, run_type: RunType) -> String {
    format!("{}.{:03}.{}", room_hash(room_key), seq_no, run_type)
}

pub fn labels(room_key: &str, seq_no: u32, run_type: RunType) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_ROOM_KEY.to_string(), room_key.to_string()),
        (LABEL_SEQ_NO.to_string(), seq_no.to_string()),
        (LABEL_RUN_TYPE.to_string(), run_type.to_string()),
    ])
}

/// The four names one runtime instance uses for its backend resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeNames {
    pub network: String,
    pub service: String,
    pub repl: String,
    pub code: String,
    pub request_file: String,
}

impl RuntimeNames {
    pub fn new(room_key: &str, seq_no: u32) -> Self {
        Self {
            network: unique_name(room_key, seq_no, RunType::Network),
            service: unique_name(room_key, seq_no, RunType::Service),
            repl: unique_name(room_key, seq_no, RunType::Repl),
            code: unique_name(room_key, seq_no, RunType::Code),
            request_file: "request.json".to_string(),
        }
    }

    /// Substitute the placeholder tokens in every entry.
    pub fn render(&self, entries: &[String]) -> Vec<String> {
        let keywords = [
            (KW_SERVICE_NAME, self.service.as_str()),
            (KW_NETWORK_NAME, self.network.as_str()),
            (KW_REQUEST_FILE, self.request_file.as_str()),
        ];
        entries
            .iter()
            .map(|entry| {
                keywords
                    .iter()
                    .fold(entry.clone(), |acc, (kw, value)| acc.replace(kw, value))
            })
            .collect()
    }
}

/// Per-session runtime counter: 1, 2, ..., 999, 1, ... Never yields 0.
#[derive(Debug, Clone)]
pub struct SeqCounter {
    next: u32,
}

impl Default for SeqCounter {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl SeqCounter {
    pub fn next_seq_no(&mut self) -> u32 {
        let seq_no = self.next;
        self.next = (self.next + 1) % SEQ_NO_MODULUS;
        if self.next == 0 {
            self.next = 1;
        }
        seq_no
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names_are_deterministic() {
        let names = RuntimeNames::new("room-1", 7);
        let hash = room_hash("room-1");
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(names.network, format!("{}.007.network", hash));
        assert_eq!(names.service, format!("{}.007.service", hash));
        assert_eq!(names.repl, format!("{}.007.repl", hash));
        assert_eq!(names.code, format!("{}.007.code", hash));
        assert_eq!(names, RuntimeNames::new("room-1", 7));
        assert_ne!(room_hash("room-1"), room_hash("room-2"));
    }

    #[test]
    fn labels_carry_room_seq_and_role() {
        let labels = labels("abc", 12, RunType::Service);
        assert_eq!(labels[LABEL_ROOM_KEY], "abc");
        assert_eq!(labels[LABEL_SEQ_NO], "12");
        assert_eq!(labels[LABEL_RUN_TYPE], "service");
    }

    #[test]
    fn render_substitutes_placeholders() {
        let names = RuntimeNames::new("room", 1);
        let rendered = names.render(&[
            "psql".to_string(),
            "--host=<YE_SERVICE_NAME>".to_string(),
            "NET=<YE_NETWORK_NAME>".to_string(),
            "/home/ye/<YE_REQUEST_FILE>".to_string(),
        ]);
        assert_eq!(rendered[0], "psql");
        assert_eq!(rendered[1], format!("--host={}", names.service));
        assert_eq!(rendered[2], format!("NET={}", names.network));
        assert_eq!(rendered[3], "/home/ye/request.json");
    }

    #[test]
    fn seq_counter_wraps_and_skips_zero() {
        let mut counter = SeqCounter::default();
        let issued: Vec<u32> = (0..1001).map(|_| counter.next_seq_no()).collect();
        assert_eq!(issued[0], 1);
        assert_eq!(issued[998], 999);
        assert_eq!(issued[999], 1);
        assert_eq!(issued[1000], 2);
        assert!(!issued.contains(&0));
        for pair in issued[..999].windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }
}
