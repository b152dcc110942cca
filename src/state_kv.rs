//! Demonstration state machine: a line-oriented key-value store.
//!
//! Commands are `SET <key> <value>` lines; anything else is rejected,
//! which (deliberately) exercises the fatal-apply path. Snapshots are
//! sorted `key=value` lines.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};

use crate::raft::{Error, LogEntry, Result, StateMachine};

/// In-memory KV store driven by the replicated log.
#[derive(Debug, Default, Clone)]
pub struct KvStateMachine {
    entries: BTreeMap<String, String>,
}

impl KvStateMachine {
    pub fn new() -> KvStateMachine {
        KvStateMachine::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bad_command(msg: &str) -> Error {
        Error::state_machine(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            msg.to_string(),
        ))
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, entry: &LogEntry) -> Result<()> {
        let line = std::str::from_utf8(&entry.data)
            .map_err(|_| Self::bad_command("command is not utf-8"))?;
        let mut parts = line.trim().splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("SET"), Some(key), Some(value)) => {
                self.entries.insert(key.to_string(), value.to_string());
                Ok(())
            }
            (Some("DEL"), Some(key), None) => {
                self.entries.remove(key);
                Ok(())
            }
            _ => Err(Self::bad_command("expected SET <key> <value> or DEL <key>")),
        }
    }

    fn snapshot(&self, w: &mut dyn Write) -> Result<()> {
        for (key, value) in &self.entries {
            writeln!(w, "{}={}", key, value)?;
        }
        Ok(())
    }

    fn restore(&mut self, r: &mut dyn Read) -> Result<()> {
        let mut entries = BTreeMap::new();
        for line in BufReader::new(r).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Self::bad_command("malformed snapshot line"))?;
            entries.insert(key.to_string(), value.to_string());
        }
        self.entries = entries;
        Ok(())
    }
}
