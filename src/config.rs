// Runtime tunables.

use std::fs::File;
use std::time::Duration;

use ron::de::from_reader;
use serde::Deserialize;
use thiserror::Error;


// Everything about a runtime an operator might want to size: how many
// workers to run, how big a program's stacks and tables may grow, how
// many instructions it may burn, and how long a root caller is
// willing to wait. Loadable from a RON file.
#[derive(Deserialize, Debug, Clone)]
pub struct Limits {
    pub workers: usize,
    pub stack_depth: usize,
    pub call_depth: usize,
    pub fuel: u64,
    pub handle_slots: usize,
    pub rw_bytes: usize,
    pub deadline_ms: Option<u64>,
}


impl Default for Limits {
    fn default() -> Limits {
        Limits {
            workers: 4,
            stack_depth: 256,
            call_depth: 64,
            fuel: 1_000_000,
            handle_slots: 1024,
            rw_bytes: 1 << 20,
            deadline_ms: None,
        }
    }
}


impl Limits {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}


#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("couldn't open config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("couldn't parse config file: {0}")]
    Parse(#[from] ron::de::Error),
}


pub fn load(path: &str) -> Result<Limits, ConfigError> {
    let file = File::open(path)?;
    Ok(from_reader(file)?)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_workable() {
        let limits = Limits::default();
        assert!(limits.workers > 0);
        assert!(limits.stack_depth > 0);
        assert!(limits.fuel > 0);
        assert_eq!(limits.deadline(), None);
    }

    #[test]
    fn test_parse() {
        let source = "(
            workers: 2,
            stack_depth: 128,
            call_depth: 16,
            fuel: 1000,
            handle_slots: 64,
            rw_bytes: 65536,
            deadline_ms: Some(250),
        )";
        let limits: Limits = ron::de::from_str(source).unwrap();
        assert_eq!(limits.workers, 2);
        assert_eq!(limits.deadline(), Some(Duration::from_millis(250)));
    }
}
