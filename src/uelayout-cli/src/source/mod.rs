//! Memory sources: a live process or a dump file

mod dump;
mod process;

pub use dump::DumpFile;
pub use process::ProcessMemory;

use anyhow::{bail, Result};
use std::path::PathBuf;
use uelayout::MemoryView;

/// What to read memory from
#[derive(Debug, Clone)]
pub enum Target {
    Pid(u32),
    Process(String),
    Dump(PathBuf),
}

impl Target {
    pub fn from_args(pid: Option<u32>, process: Option<String>, dump: Option<PathBuf>) -> Result<Self> {
        match (pid, process, dump) {
            (Some(pid), None, None) => Ok(Target::Pid(pid)),
            (None, Some(name), None) => Ok(Target::Process(name)),
            (None, None, Some(path)) => Ok(Target::Dump(path)),
            (None, None, None) => bail!("No target: pass --pid, --process or --dump"),
            _ => bail!("Pass only one of --pid, --process or --dump"),
        }
    }

    pub fn open(&self) -> Result<MemoryView> {
        Ok(match self {
            Target::Pid(pid) => MemoryView::from_source(ProcessMemory::attach(*pid)?),
            Target::Process(name) => MemoryView::from_source(ProcessMemory::attach_by_name(name)?),
            Target::Dump(path) => MemoryView::from_source(DumpFile::open(path)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_selection() {
        assert!(matches!(Target::from_args(Some(42), None, None), Ok(Target::Pid(42))));
        assert!(matches!(
            Target::from_args(None, None, Some(PathBuf::from("x.dmp"))),
            Ok(Target::Dump(_))
        ));
        assert!(Target::from_args(None, None, None).is_err());
        assert!(Target::from_args(Some(1), Some("Game".into()), None).is_err());
    }
}
