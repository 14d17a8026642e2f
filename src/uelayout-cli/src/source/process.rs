//! Live process memory source
//!
//! Reads another process through `process-memory`, with regions parsed from
//! `/proc/<pid>/maps`.

use anyhow::{bail, Context, Result};
use process_memory::{CopyAddress, ProcessHandle, PutAddress, TryIntoProcessHandle};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use sysinfo::System;
use tracing::info;
use uelayout::{MemoryRegion, MemorySource, ScanError};

/// An attached process
pub struct ProcessMemory {
    pub pid: u32,
    handle: ProcessHandle,
    pub exe_path: PathBuf,
    maps: Vec<MemoryRegion>,
}

// SAFETY: process handles are process-wide and usable from any thread.
unsafe impl Send for ProcessMemory {}
unsafe impl Sync for ProcessMemory {}

impl MemorySource for ProcessMemory {
    fn read_bytes(&self, address: usize, size: usize) -> uelayout::Result<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        self.handle
            .copy_address(address, &mut buffer)
            .map_err(|_| ScanError::Access { address, size })?;
        Ok(buffer)
    }

    fn regions(&self) -> &[MemoryRegion] {
        &self.maps
    }

    fn is_live(&self) -> bool {
        true
    }

    fn write_bytes(&self, address: usize, data: &[u8]) -> uelayout::Result<()> {
        self.handle
            .put_address(address, data)
            .map_err(|_| ScanError::Access {
                address,
                size: data.len(),
            })
    }
}

impl ProcessMemory {
    pub fn attach(pid: u32) -> Result<Self> {
        let handle = (pid as process_memory::Pid)
            .try_into_process_handle()
            .context("Failed to attach to process. Try running with sudo.")?;

        let maps = parse_maps(pid)?;

        let exe_path = std::fs::read_link(format!("/proc/{}/exe", pid))
            .unwrap_or_else(|_| PathBuf::from("unknown"));

        info!(pid, regions = maps.len(), exe = %exe_path.display(), "attached");
        Ok(ProcessMemory {
            pid,
            handle,
            exe_path,
            maps,
        })
    }

    /// Attach to the largest process whose name or command line mentions `name`
    pub fn attach_by_name(name: &str) -> Result<Self> {
        Self::attach(find_process(name)?)
    }
}

/// Find a running process by (case-insensitive) name, preferring the one
/// using the most memory
pub fn find_process(name: &str) -> Result<u32> {
    let wanted = name.to_ascii_lowercase();
    let mut system = System::new_all();
    system.refresh_all();

    let mut candidates: Vec<(u32, u64)> = Vec::new();
    for process in system.processes().values() {
        let pid = process.pid().as_u32();
        let process_name = process.name().to_string_lossy().to_ascii_lowercase();
        let in_cmdline = std::fs::read_to_string(format!("/proc/{}/cmdline", pid))
            .is_ok_and(|cmdline| cmdline.to_ascii_lowercase().contains(&wanted));

        if process_name.contains(&wanted) || in_cmdline {
            let tgid = get_tgid(pid).unwrap_or(pid);
            candidates.push((tgid, process.memory()));
        }
    }

    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    candidates.dedup_by(|a, b| a.0 == b.0);

    match candidates.first() {
        Some((pid, memory)) => {
            info!(pid, memory_mb = memory / 1_000_000, name, "found process");
            Ok(*pid)
        }
        None => bail!("No process matching {:?} found", name),
    }
}

/// Thread group ID (main process) for a PID/TID
pub fn get_tgid(pid: u32) -> Option<u32> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    status
        .lines()
        .find(|line| line.starts_with("Tgid:"))
        .and_then(|line| line.split_whitespace().nth(1)?.parse().ok())
}

/// Parse `/proc/<pid>/maps`
pub fn parse_maps(pid: u32) -> Result<Vec<MemoryRegion>> {
    let maps_path = format!("/proc/{}/maps", pid);
    let file = File::open(&maps_path)
        .with_context(|| format!("Failed to open {}. Do you have permission?", maps_path))?;

    let mut regions = Vec::new();
    for line in BufReader::new(file).lines() {
        if let Some(region) = parse_maps_line(&line?) {
            regions.push(region);
        }
    }
    Ok(regions)
}

/// One `/proc/<pid>/maps` line: `start-end perms offset dev inode [path]`
pub fn parse_maps_line(line: &str) -> Option<MemoryRegion> {
    let mut parts = line.split_whitespace();
    let (start, end) = parts.next()?.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    let perms = parts.next().unwrap_or("");
    let offset = parts
        .next()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .unwrap_or(0);
    // dev, inode
    let path = parts.nth(2).map(str::to_string);

    Some(MemoryRegion {
        start,
        end,
        perms: perms.to_string(),
        offset,
        path,
    })
}
