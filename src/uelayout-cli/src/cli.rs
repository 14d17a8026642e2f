//! CLI argument definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "uelayout")]
#[command(about = "Discover Unreal Engine structure layouts in a process or dump", long_about = None)]
pub struct Cli {
    /// Attach to a process by PID
    #[arg(long, global = true, conflicts_with_all = ["process", "dump"])]
    pub pid: Option<u32>,

    /// Attach to the largest process matching this name
    #[arg(long, global = true, env = "UELAYOUT_PROCESS", conflicts_with = "dump")]
    pub process: Option<String>,

    /// Read a memory dump (MDMP, or raw with a sibling .maps file)
    #[arg(long, global = true)]
    pub dump: Option<PathBuf>,

    /// Module to analyse (default: the first executable .exe mapping)
    #[arg(long, global = true)]
    pub module: Option<String>,

    /// Config file (default: <config dir>/uelayout/config.toml)
    #[arg(long, global = true, env = "UELAYOUT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve artifacts (all registered ones by default)
    #[command(visible_alias = "r")]
    Resolve {
        /// Artifact names, e.g. "GUObjectArray" or "UObject::NamePrivate"
        artifacts: Vec<String>,

        /// Print resolved values as JSON
        #[arg(long)]
        json: bool,

        /// Seed from and update the hint cache
        #[arg(long)]
        cache: bool,
    },

    /// Dump reflected types through the discovered layout
    #[command(visible_alias = "t")]
    Types {
        /// Only types whose path contains this
        #[arg(short, long)]
        filter: Option<String>,

        /// Write the types as JSON to this file
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Find string literals in the module
    Strings {
        text: String,

        /// UTF-16 instead of narrow
        #[arg(short, long)]
        wide: bool,
    },

    /// Find RIP-relative references to an address
    Xrefs {
        #[arg(value_parser = parse_address)]
        address: usize,
    },

    /// Disassemble instructions at an address
    Disasm {
        #[arg(value_parser = parse_address)]
        address: usize,

        #[arg(short, long, default_value = "16")]
        count: usize,
    },

    /// Show the module image: base, size, sections, fingerprint
    Info,
}

/// Hex (`0x` prefixed) or decimal address
pub fn parse_address(text: &str) -> Result<usize, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address {:?}: {}", text, e))
}
