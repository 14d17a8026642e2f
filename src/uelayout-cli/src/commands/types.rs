//! Reflection dump

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{info, warn};
use uelayout::ue::{ReflectionWalker, TypeInfo};
use uelayout::OffsetRegistry;

pub fn handle_types(registry: &OffsetRegistry, filter: Option<&str>, json: Option<&Path>) -> Result<()> {
    let walker = ReflectionWalker::new(registry).context("Reflection layout is unavailable")?;

    let mut types: Vec<TypeInfo> = Vec::new();
    for object in walker.types() {
        let info = match walker.describe(object) {
            Ok(info) => info,
            Err(e) => {
                warn!(object = format_args!("{:#x}", object), error = %e, "skipping unreadable type");
                continue;
            }
        };
        if filter.is_some_and(|f| !info.path.contains(f)) {
            continue;
        }
        types.push(info);
    }

    if let Some(path) = json {
        let contents = serde_json::to_string_pretty(&types)?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write types to {}", path.display()))?;
        info!(path = %path.display(), types = types.len(), "wrote types");
        return Ok(());
    }

    for info in &types {
        let parent = info
            .super_name
            .as_deref()
            .map(|s| format!(" : {}", s))
            .unwrap_or_default();
        println!("{:?} {}{} (size {:#x})", info.kind, info.path, parent, info.size);
        for member in &info.members {
            let bits = member
                .bool_field
                .map(|b| format!(" [byte {} mask {:#04x}]", b.byte_offset, b.byte_mask))
                .unwrap_or_default();
            println!(
                "  +{:#06x} {:<24} {}{}",
                member.offset, member.name, member.class_name, bits
            );
        }
        for function in &info.functions {
            println!("  fn {}", function);
        }
    }
    println!("\n{} types", types.len());
    Ok(())
}
