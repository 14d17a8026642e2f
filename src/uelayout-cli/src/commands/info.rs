//! Module image summary

use anyhow::Result;
use uelayout::ModuleImage;

pub fn handle_info(image: &ModuleImage) -> Result<()> {
    println!("Module:      {}", image.name().unwrap_or("(unnamed)"));
    println!("Base:        {:#x}", image.base());
    println!("Size:        {:#x}", image.size());
    if let Some(timestamp) = image.timestamp() {
        println!("Timestamp:   {:#010x}", timestamp);
    }
    println!("Fingerprint: {}", image.fingerprint());
    println!("Live:        {}", image.view().is_live());
    println!("Regions:     {}", image.view().regions().len());

    println!("\nSections:");
    for section in image.sections() {
        println!(
            "  {:<10} {:#014x}-{:#014x} {:?}{}",
            section.name,
            section.range.start,
            section.range.end,
            section.kind,
            if section.writable { " (writable)" } else { "" }
        );
    }
    Ok(())
}
