//! String, reference and disassembly listings

use anyhow::Result;
use iced_x86::{Formatter, IntelFormatter};
use uelayout::disasm::{decode_at, Instruction};
use uelayout::scan::{find_string_all, find_wide_string_all, ReferenceScanner};
use uelayout::ModuleImage;

fn section_of(image: &ModuleImage, address: usize) -> &str {
    image
        .sections()
        .iter()
        .find(|s| s.range.contains(&address))
        .map(|s| s.name.as_str())
        .unwrap_or("?")
}

fn format_instruction(image: &ModuleImage, insn: &Instruction, formatter: &mut IntelFormatter) -> String {
    let mut text = String::new();
    formatter.format(insn.raw(), &mut text);
    let bytes = image
        .view()
        .read_bytes(insn.address(), insn.len())
        .map(|b| b.iter().map(|x| format!("{:02x}", x)).collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    format!("{:#014x}  {:<30} {}", insn.address(), bytes, text)
}

pub fn handle_strings(image: &ModuleImage, text: &str, wide: bool) -> Result<()> {
    let hits = if wide {
        find_wide_string_all(image, text)
    } else {
        find_string_all(image, text)
    };
    let scanner = ReferenceScanner::whole(image);
    for address in &hits {
        let references = scanner.find_all(*address).len();
        println!(
            "{:#014x}  {:<8} {} references",
            address,
            section_of(image, *address),
            references
        );
    }
    println!("\n{} matches", hits.len());
    Ok(())
}

pub fn handle_xrefs(image: &ModuleImage, address: usize) -> Result<()> {
    let mut formatter = IntelFormatter::new();
    let references = ReferenceScanner::whole(image).find_all(address);
    for reference in &references {
        let function = image
            .function_containing(reference.instruction)
            .map(|f| format!("{:#x}", f))
            .unwrap_or_else(|| "?".to_string());
        match decode_at(image.view(), reference.instruction) {
            Ok(insn) => println!(
                "{}  ({:?}, fn {})",
                format_instruction(image, &insn, &mut formatter),
                reference.kind,
                function
            ),
            Err(_) => println!("{:#014x}  ({:?}, fn {})", reference.instruction, reference.kind, function),
        }
    }
    println!("\n{} references to {:#x}", references.len(), address);
    Ok(())
}

pub fn handle_disasm(image: &ModuleImage, address: usize, count: usize) -> Result<()> {
    let mut formatter = IntelFormatter::new();
    let mut current = address;
    for _ in 0..count {
        match decode_at(image.view(), current) {
            Ok(insn) => {
                println!("{}", format_instruction(image, &insn, &mut formatter));
                current = insn.next_address();
            }
            Err(e) => {
                println!("{:#014x}  (bad: {})", current, e);
                break;
            }
        }
    }
    Ok(())
}
