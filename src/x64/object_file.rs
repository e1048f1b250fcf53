//! ELF relocatable output for compiled kernels.
//!
//! A kernel is position independent: constants are addressed RIP-relative
//! and live in the same buffer right after the code, so the whole buffer goes
//! into `.text` as one function symbol and no relocations are needed.

use crate::core::compiler::CompiledKernel;
use crate::core::error::{CompileError, CompileResult};
use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

/// Wrap `kernel` into an x86-64 ELF object exporting it as `name`.
pub fn emit_elf(name: &str, kernel: &CompiledKernel) -> CompileResult<Vec<u8>> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);

    let text = obj.section_id(StandardSection::Text);
    let offset = obj.append_section_data(text, &kernel.code, 64);

    obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: offset,
        size: kernel.code_size() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });

    let mut buf = Vec::new();
    obj.emit(&mut buf).map_err(|e| CompileError::Object {
        reason: e.to_string(),
    })?;
    log::debug!("object for {name}: {} bytes", buf.len());
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::read::File;
    use object::{Object as _, ObjectSection as _, ObjectSymbol as _};

    #[test]
    fn test_kernel_symbol_covers_code_only() {
        let kernel = CompiledKernel {
            code: vec![0xc3, 0, 0, 0x80, 0x3f],
            data_size: 4,
            lanes: 8,
            num_inputs: 1,
            num_outputs: 1,
            labels: Vec::new(),
        };
        let bytes = emit_elf("tile_kernel", &kernel).unwrap();
        let file = File::parse(&*bytes).unwrap();

        let symbol = file
            .symbols()
            .find(|s| s.name().ok() == Some("tile_kernel"))
            .unwrap();
        assert_eq!(symbol.size(), 1);
        assert_eq!(symbol.kind(), SymbolKind::Text);

        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.data().unwrap(), &kernel.code[..]);
    }
}
