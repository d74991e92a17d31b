// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Binary Loader (component A).
//!
//! Parses a little-endian 32-bit ARM ELF and exposes the three things the
//! rest of the pipeline needs: a symbol table, byte-addressable sections,
//! and the raw words of the vector table. Everything here is read-only
//! after `Image::load`.

use std::collections::BTreeMap;
use std::path::Path;

use goblin::elf::Elf;
use goblin::Object;
use scroll::{Endian, Pread};

use crate::error::AnalysisError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Object,
}

#[derive(Clone, Debug)]
pub struct Symbol {
    /// Address with the Thumb bit (if any) already cleared.
    pub address: u32,
    pub size: u32,
    pub kind: SymbolKind,
    /// Whether the symbol's original `st_value` had bit 0 set, marking it
    /// as a Thumb-state function per the AAPCS32 convention.
    pub thumb: bool,
}

/// A loadable ELF section, addressable by virtual address.
#[derive(Clone, Debug)]
pub struct Section {
    pub name: String,
    pub addr: u32,
    pub bytes: Vec<u8>,
}

impl Section {
    fn contains(&self, addr: u32) -> bool {
        let end = self.addr.wrapping_add(self.bytes.len() as u32);
        addr >= self.addr && addr < end
    }
}

/// The parsed contents of an ELF executable, owned and immutable for the
/// remainder of the pipeline.
pub struct Image {
    pub symbols: BTreeMap<String, Symbol>,
    sections: Vec<Section>,
    /// Raw little-endian words of the vector table: word 0 is the initial
    /// SP, word 1 is the reset handler, words 2.. are exception/interrupt
    /// vectors.
    pub vector_table: Vec<u32>,
}

impl Image {
    pub fn load(path: &Path) -> Result<Image, AnalysisError> {
        let buffer = std::fs::read(path).map_err(|e| {
            AnalysisError::BinaryMalformed {
                detail: format!("could not read {}: {e}", path.display()),
            }
        })?;
        Self::parse(&buffer)
    }

    pub fn parse(buffer: &[u8]) -> Result<Image, AnalysisError> {
        let elf = match Object::parse(buffer) {
            Ok(Object::Elf(elf)) => elf,
            Ok(other) => {
                return Err(AnalysisError::BinaryMalformed {
                    detail: format!("not an ELF object: {other:?}"),
                })
            }
            Err(e) => {
                return Err(AnalysisError::BinaryMalformed {
                    detail: e.to_string(),
                })
            }
        };

        if elf.is_64 {
            return Err(AnalysisError::BinaryMalformed {
                detail: "expected a 32-bit ELF, found 64-bit".into(),
            });
        }
        if !elf.little_endian {
            return Err(AnalysisError::BinaryMalformed {
                detail: "expected a little-endian ELF".into(),
            });
        }
        if elf.syms.is_empty() {
            return Err(AnalysisError::BinaryMalformed {
                detail: "no symbol table present".into(),
            });
        }

        let symbols = Self::collect_symbols(&elf);
        let sections = Self::collect_sections(&elf, buffer);
        let vector_table = Self::read_vector_table(&sections, &symbols)?;

        Ok(Image {
            symbols,
            sections,
            vector_table,
        })
    }

    fn collect_symbols(elf: &Elf) -> BTreeMap<String, Symbol> {
        let mut symbols = BTreeMap::new();
        for sym in elf.syms.iter() {
            if sym.st_value == 0 || sym.st_name == 0 {
                continue;
            }
            let Some(name) = elf.strtab.get_at(sym.st_name) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let kind = if sym.is_function() {
                SymbolKind::Function
            } else if sym.st_info & 0xf == goblin::elf::sym::STT_OBJECT {
                SymbolKind::Object
            } else {
                continue;
            };

            let thumb = kind == SymbolKind::Function && sym.st_value & 1 != 0;
            let address = (sym.st_value as u32) & !1;

            symbols.insert(
                name.to_string(),
                Symbol {
                    address,
                    size: sym.st_size as u32,
                    kind,
                    thumb,
                },
            );
        }
        symbols
    }

    fn collect_sections(elf: &Elf, buffer: &[u8]) -> Vec<Section> {
        let mut sections = Vec::new();
        for shdr in &elf.section_headers {
            // SHF_ALLOC (0x2): section occupies memory during execution.
            if shdr.sh_flags & 0x2 == 0 || shdr.sh_size == 0 {
                continue;
            }
            let name = elf
                .shdr_strtab
                .get_at(shdr.sh_name)
                .unwrap_or("")
                .to_string();
            // SHT_NOBITS (8): .bss-like sections have no file contents.
            let bytes = if shdr.sh_type == 8 {
                vec![0u8; shdr.sh_size as usize]
            } else {
                let start = shdr.sh_offset as usize;
                let end = start + shdr.sh_size as usize;
                buffer.get(start..end).unwrap_or(&[]).to_vec()
            };
            sections.push(Section {
                name,
                addr: shdr.sh_addr as u32,
                bytes,
            });
        }
        sections
    }

    fn read_vector_table(
        sections: &[Section],
        symbols: &BTreeMap<String, Symbol>,
    ) -> Result<Vec<u32>, AnalysisError> {
        // The vector table lives at the start of the section containing the
        // `reset` symbol's start-of-text address, or .isr_vectors/.vector_table
        // if one of those names is present.
        let section = sections
            .iter()
            .find(|s| s.name == ".vector_table" || s.name == ".isr_vector")
            .or_else(|| {
                symbols.get("Reset").and_then(|reset| {
                    sections.iter().find(|s| s.contains(reset.address))
                })
            })
            .ok_or_else(|| AnalysisError::BinaryMalformed {
                detail: "no vector table section found".into(),
            })?;

        let mut words = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= section.bytes.len() {
            let word: u32 = section
                .bytes
                .pread_with(offset, Endian::Little)
                .map_err(|e| AnalysisError::BinaryMalformed {
                    detail: format!("truncated vector table: {e}"),
                })?;
            words.push(word);
            offset += 4;
        }
        if words.len() < 2 {
            return Err(AnalysisError::BinaryMalformed {
                detail: "vector table has fewer than 2 entries".into(),
            });
        }
        Ok(words)
    }

    /// Reads `len` bytes at `addr` from whichever loaded section contains
    /// it, or `None` if `addr` is not covered by any section.
    pub fn read(&self, addr: u32, len: usize) -> Option<&[u8]> {
        let section = self.sections.iter().find(|s| s.contains(addr))?;
        let start = (addr - section.addr) as usize;
        section.bytes.get(start..start + len)
    }

    pub fn function_symbol_at(&self, addr: u32) -> Option<(&str, &Symbol)> {
        self.symbols
            .iter()
            .find(|(_, s)| s.kind == SymbolKind::Function && s.address == addr)
            .map(|(n, s)| (n.as_str(), s))
    }

    /// All function symbols, in ascending address order (spec.md §5:
    /// functions are analyzed and reported in ascending address order).
    pub fn functions_by_address(&self) -> Vec<(&str, &Symbol)> {
        let mut v: Vec<_> = self
            .symbols
            .iter()
            .filter(|(_, s)| s.kind == SymbolKind::Function && s.size > 0)
            .map(|(n, s)| (n.as_str(), s))
            .collect();
        v.sort_by_key(|(name, s)| (s.address, *name));
        v
    }
}

/// Synthetic `Image` construction for tests elsewhere in the crate that
/// need a function's bytes addressable without a real ELF file on disk.
#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn synthetic_image(base: u32, text: &[u8]) -> Image {
        Image {
            symbols: BTreeMap::new(),
            sections: vec![Section {
                name: ".text".into(),
                addr: base,
                bytes: text.to_vec(),
            }],
            vector_table: vec![0x2000_0000, base | 1],
        }
    }

    pub fn image_with_symbols(symbols: BTreeMap<String, Symbol>) -> Image {
        Image {
            symbols,
            sections: Vec::new(),
            vector_table: vec![0x2000_0000, 1],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_elf_input() {
        let err = Image::parse(b"not an elf file").unwrap_err();
        assert!(matches!(err, AnalysisError::BinaryMalformed { .. }));
    }

    #[test]
    fn section_contains_is_half_open() {
        let s = Section {
            name: ".text".into(),
            addr: 0x1000,
            bytes: vec![0; 16],
        };
        assert!(s.contains(0x1000));
        assert!(s.contains(0x100f));
        assert!(!s.contains(0x1010));
        assert!(!s.contains(0x0fff));
    }
}
