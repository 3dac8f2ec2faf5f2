//! Minimal synthetic executables for tests.
//!
//! Layout produced by [`MachOBuilder::build`]:
//!
//! ```text
//! 0x0000  mach_header_64 + load commands
//! 0x0800  __TEXT,__text (0x100 bytes)
//! 0x1000  __LINKEDIT: symbols (4 x nlist_64), strings (0x40 bytes)
//! 0x1080  [padding][code signature]   (signed images only)
//! ```

use zerocopy::IntoBytes;

use super::constants::*;
use super::structs::*;
use crate::util::align_up;

const TEXT_VMADDR: u64 = 0x1_0000_0000;
const LINKEDIT_OFFSET: u64 = 0x1000;
const SYMTAB_END: u64 = 0x1080;

/// Builds small but structurally faithful 64-bit executables.
#[derive(Debug, Clone)]
pub struct MachOBuilder {
    filetype: u32,
    signature: Option<u32>,
    signature_padding: u64,
    signature_first: bool,
    duplicate_linkedit: bool,
    text_section_offset: Option<u32>,
}

impl MachOBuilder {
    pub fn new() -> Self {
        Self {
            filetype: MH_EXECUTE,
            signature: None,
            signature_padding: 0x10,
            signature_first: false,
            duplicate_linkedit: false,
            text_section_offset: Some(0x800),
        }
    }

    pub fn filetype(mut self, filetype: u32) -> Self {
        self.filetype = filetype;
        self
    }

    /// Adds a code signature blob of `size` bytes after the symbol table.
    pub fn signed(mut self, size: u32) -> Self {
        self.signature = Some(size);
        self
    }

    pub fn signature_padding(mut self, padding: u64) -> Self {
        self.signature_padding = padding;
        self
    }

    /// Places LC_CODE_SIGNATURE before LC_SYMTAB.
    pub fn signature_first(mut self) -> Self {
        self.signature_first = true;
        self
    }

    pub fn duplicate_linkedit(mut self) -> Self {
        self.duplicate_linkedit = true;
        self
    }

    /// Sets the `__text` file offset, or omits the section with `None`.
    pub fn text_section_offset(mut self, offset: Option<u32>) -> Self {
        self.text_section_offset = offset;
        self
    }

    pub fn signature_offset(&self) -> u64 {
        SYMTAB_END + self.signature_padding
    }

    pub fn build(&self) -> Vec<u8> {
        let file_len = match self.signature {
            Some(size) => self.signature_offset() + size as u64,
            None => SYMTAB_END,
        };

        let mut text = SegmentCommand64::new(SEG_TEXT, 0, LINKEDIT_OFFSET);
        text.vmaddr = TEXT_VMADDR;
        text.maxprot = (VmProt::READ | VmProt::EXECUTE).bits();
        text.initprot = text.maxprot;

        let mut text_cmd = Vec::new();
        let section = self.text_section_offset.map(|offset| {
            let mut section = Section64::default();
            section.set_names(SEG_TEXT, SECT_TEXT);
            section.addr = TEXT_VMADDR + offset as u64;
            section.size = 0x100;
            section.offset = offset;
            section.align = 2;
            section
        });
        if let Some(section) = &section {
            text.nsects = 1;
            text.cmdsize = (SegmentCommand64::SIZE + Section64::SIZE) as u32;
            text_cmd.extend_from_slice(text.as_bytes());
            text_cmd.extend_from_slice(section.as_bytes());
        } else {
            text_cmd.extend_from_slice(text.as_bytes());
        }

        let linkedit_size = file_len - LINKEDIT_OFFSET;
        let mut linkedit = SegmentCommand64::new(SEG_LINKEDIT, LINKEDIT_OFFSET, linkedit_size);
        linkedit.vmaddr = TEXT_VMADDR + LINKEDIT_OFFSET;
        linkedit.vmsize = align_up(linkedit_size, SEGMENT_ALIGNMENT);
        linkedit.maxprot = VmProt::READ.bits();
        linkedit.initprot = linkedit.maxprot;

        let symtab = SymtabCommand {
            symoff: LINKEDIT_OFFSET as u32,
            nsyms: 4,
            stroff: (LINKEDIT_OFFSET + 4 * SymtabCommand::NLIST_SIZE) as u32,
            strsize: 0x40,
            ..SymtabCommand::default()
        };

        let signature = self.signature.map(|size| LinkeditDataCommand {
            dataoff: self.signature_offset() as u32,
            datasize: size,
            ..LinkeditDataCommand::default()
        });

        let mut commands: Vec<Vec<u8>> = vec![text_cmd, linkedit.as_bytes().to_vec()];
        if self.duplicate_linkedit {
            commands.push(linkedit.as_bytes().to_vec());
        }
        match (&signature, self.signature_first) {
            (Some(sig), true) => {
                commands.push(sig.as_bytes().to_vec());
                commands.push(symtab.as_bytes().to_vec());
            }
            (Some(sig), false) => {
                commands.push(symtab.as_bytes().to_vec());
                commands.push(sig.as_bytes().to_vec());
            }
            (None, _) => commands.push(symtab.as_bytes().to_vec()),
        }

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: CPU_SUBTYPE_ARM64_ALL,
            filetype: self.filetype,
            ncmds: commands.len() as u32,
            sizeofcmds: commands.iter().map(|c| c.len() as u32).sum(),
            flags: 0,
            reserved: 0,
        };

        let mut data = vec![0u8; file_len as usize];
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
        let mut offset = MachHeader64::SIZE;
        for cmd in &commands {
            data[offset..offset + cmd.len()].copy_from_slice(cmd);
            offset += cmd.len();
        }

        if let Some(section) = &section {
            let start = section.offset as usize;
            data[start..start + section.size as usize].fill(0xC3);
        }
        data[LINKEDIT_OFFSET as usize..SYMTAB_END as usize].fill(0x5A);
        if let Some(sig) = &signature {
            data[sig.dataoff as usize..].fill(0xFA);
        }

        data
    }
}
