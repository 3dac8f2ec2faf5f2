//! Parsed view of a 64-bit Mach-O image's load command table.
//!
//! The image is parsed from a byte slice (usually a memory map of the whole
//! file). Every record is copied out through bounds-checked `zerocopy` reads,
//! and each parsed command remembers its file offset so the patcher can write
//! the modified record back in place with [`write_struct`].

use zerocopy::{FromBytes, Immutable, IntoBytes};

use super::constants::*;
use super::structs::*;
use crate::error::{MachOFormatError, Result};

// =============================================================================
// Struct Access
// =============================================================================

/// Reads a `T` at `offset`, or `None` if it does not fit in `data`.
pub fn read_struct<T: FromBytes>(data: &[u8], offset: usize) -> Option<T> {
    let bytes = data.get(offset..)?;
    T::read_from_prefix(bytes).ok().map(|(value, _)| value)
}

/// Writes `value` at `offset`, failing if it does not fit in `data`.
pub fn write_struct<T: IntoBytes + Immutable>(
    data: &mut [u8],
    offset: usize,
    value: &T,
) -> std::result::Result<(), MachOFormatError> {
    let overflow = MachOFormatError::LoadCommandOverflow { offset };
    let dst = data.get_mut(offset..).ok_or(overflow.clone())?;
    value.write_to_prefix(dst).map_err(|_| overflow)
}

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command
    pub command: SegmentCommand64,
    /// Offset of the segment command in the file
    pub command_offset: usize,
    /// Sections in this segment
    pub sections: Vec<SectionInfo>,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns a section by name.
    pub fn section(&self, name: &str) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.section.name() == name)
    }
}

/// Parsed section information.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// The section structure
    pub section: Section64,
    /// Offset of the section structure in the file
    pub struct_offset: usize,
}

// =============================================================================
// Load Command Info
// =============================================================================

/// Parsed load command information.
///
/// Only the commands the patcher reasons about are decoded; everything else
/// is kept as its opaque size.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum LoadCommandInfo {
    Segment(SegmentInfo),
    Symtab {
        command: SymtabCommand,
        offset: usize,
    },
    CodeSignature {
        command: LinkeditDataCommand,
        offset: usize,
    },
    Other {
        cmdsize: u32,
    },
}

impl LoadCommandInfo {
    /// Returns the load command size.
    pub fn size(&self) -> u32 {
        match self {
            LoadCommandInfo::Segment(s) => s.command.cmdsize,
            LoadCommandInfo::Symtab { command, .. } => command.cmdsize,
            LoadCommandInfo::CodeSignature { command, .. } => command.cmdsize,
            LoadCommandInfo::Other { cmdsize, .. } => *cmdsize,
        }
    }
}

// =============================================================================
// Mach-O Image
// =============================================================================

/// The header and load command table of a 64-bit Mach-O image.
#[derive(Debug, Clone)]
pub struct MachOImage {
    /// The Mach-O header
    pub header: MachHeader64,
    /// Parsed load commands, in file order
    pub load_commands: Vec<LoadCommandInfo>,
}

impl MachOImage {
    /// Parses the header and load commands at the start of `data`.
    ///
    /// Returns `Ok(None)` when `data` does not start with a native 64-bit
    /// Mach-O magic: other formats are passed through, not rejected.
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        let header = match read_struct::<MachHeader64>(data, 0) {
            Some(header) if header.is_valid() => header,
            _ => return Ok(None),
        };

        if !header.is_executable() {
            return Err(MachOFormatError::NotExecutable(header.filetype).into());
        }

        let end_offset = header.commands_end();
        if end_offset > data.len() {
            return Err(MachOFormatError::LoadCommandOverflow {
                offset: MachHeader64::SIZE,
            }
            .into());
        }

        let mut load_commands = Vec::with_capacity(header.ncmds as usize);
        let mut offset = MachHeader64::SIZE;

        for _ in 0..header.ncmds {
            let lc = match read_struct::<LoadCommand>(data, offset) {
                Some(lc) if offset + LoadCommand::SIZE <= end_offset => lc,
                _ => return Err(MachOFormatError::LoadCommandOverflow { offset }.into()),
            };

            let cmdsize = lc.cmdsize as usize;
            if cmdsize < LoadCommand::SIZE || offset + cmdsize > end_offset {
                return Err(MachOFormatError::LoadCommandOverflow { offset }.into());
            }

            let cmd_data = &data[offset..offset + cmdsize];
            load_commands.push(Self::parse_load_command(lc, cmd_data, offset)?);
            offset += cmdsize;
        }

        Ok(Some(Self {
            header,
            load_commands,
        }))
    }

    /// Parses a single load command from its own bytes.
    fn parse_load_command(lc: LoadCommand, data: &[u8], offset: usize) -> Result<LoadCommandInfo> {
        let malformed = |reason| MachOFormatError::MalformedCommand { offset, reason };

        match lc.cmd {
            LC_SEGMENT_64 => {
                let seg = read_struct::<SegmentCommand64>(data, 0)
                    .ok_or_else(|| malformed("truncated segment command"))?;

                if std::str::from_utf8(seg.name_bytes()).is_err() {
                    return Err(MachOFormatError::InvalidSegmentName { offset }.into());
                }

                let mut sections = Vec::with_capacity(seg.nsects as usize);
                let mut sect_offset = SegmentCommand64::SIZE;

                for _ in 0..seg.nsects {
                    let section = read_struct::<Section64>(data, sect_offset)
                        .ok_or_else(|| malformed("section table overruns segment command"))?;

                    sections.push(SectionInfo {
                        section,
                        struct_offset: offset + sect_offset,
                    });

                    sect_offset += Section64::SIZE;
                }

                Ok(LoadCommandInfo::Segment(SegmentInfo {
                    command: seg,
                    command_offset: offset,
                    sections,
                }))
            }

            LC_SYMTAB => {
                let command = read_struct::<SymtabCommand>(data, 0)
                    .ok_or_else(|| malformed("truncated symtab command"))?;
                Ok(LoadCommandInfo::Symtab { command, offset })
            }

            LC_CODE_SIGNATURE => {
                let command = read_struct::<LinkeditDataCommand>(data, 0)
                    .ok_or_else(|| malformed("truncated code signature command"))?;
                Ok(LoadCommandInfo::CodeSignature { command, offset })
            }

            _ => Ok(LoadCommandInfo::Other {
                cmdsize: lc.cmdsize,
            }),
        }
    }

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.load_commands.iter().filter_map(|lc| {
            if let LoadCommandInfo::Segment(seg) = lc {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns the only segment with the given name.
    ///
    /// A second segment with the same name is a format error.
    pub fn unique_segment(&self, name: &'static str) -> Result<Option<&SegmentInfo>> {
        let mut found = None;
        for seg in self.segments().filter(|s| s.command.is_named(name)) {
            if found.is_some() {
                return Err(MachOFormatError::DuplicateSegment { name }.into());
            }
            found = Some(seg);
        }
        Ok(found)
    }

    /// Returns the only LC_SYMTAB command and its offset.
    pub fn unique_symtab(&self) -> Result<Option<(SymtabCommand, usize)>> {
        let mut found = None;
        for lc in &self.load_commands {
            if let LoadCommandInfo::Symtab { command, offset } = lc {
                if found.is_some() {
                    return Err(MachOFormatError::DuplicateSymtab.into());
                }
                found = Some((*command, *offset));
            }
        }
        Ok(found)
    }

    /// Returns the code signature command and its index in the command table.
    pub fn code_signature(&self) -> Option<(usize, LinkeditDataCommand, usize)> {
        self.load_commands
            .iter()
            .enumerate()
            .find_map(|(index, lc)| match lc {
                LoadCommandInfo::CodeSignature { command, offset } => {
                    Some((index, *command, *offset))
                }
                _ => None,
            })
    }

    /// Returns the total size of load commands.
    pub fn load_commands_size(&self) -> usize {
        self.load_commands.iter().map(|lc| lc.size() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::fixtures::MachOBuilder;

    #[test]
    fn test_parse_signed_executable() {
        let data = MachOBuilder::new().signed(0x170).build();
        let image = MachOImage::parse(&data).unwrap().unwrap();

        assert!(image.header.is_valid());
        assert_eq!(image.header.ncmds, 4);
        assert_eq!(image.load_commands.len(), 4);
        assert_eq!(image.load_commands_size(), image.header.sizeofcmds as usize);

        let text = image.unique_segment(SEG_TEXT).unwrap().unwrap();
        assert_eq!(text.command.fileoff, 0);
        assert!(text.section(SECT_TEXT).is_some());

        let (index, sig, _) = image.code_signature().unwrap();
        assert_eq!(index, 3);
        assert_eq!(sig.datasize, 0x170);
    }

    #[test]
    fn test_parse_foreign_data() {
        assert!(MachOImage::parse(b"\x7fELF\x02\x01\x01").unwrap().is_none());
        assert!(MachOImage::parse(&[]).unwrap().is_none());

        let mut data = MachOBuilder::new().build();
        data[..4].copy_from_slice(&MH_CIGAM_64.to_ne_bytes());
        assert!(MachOImage::parse(&data).unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_non_executable() {
        let data = MachOBuilder::new().filetype(MH_DYLIB).build();
        let err = MachOImage::parse(&data).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::MachO(MachOFormatError::NotExecutable(MH_DYLIB))
        ));
    }

    #[test]
    fn test_parse_rejects_truncated_commands() {
        let mut data = MachOBuilder::new().build();
        // Claim one more command than the table holds.
        let mut header = read_struct::<MachHeader64>(&data, 0).unwrap();
        header.ncmds += 1;
        write_struct(&mut data, 0, &header).unwrap();

        let err = MachOImage::parse(&data).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::MachO(MachOFormatError::LoadCommandOverflow { .. })
        ));
    }

    #[test]
    fn test_duplicate_segment() {
        let data = MachOBuilder::new().duplicate_linkedit().build();
        let image = MachOImage::parse(&data).unwrap().unwrap();
        assert!(matches!(
            image.unique_segment(SEG_LINKEDIT),
            Err(crate::Error::MachO(MachOFormatError::DuplicateSegment {
                name: "__LINKEDIT"
            }))
        ));
    }

    #[test]
    fn test_write_struct_bounds() {
        let mut data = vec![0u8; 16];
        assert!(write_struct(&mut data, 0, &LinkeditDataCommand::default()).is_ok());
        assert!(write_struct(&mut data, 1, &LinkeditDataCommand::default()).is_err());
        assert!(write_struct(&mut data, 64, &LinkeditDataCommand::default()).is_err());
        assert!(read_struct::<LinkeditDataCommand>(&data, 1).is_none());
    }
}
