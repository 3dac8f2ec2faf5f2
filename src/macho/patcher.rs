//! In-place Mach-O patching for bundled executables.
//!
//! Two operations keep a bundled macOS executable loadable:
//!
//! - [`remove_signature`] strips the code signature of the host stub before
//!   anything is appended. The signature blob has to be the last thing in the
//!   file, and it is invalidated by the marker patch anyway.
//! - [`add_bundle_segment`] describes the appended payload with an extra
//!   `__BUNDLE` segment, so strict loaders and signing tools do not treat it
//!   as trailing garbage.
//!
//! Both hold an exclusive lock on the file, map it writable and check every
//! structural invariant before the first byte is changed.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::Path;

use memmap2::MmapMut;
use tracing::{debug, info};

use super::constants::*;
use super::image::{write_struct, MachOImage, SegmentInfo};
use super::structs::*;
use crate::error::{Error, MachOFormatError, Result};
use crate::util::align_up;

// =============================================================================
// Outcomes
// =============================================================================

/// Result of [`remove_signature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureRemoval {
    /// The signature was removed and the file shrank by `blob_size` bytes.
    Removed {
        /// Size of the removed signature blob.
        blob_size: u32,
    },
    /// The executable carries no code signature.
    Unsigned,
    /// The file is not a native 64-bit Mach-O image.
    NotMachO,
}

impl SignatureRemoval {
    /// Returns true if a signature was removed.
    #[inline]
    pub fn removed(&self) -> bool {
        matches!(self, SignatureRemoval::Removed { .. })
    }
}

/// Result of [`add_bundle_segment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentAddition {
    /// A `__BUNDLE` segment covering `fileoff..fileoff + filesize` was added.
    Added {
        /// File offset of the first appended byte.
        fileoff: u64,
        /// Number of appended bytes.
        filesize: u64,
    },
    /// A `__BUNDLE` segment already covers the appended data.
    AlreadyPresent,
    /// The file is not a native 64-bit Mach-O image.
    NotMachO,
}

impl SegmentAddition {
    /// Returns true if the header was modified.
    #[inline]
    pub fn added(&self) -> bool {
        matches!(self, SegmentAddition::Added { .. })
    }
}

// =============================================================================
// File Access
// =============================================================================

/// Opens `path` read-write and takes an exclusive advisory lock on it.
fn open_locked(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;

    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => Err(Error::FileLocked {
            path: path.to_path_buf(),
        }),
        Err(TryLockError::Error(e)) => Err(Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Maps a locked file writable, or returns `None` if it is too short to hold
/// a Mach-O header.
fn map_locked(file: &File, path: &Path) -> Result<Option<(MmapMut, u64)>> {
    let file_len = file.metadata()?.len();
    if file_len < MachHeader64::SIZE as u64 {
        return Ok(None);
    }

    let mmap = unsafe { MmapMut::map_mut(file) }.map_err(|e| Error::MemoryMap {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok(Some((mmap, file_len)))
}

/// Returns the `__LINKEDIT` segment, requiring it to be the last segment in
/// the file.
fn last_linkedit(image: &MachOImage) -> Result<&SegmentInfo> {
    let linkedit = image
        .unique_segment(SEG_LINKEDIT)?
        .ok_or(MachOFormatError::MissingLinkEditSegment)?;

    let linkedit_end = linkedit.command.file_end();
    for seg in image.segments() {
        if seg.command_offset != linkedit.command_offset
            && seg.command.filesize > 0
            && seg.command.file_end() > linkedit.command.fileoff
            && !seg.command.is_named(SEG_BUNDLE)
        {
            return Err(MachOFormatError::LinkEditNotLast {
                end: linkedit_end,
                file_len: seg.command.file_end(),
            }
            .into());
        }
    }

    Ok(linkedit)
}

// =============================================================================
// Signature Removal
// =============================================================================

/// The verified edits that strip a code signature.
#[derive(Debug)]
struct SignatureStrip {
    header: MachHeader64,
    linkedit: SegmentCommand64,
    linkedit_offset: usize,
    command_offset: usize,
    command_size: usize,
    blob_size: u32,
}

impl SignatureStrip {
    /// Checks every invariant of a signed image and records the edits.
    ///
    /// Returns `None` for an unsigned image.
    fn plan(image: &MachOImage, file_len: u64) -> Result<Option<Self>> {
        let linkedit = image.unique_segment(SEG_LINKEDIT)?;
        let symtab = image.unique_symtab()?;

        let Some((index, signature, command_offset)) = image.code_signature() else {
            return Ok(None);
        };

        if index + 1 != image.load_commands.len() {
            return Err(MachOFormatError::SignatureCommandNotLast.into());
        }
        if linkedit.is_none() {
            return Err(MachOFormatError::MissingLinkEditSegment.into());
        }
        let (symtab, _) = symtab.ok_or(MachOFormatError::MissingSymtab)?;
        let linkedit = last_linkedit(image)?;
        let seg = &linkedit.command;

        if seg.file_end() != file_len {
            return Err(MachOFormatError::LinkEditNotLast {
                end: seg.file_end(),
                file_len,
            }
            .into());
        }
        if signature.end() != file_len {
            return Err(MachOFormatError::SignatureBlobNotLast {
                end: signature.end(),
                file_len,
            }
            .into());
        }
        if !seg.contains_file_range(symtab.start(), symtab.end()) {
            return Err(MachOFormatError::SymtabNotInLinkEdit.into());
        }
        if !seg.contains_file_range(signature.dataoff as u64, signature.end()) {
            return Err(MachOFormatError::SignatureNotInLinkEdit.into());
        }

        let dataoff = signature.dataoff as u64;
        let symtab_end = symtab.end();
        if dataoff < symtab_end || dataoff - symtab_end >= SIGNATURE_PADDING_LIMIT {
            return Err(MachOFormatError::SignatureNotAfterSymtab {
                dataoff,
                symtab_end,
            }
            .into());
        }
        if seg.vmsize < signature.datasize as u64 {
            return Err(MachOFormatError::MalformedCommand {
                offset: linkedit.command_offset,
                reason: "'__LINKEDIT' vmsize is smaller than the code signature",
            }
            .into());
        }

        Ok(Some(Self {
            header: image.header,
            linkedit: *seg,
            linkedit_offset: linkedit.command_offset,
            command_offset,
            command_size: signature.cmdsize as usize,
            blob_size: signature.datasize,
        }))
    }

    /// Rewrites the header, the `__LINKEDIT` command and the signature command.
    fn apply(mut self, data: &mut [u8]) -> Result<()> {
        let blob = self.blob_size as u64;

        let end = self.command_offset + self.command_size;
        data.get_mut(self.command_offset..end)
            .ok_or(MachOFormatError::LoadCommandOverflow {
                offset: self.command_offset,
            })?
            .fill(0);

        self.header.ncmds -= 1;
        self.header.sizeofcmds -= self.command_size as u32;
        write_struct(data, 0, &self.header)?;

        self.linkedit.filesize -= blob;
        self.linkedit.vmsize -= blob;
        write_struct(data, self.linkedit_offset, &self.linkedit)?;

        Ok(())
    }
}

/// Removes the code signature from a 64-bit Mach-O executable in place.
///
/// The `LC_CODE_SIGNATURE` command is erased, `__LINKEDIT` is shrunk by the
/// blob size and the file is truncated accordingly. Files that are not 64-bit
/// Mach-O images are left alone and reported as [`SignatureRemoval::NotMachO`].
pub fn remove_signature<P: AsRef<Path>>(path: P) -> Result<SignatureRemoval> {
    let path = path.as_ref();
    let file = open_locked(path)?;

    let Some((mut mmap, file_len)) = map_locked(&file, path)? else {
        return Ok(SignatureRemoval::NotMachO);
    };
    let Some(image) = MachOImage::parse(&mmap)? else {
        return Ok(SignatureRemoval::NotMachO);
    };
    debug!("{}: {}", path.display(), image.header);

    let Some(strip) = SignatureStrip::plan(&image, file_len)? else {
        debug!("{} is not signed", path.display());
        return Ok(SignatureRemoval::Unsigned);
    };

    let blob_size = strip.blob_size;
    strip.apply(&mut mmap)?;
    mmap.flush()?;
    drop(mmap);

    file.set_len(file_len - blob_size as u64)?;

    info!(
        "Removed {} byte code signature from {}",
        blob_size,
        path.display()
    );

    Ok(SignatureRemoval::Removed { blob_size })
}

// =============================================================================
// Bundle Segment
// =============================================================================

/// Describes the data appended after `__LINKEDIT` with a `__BUNDLE` segment.
///
/// The new `LC_SEGMENT_64` is written into the zero padding between the load
/// commands and the `__text` section. The image must already be unsigned.
pub fn add_bundle_segment<P: AsRef<Path>>(path: P) -> Result<SegmentAddition> {
    let path = path.as_ref();
    let file = open_locked(path)?;

    let Some((mut mmap, file_len)) = map_locked(&file, path)? else {
        return Ok(SegmentAddition::NotMachO);
    };
    let Some(image) = MachOImage::parse(&mmap)? else {
        return Ok(SegmentAddition::NotMachO);
    };
    debug!("{}: {}", path.display(), image.header);

    let text = image
        .unique_segment(SEG_TEXT)?
        .ok_or(MachOFormatError::MissingTextSegment)?;
    if text.command.fileoff != 0 {
        return Err(MachOFormatError::TextSegmentNotAtStart(text.command.fileoff).into());
    }

    let mut text_sections = text.sections.iter().filter(|s| s.section.name() == SECT_TEXT);
    let text_section = text_sections
        .next()
        .ok_or(MachOFormatError::MissingTextSection)?;
    if text_sections.next().is_some() {
        return Err(MachOFormatError::DuplicateTextSection.into());
    }

    let linkedit = last_linkedit(&image)?;
    if image.code_signature().is_some() {
        return Err(MachOFormatError::SignatureNotRemoved.into());
    }

    let fileoff = linkedit.command.file_end();
    if fileoff > file_len {
        return Err(MachOFormatError::LinkEditNotLast {
            end: fileoff,
            file_len,
        }
        .into());
    }
    let filesize = file_len - fileoff;

    if let Some(existing) = image.unique_segment(SEG_BUNDLE)? {
        if existing.command.fileoff == fileoff && existing.command.file_end() == file_len {
            debug!("{} already has a bundle segment", path.display());
            return Ok(SegmentAddition::AlreadyPresent);
        }
        return Err(MachOFormatError::MalformedCommand {
            offset: existing.command_offset,
            reason: "existing '__BUNDLE' segment does not cover the appended data",
        }
        .into());
    }

    if filesize == 0 {
        return Err(MachOFormatError::NothingAppended.into());
    }

    // The new command must fit into zero padding before the first code byte.
    let commands_end = image.header.commands_end();
    let text_start = (text_section.section.offset as usize).clamp(commands_end, mmap.len());
    let available = mmap[commands_end..text_start]
        .iter()
        .take_while(|&&b| b == 0)
        .count();
    if available < SegmentCommand64::SIZE {
        return Err(MachOFormatError::NoSpaceForCommand {
            needed: SegmentCommand64::SIZE,
            available,
        }
        .into());
    }

    let linkedit_vm_end = linkedit.command.vmaddr + linkedit.command.vmsize;
    let mut segment = SegmentCommand64::new(SEG_BUNDLE, fileoff, filesize);
    segment.vmaddr = align_up(linkedit_vm_end, SEGMENT_ALIGNMENT);
    segment.flags = SegmentFlags::NORELOC.bits();

    let mut header = image.header;
    header.ncmds += 1;
    header.sizeofcmds += SegmentCommand64::SIZE as u32;

    write_struct(&mut mmap, commands_end, &segment)?;
    write_struct(&mut mmap, 0, &header)?;
    mmap.flush()?;

    info!(
        "Added {} segment covering {:#x}+{:#x} to {}",
        SEG_BUNDLE,
        fileoff,
        filesize,
        path.display()
    );

    Ok(SegmentAddition::Added { fileoff, filesize })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;
    use crate::macho::fixtures::MachOBuilder;
    use crate::macho::image::read_struct;

    fn write_fixture(dir: &TempDir, data: &[u8]) -> PathBuf {
        let path = dir.path().join("host");
        fs::write(&path, data).unwrap();
        path
    }

    fn parse_file(path: &Path) -> MachOImage {
        let data = fs::read(path).unwrap();
        MachOImage::parse(&data).unwrap().unwrap()
    }

    fn assert_format_error(err: Error, expected: MachOFormatError) {
        match err {
            Error::MachO(actual) => assert_eq!(actual, expected),
            other => panic!("expected {expected:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_remove_signature() {
        let dir = TempDir::new().unwrap();
        let builder = MachOBuilder::new().signed(0x170);
        let path = write_fixture(&dir, &builder.build());

        let outcome = remove_signature(&path).unwrap();
        assert_eq!(outcome, SignatureRemoval::Removed { blob_size: 0x170 });
        assert!(outcome.removed());

        let data = fs::read(&path).unwrap();
        assert_eq!(data.len() as u64, builder.signature_offset());

        let image = MachOImage::parse(&data).unwrap().unwrap();
        assert_eq!(image.header.ncmds, 3);
        assert_eq!(image.load_commands_size(), image.header.sizeofcmds as usize);
        assert!(image.code_signature().is_none());

        let linkedit = image.unique_segment(SEG_LINKEDIT).unwrap().unwrap();
        assert_eq!(linkedit.command.file_end(), data.len() as u64);
        assert_eq!(linkedit.command.vmsize, SEGMENT_ALIGNMENT - 0x170);

        // The erased command is zero padding now.
        let end = image.header.commands_end();
        assert!(data[end..end + LinkeditDataCommand::SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_remove_signature_twice() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(&dir, &MachOBuilder::new().signed(0x100).build());

        assert!(remove_signature(&path).unwrap().removed());
        let stripped = fs::read(&path).unwrap();

        assert_eq!(remove_signature(&path).unwrap(), SignatureRemoval::Unsigned);
        assert_eq!(fs::read(&path).unwrap(), stripped);
    }

    #[test]
    fn test_remove_signature_not_macho() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(&dir, b"#!/bin/sh\necho not a mach-o image\n");
        assert_eq!(remove_signature(&path).unwrap(), SignatureRemoval::NotMachO);

        let path = write_fixture(&dir, b"");
        assert_eq!(remove_signature(&path).unwrap(), SignatureRemoval::NotMachO);
    }

    #[test]
    fn test_remove_signature_not_last_command() {
        let dir = TempDir::new().unwrap();
        let original = MachOBuilder::new().signed(0x100).signature_first().build();
        let path = write_fixture(&dir, &original);

        let err = remove_signature(&path).unwrap_err();
        assert!(err.is_format_error());
        assert_format_error(err, MachOFormatError::SignatureCommandNotLast);
        assert_eq!(fs::read(&path).unwrap(), original);
    }

    #[test]
    fn test_remove_signature_padding_too_large() {
        let dir = TempDir::new().unwrap();
        let original = MachOBuilder::new()
            .signed(0x100)
            .signature_padding(SIGNATURE_PADDING_LIMIT)
            .build();
        let path = write_fixture(&dir, &original);

        let err = remove_signature(&path).unwrap_err();
        assert_format_error(
            err,
            MachOFormatError::SignatureNotAfterSymtab {
                dataoff: 0x1080 + SIGNATURE_PADDING_LIMIT,
                symtab_end: 0x1080,
            },
        );
        assert_eq!(fs::read(&path).unwrap(), original);
    }

    #[test]
    fn test_remove_signature_trailing_data() {
        let dir = TempDir::new().unwrap();
        let mut original = MachOBuilder::new().signed(0x100).build();
        original.extend_from_slice(b"trailing");
        let path = write_fixture(&dir, &original);

        let err = remove_signature(&path).unwrap_err();
        assert!(matches!(
            err,
            Error::MachO(MachOFormatError::LinkEditNotLast { .. })
        ));
        assert_eq!(fs::read(&path).unwrap(), original);
    }

    #[test]
    fn test_remove_signature_duplicate_linkedit() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(
            &dir,
            &MachOBuilder::new().signed(0x100).duplicate_linkedit().build(),
        );

        let err = remove_signature(&path).unwrap_err();
        assert_format_error(err, MachOFormatError::DuplicateSegment { name: SEG_LINKEDIT });
    }

    #[test]
    fn test_remove_signature_locked() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(&dir, &MachOBuilder::new().signed(0x100).build());

        let holder = File::open(&path).unwrap();
        holder.lock().unwrap();

        let err = remove_signature(&path).unwrap_err();
        assert!(matches!(err, Error::FileLocked { .. }));

        holder.unlock().unwrap();
        assert!(remove_signature(&path).unwrap().removed());
    }

    #[test]
    fn test_add_bundle_segment() {
        let dir = TempDir::new().unwrap();
        let mut data = MachOBuilder::new().build();
        let fileoff = data.len() as u64;
        data.extend_from_slice(&[0xAB; 0x200]);
        let path = write_fixture(&dir, &data);

        let outcome = add_bundle_segment(&path).unwrap();
        assert_eq!(
            outcome,
            SegmentAddition::Added {
                fileoff,
                filesize: 0x200
            }
        );
        assert!(outcome.added());

        let image = parse_file(&path);
        assert_eq!(image.header.ncmds, 4);
        assert_eq!(image.load_commands_size(), image.header.sizeofcmds as usize);

        let bundle = image.unique_segment(SEG_BUNDLE).unwrap().unwrap();
        assert_eq!(bundle.command.fileoff, fileoff);
        assert_eq!(bundle.command.filesize, 0x200);
        assert_eq!(bundle.command.vmsize, 0x200);
        assert_eq!(bundle.command.vmaddr, 0x1_0000_8000);
        assert_eq!(bundle.command.maxprot, 0);
        assert_eq!(bundle.command.initprot, 0);
        assert_eq!(bundle.command.flags, SegmentFlags::NORELOC.bits());
        assert_eq!(bundle.command.nsects, 0);

        // Payload bytes are untouched.
        let patched = fs::read(&path).unwrap();
        assert_eq!(&patched[fileoff as usize..], &data[fileoff as usize..]);
    }

    #[test]
    fn test_add_bundle_segment_twice() {
        let dir = TempDir::new().unwrap();
        let mut data = MachOBuilder::new().build();
        data.extend_from_slice(&[0x11; 0x40]);
        let path = write_fixture(&dir, &data);

        assert!(add_bundle_segment(&path).unwrap().added());
        let patched = fs::read(&path).unwrap();

        assert_eq!(
            add_bundle_segment(&path).unwrap(),
            SegmentAddition::AlreadyPresent
        );
        assert_eq!(fs::read(&path).unwrap(), patched);
    }

    #[test]
    fn test_add_bundle_segment_requires_unsigned() {
        let dir = TempDir::new().unwrap();
        let mut data = MachOBuilder::new().signed(0x100).build();
        data.extend_from_slice(&[0x11; 0x40]);
        let path = write_fixture(&dir, &data);

        let err = add_bundle_segment(&path).unwrap_err();
        assert_format_error(err, MachOFormatError::SignatureNotRemoved);
        assert_eq!(fs::read(&path).unwrap(), data);
    }

    #[test]
    fn test_add_bundle_segment_nothing_appended() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(&dir, &MachOBuilder::new().build());

        let err = add_bundle_segment(&path).unwrap_err();
        assert_format_error(err, MachOFormatError::NothingAppended);
    }

    #[test]
    fn test_add_bundle_segment_no_space() {
        let dir = TempDir::new().unwrap();
        let mut data = MachOBuilder::new().text_section_offset(Some(0x150)).build();
        data.extend_from_slice(&[0x11; 0x40]);
        let path = write_fixture(&dir, &data);

        let commands_end = read_struct::<MachHeader64>(&data, 0).unwrap().commands_end();
        let err = add_bundle_segment(&path).unwrap_err();
        assert_format_error(
            err,
            MachOFormatError::NoSpaceForCommand {
                needed: SegmentCommand64::SIZE,
                available: 0x150 - commands_end,
            },
        );
        assert_eq!(fs::read(&path).unwrap(), data);
    }

    #[test]
    fn test_add_bundle_segment_padding_not_zero() {
        let dir = TempDir::new().unwrap();
        let mut data = MachOBuilder::new().build();
        let commands_end = read_struct::<MachHeader64>(&data, 0).unwrap().commands_end();
        data[commands_end + 10] = 0x90;
        data.extend_from_slice(&[0x11; 0x40]);
        let path = write_fixture(&dir, &data);

        let err = add_bundle_segment(&path).unwrap_err();
        assert_format_error(
            err,
            MachOFormatError::NoSpaceForCommand {
                needed: SegmentCommand64::SIZE,
                available: 10,
            },
        );
    }

    #[test]
    fn test_add_bundle_segment_missing_text_section() {
        let dir = TempDir::new().unwrap();
        let mut data = MachOBuilder::new().text_section_offset(None).build();
        data.extend_from_slice(&[0x11; 0x40]);
        let path = write_fixture(&dir, &data);

        let err = add_bundle_segment(&path).unwrap_err();
        assert_format_error(err, MachOFormatError::MissingTextSection);
    }

    #[test]
    fn test_add_bundle_segment_not_macho() {
        let dir = TempDir::new().unwrap();
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(b"\x7fELF");
        let path = write_fixture(&dir, &data);
        assert_eq!(add_bundle_segment(&path).unwrap(), SegmentAddition::NotMachO);
    }
}
