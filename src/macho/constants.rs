//! Mach-O constants and flags.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (native byte order)
pub const MH_MAGIC_64: u32 = 0xFEED_FACF;

/// 64-bit Mach-O magic (opposite byte order)
pub const MH_CIGAM_64: u32 = 0xCFFA_EDFE;

/// 32-bit Mach-O magic (native byte order)
pub const MH_MAGIC: u32 = 0xFEED_FACE;

/// 32-bit Mach-O magic (opposite byte order)
pub const MH_CIGAM: u32 = 0xCEFA_EDFE;

// =============================================================================
// File Types
// =============================================================================

/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

/// ARM64 all
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;

// =============================================================================
// Load Commands
// =============================================================================

/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// 64-bit segment of this file
pub const LC_SEGMENT_64: u32 = 0x19;
/// Location of the code signature blob
pub const LC_CODE_SIGNATURE: u32 = 0x1D;

// =============================================================================
// Segment and Section Names
// =============================================================================

/// Segment holding the executable image, starting at file offset 0.
pub const SEG_TEXT: &str = "__TEXT";
/// Segment holding symbol tables and signature data.
pub const SEG_LINKEDIT: &str = "__LINKEDIT";
/// Extra segment covering data appended by the bundler.
pub const SEG_BUNDLE: &str = "__BUNDLE";
/// Section holding the executable code.
pub const SECT_TEXT: &str = "__text";

// =============================================================================
// Layout
// =============================================================================

/// Page size used for VM addresses of new segments (arm64 page size).
pub const SEGMENT_ALIGNMENT: u64 = 0x4000;

/// Maximum padding between the end of the string table and the code signature.
pub const SIGNATURE_PADDING_LIMIT: u64 = 32;

// =============================================================================
// Segment Flags
// =============================================================================

bitflags! {
    /// Segment command flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        /// The file contents for this segment is for the high part of the VM space
        const HIGHVM = 0x1;
        /// This segment is the VM that is allocated by a fixed VM library
        const FVMLIB = 0x2;
        /// This segment has nothing that was relocated in it and nothing relocated to it
        const NORELOC = 0x4;
        /// This segment is protected
        const PROTECTED_VERSION_1 = 0x8;
        /// This segment is made read-only after fixups
        const READ_ONLY = 0x10;
    }
}

bitflags! {
    /// Virtual memory protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: u32 {
        /// Readable
        const READ = 0x1;
        /// Writable
        const WRITE = 0x2;
        /// Executable
        const EXECUTE = 0x4;
    }
}
