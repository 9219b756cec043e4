//! Link-time configuration
//!
//! Options are a flat struct of named fields; the driver translates its
//! command line into this struct and the core never looks options up
//! dynamically. Only the switches the core depends on appear here.

use typed_builder::TypedBuilder;

use crate::elf::Machine;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// `--icf` mode
pub enum IcfMode {
    #[default]
    None,
    /// Fold only sections whose address is provably never compared
    Safe,
    /// Fold everything byte-identical
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// `--hash-style`
pub enum HashStyle {
    Sysv,
    Gnu,
    #[default]
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// `--unresolved-symbols`
pub enum UnresolvedPolicy {
    #[default]
    ReportAll,
    IgnoreAll,
    IgnoreInObjectFiles,
    IgnoreInSharedLibs,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// `--build-id`
pub enum BuildIdKind {
    #[default]
    None,
    /// 16-byte hash of the output image
    Fast,
    /// 16 random-looking bytes derived from the image hash
    Uuid,
    /// A literal hex string from the command line
    Hex(Vec<u8>),
}

impl BuildIdKind {
    pub fn size(&self) -> usize {
        match self {
            BuildIdKind::None => 0,
            BuildIdKind::Fast | BuildIdKind::Uuid => 16,
            BuildIdKind::Hex(bytes) => bytes.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// `--compress-debug-sections`
pub enum CompressKind {
    #[default]
    None,
    Zlib,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// `-Bsymbolic` flavors
pub enum BsymbolicKind {
    #[default]
    None,
    All,
    Functions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// `-z x86-64-v{2,3,4}` ISA baseline marking
pub enum X86IsaLevel {
    #[default]
    Baseline,
    V2,
    V3,
    V4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One parsed entry of a version script or `--dynamic-list`. Parsing is the
/// driver's job; the core does the matching.
pub struct VersionPattern {
    /// Glob pattern (`*`, `?`, `[...]`)
    pub pattern: String,
    /// Match against the demangled name (`extern "C++"` blocks)
    pub is_cpp: bool,
    /// Version index this pattern assigns; `VER_NDX_LOCAL` hides the symbol
    pub ver_idx: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A `name = value;` assignment from a linker script
pub enum DefsymValue {
    Addr(u64),
    Alias(String),
}

/// Byte-to-byte transform injected by the driver for
/// `--compress-debug-sections`; the core builds only the container framing.
pub type CompressFn = fn(&[u8]) -> Vec<u8>;

#[derive(Debug, Clone, TypedBuilder)]
/// The flat option set consumed by the link pipeline
pub struct LinkOptions {
    #[builder(default, setter(into, strip_option))]
    /// Target machine; inferred from the first relocatable object if unset
    pub machine: Option<Machine>,
    #[builder(default, setter(into))]
    /// Output path, used only in diagnostics and the default soname
    pub output: String,
    #[builder(default)]
    /// `-shared`
    pub shared: bool,
    #[builder(default)]
    /// `-pie`
    pub pie: bool,
    #[builder(default, setter(into))]
    /// `-static`
    pub static_: bool,
    #[builder(default)]
    /// `-r`
    pub relocatable: bool,
    #[builder(default)]
    /// `--emit-relocs`
    pub emit_relocs: bool,
    #[builder(default, setter(into, strip_option))]
    /// `-e` / `--entry`
    pub entry: Option<String>,
    #[builder(default = "_init".into(), setter(into))]
    pub init: String,
    #[builder(default = "_fini".into(), setter(into))]
    pub fini: String,
    #[builder(default, setter(into, strip_option))]
    /// `--soname`
    pub soname: Option<String>,
    #[builder(default, setter(into))]
    /// `--rpath`, joined with `:` by the driver
    pub rpaths: String,
    #[builder(default, setter(into, strip_option))]
    /// `--dynamic-linker`
    pub dynamic_linker: Option<String>,
    #[builder(default)]
    /// `--gc-sections`
    pub gc_sections: bool,
    #[builder(default)]
    /// `--print-gc-sections`
    pub print_gc_sections: bool,
    #[builder(default)]
    /// `--icf`
    pub icf: IcfMode,
    #[builder(default)]
    /// `--print-icf-sections`
    pub print_icf_sections: bool,
    #[builder(default)]
    /// `--pack-dyn-relocs=relr` / `-z pack-relative-relocs`
    pub pack_dyn_relocs_relr: bool,
    #[builder(default)]
    /// `--hash-style`
    pub hash_style: HashStyle,
    #[builder(default)]
    /// `--wrap`
    pub wrap: Vec<String>,
    #[builder(default)]
    /// `--exclude-libs` (archive basenames, or `ALL`)
    pub exclude_libs: Vec<String>,
    #[builder(default)]
    /// Parsed `--version-script` patterns
    pub version_patterns: Vec<VersionPattern>,
    #[builder(default)]
    /// Version names defined by the version script, in index order
    pub version_definitions: Vec<String>,
    #[builder(default)]
    /// Parsed `--dynamic-list` patterns
    pub dynamic_list: Vec<VersionPattern>,
    #[builder(default)]
    /// `--export-dynamic`
    pub export_dynamic: bool,
    #[builder(default)]
    /// `--export-dynamic-symbol`
    pub export_dynamic_symbols: Vec<String>,
    #[builder(default)]
    /// `-Bsymbolic` / `-Bsymbolic-functions`
    pub bsymbolic: BsymbolicKind,
    #[builder(default)]
    /// `--no-undefined`
    pub no_undefined: bool,
    #[builder(default)]
    /// `--allow-multiple-definition`
    pub allow_multiple_definition: bool,
    #[builder(default)]
    /// `--unresolved-symbols`
    pub unresolved_symbols: UnresolvedPolicy,
    #[builder(default = true)]
    /// `--allow-shlib-undefined` (on by default, like every other linker)
    pub allow_shlib_undefined: bool,
    #[builder(default)]
    /// `--fatal-warnings`
    pub fatal_warnings: bool,
    #[builder(default)]
    /// Simple `A = B;` script assignments, applied before resolution
    pub defsyms: Vec<(String, DefsymValue)>,
    #[builder(default)]
    /// `--trace-symbol`
    pub trace_symbols: Vec<String>,
    #[builder(default)]
    /// `--build-id`
    pub build_id: BuildIdKind,
    #[builder(default, setter(into, strip_option))]
    /// `--package-metadata`
    pub package_metadata: Option<String>,
    #[builder(default)]
    /// `--compress-debug-sections`
    pub compress_debug_sections: CompressKind,
    #[builder(default, setter(strip_option))]
    /// The compressor for `--compress-debug-sections`, injected by the driver
    pub compress_fn: Option<CompressFn>,
    #[builder(default)]
    /// `--execute-only`
    pub execute_only: bool,
    #[builder(default = true)]
    /// `--rosegment` / `--no-rosegment`
    pub rosegment: bool,
    #[builder(default)]
    /// `--omagic`
    pub omagic: bool,
    #[builder(default, setter(strip_option))]
    /// `--image-base`
    pub image_base: Option<u64>,
    #[builder(default, setter(strip_option))]
    /// `--physical-image-base`
    pub physical_image_base: Option<u64>,
    #[builder(default)]
    /// `--spare-dynamic-tags`
    pub spare_dynamic_tags: u32,
    #[builder(default)]
    /// `--spare-program-headers`
    pub spare_program_headers: u32,
    #[builder(default)]
    /// Command line to append to `.comment`; drivers usually wire a debug
    /// environment toggle to this
    pub append_cmdline_to_comment: Option<String>,
    #[builder(default = true)]
    /// Enable link-time instruction relaxation (TLS model rewriting and
    /// GOT-indirection removal)
    pub relax: bool,
    #[builder(default = true)]
    /// Write the values of dynamic relocations to their target locations
    pub apply_dynamic_relocs: bool,
    #[builder(default = true)]
    /// Prefer `DT_RUNPATH` over the obsolete `DT_RPATH`
    pub enable_new_dtags: bool,

    // -z options
    #[builder(default)]
    pub z_now: bool,
    #[builder(default = true)]
    pub z_relro: bool,
    #[builder(default)]
    pub z_text: bool,
    #[builder(default = true)]
    pub z_copyreloc: bool,
    #[builder(default)]
    pub z_execstack: bool,
    #[builder(default = true)]
    pub z_dlopen: bool,
    #[builder(default = true)]
    pub z_delete: bool,
    #[builder(default = true)]
    pub z_dump: bool,
    #[builder(default)]
    pub z_initfirst: bool,
    #[builder(default)]
    pub z_interpose: bool,
    #[builder(default)]
    pub z_origin: bool,
    #[builder(default)]
    pub z_nodefaultlib: bool,
    #[builder(default)]
    pub z_stack_size: u64,
    #[builder(default)]
    pub z_rewrite_endbr: bool,
    #[builder(default)]
    pub z_ibt: bool,
    #[builder(default)]
    pub z_shstk: bool,
    #[builder(default)]
    pub z_isa_level: X86IsaLevel,
}

impl LinkOptions {
    /// True if the output is position-independent (a DSO or a PIE)
    pub fn pic(&self) -> bool {
        self.shared || self.pie
    }

    /// True if the output needs `.dynamic` and friends
    pub fn is_dynamic(&self) -> bool {
        !self.static_ || self.pie
    }

    /// Reject contradictory combinations before any pass runs
    pub fn validate(&self) -> Result<()> {
        if self.shared && self.pie {
            return Err(Error::user("-shared and -pie are mutually exclusive"));
        }
        if self.shared && self.static_ {
            return Err(Error::user("-shared and -static are mutually exclusive"));
        }
        if self.relocatable && self.shared {
            return Err(Error::user("-r and -shared are mutually exclusive"));
        }
        if self.execute_only && self.omagic {
            return Err(Error::user(
                "--execute-only is incompatible with --omagic (writable text)",
            ));
        }
        if self.compress_debug_sections != CompressKind::None && self.compress_fn.is_none() {
            return Err(Error::user(
                "--compress-debug-sections requires a compressor callback",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_are_a_plain_executable() {
        let opts = LinkOptions::builder().build();
        assert!(!opts.pic());
        assert!(opts.is_dynamic());
        assert!(opts.z_relro);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_shared_pie_conflict() {
        let opts = LinkOptions::builder().shared(true).pie(true).build();
        assert!(matches!(opts.validate(), Err(Error::UserError(_))));
    }

    #[test]
    fn test_compression_needs_callback() {
        let opts = LinkOptions::builder()
            .compress_debug_sections(CompressKind::Zlib)
            .build();
        assert!(opts.validate().is_err());
    }
}
