//! Cache configuration.
//!
//! [`CacheOptions`] is the plain struct behind the attribute bus: the
//! attribute setter validates and writes through to these fields, and hot
//! paths read them directly without touching the string-keyed table.

// =============================================================================
// Default Values
// =============================================================================

/// Default cap on concurrently open decoders.
pub const DEFAULT_MAX_OPEN_FILES: i32 = 100;

/// Default tile memory budget in MB.
pub const DEFAULT_MAX_MEMORY_MB: f32 = 1024.0;

/// Default per-file error cap before errors are dropped silently.
pub const DEFAULT_MAX_ERRORS_PER_FILE: i32 = 100;

// =============================================================================
// CacheOptions
// =============================================================================

/// All settable cache options with their defaults.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Maximum number of concurrently open files.
    pub max_open_files: i32,

    /// Drive open-file overage to zero before returning from a read,
    /// instead of best-effort trimming.
    pub max_open_files_strict: bool,

    /// Tile memory budget in MB. A soft ceiling: insertion may transiently
    /// exceed it by one tile.
    pub max_memory_mb: f32,

    /// Colon- or semicolon-separated directories for resolving relative
    /// filenames.
    pub searchpath: String,

    /// Search path for format plugins (recorded; the built-in decoders are
    /// compiled in).
    pub plugin_searchpath: String,

    /// If nonzero, impose a virtual tile grid of exactly this size on
    /// scanline images.
    pub autotile: i32,

    /// With autotile, make virtual tiles full-width scanline bands rather
    /// than squares.
    pub autoscanline: bool,

    /// Synthesize missing MIP levels on demand by box-downsampling.
    pub automip: bool,

    /// Accept scanline (untiled) images. When off, such files are errors
    /// regardless of autotile.
    pub accept_untiled: bool,

    /// Accept images with no MIP chain. When off, un-mipmapped files are
    /// errors.
    pub accept_unmipped: bool,

    /// Cache all tiles as float regardless of the native format.
    pub forcefloat: bool,

    /// Times to close/reopen and retry a failed read before giving up.
    pub failure_retries: i32,

    /// Collapse files with identical content fingerprints into one record.
    pub deduplicate: bool,

    /// If set, every filename resolves to this image instead.
    pub substitute_image: String,

    /// Pass unassociated-alpha data through without premultiplying.
    pub unassociatedalpha: bool,

    /// Per-file cap on reported errors; beyond it, errors are counted but
    /// not queued.
    pub max_errors_per_file: i32,

    /// Choose decoders by file extension rather than content sniffing.
    pub trust_file_extensions: bool,

    /// Working color space. Changing it invalidates everything.
    pub colorspace: String,

    /// Color configuration file.
    pub colorconfig: String,

    /// Verbosity of `getstats`.
    pub statistics_level: i32,
}

impl Default for CacheOptions {
    fn default() -> CacheOptions {
        CacheOptions {
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            max_open_files_strict: false,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            searchpath: String::new(),
            plugin_searchpath: String::new(),
            autotile: 0,
            autoscanline: false,
            automip: false,
            accept_untiled: true,
            accept_unmipped: true,
            forcefloat: false,
            failure_retries: 0,
            deduplicate: true,
            substitute_image: String::new(),
            unassociatedalpha: false,
            max_errors_per_file: DEFAULT_MAX_ERRORS_PER_FILE,
            trust_file_extensions: false,
            colorspace: String::new(),
            colorconfig: String::new(),
            statistics_level: 0,
        }
    }
}

impl CacheOptions {
    /// Tile memory budget in bytes.
    pub fn max_memory_bytes(&self) -> u64 {
        let mb = self.max_memory_mb.max(0.0) as f64;
        (mb * 1024.0 * 1024.0) as u64
    }

    /// The autotile size in use: the configured value as requested, zero
    /// when autotiling is off.
    pub fn effective_autotile(&self) -> u32 {
        self.autotile.max(0) as u32
    }

    /// Clamp nonsensical values into working ranges.
    pub fn sanitize(&mut self) {
        self.max_open_files = self.max_open_files.max(1);
        self.max_memory_mb = self.max_memory_mb.max(0.0);
        self.failure_retries = self.failure_retries.max(0);
        self.max_errors_per_file = self.max_errors_per_file.max(0);
        self.autotile = self.autotile.max(0);
    }

    /// Split the search path into directories.
    pub fn search_dirs(&self) -> Vec<std::path::PathBuf> {
        self.searchpath
            .split([':', ';'])
            .filter(|s| !s.is_empty())
            .map(std::path::PathBuf::from)
            .collect()
    }
}
