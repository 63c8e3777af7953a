use thiserror::Error;

/// Errors produced by format decoders.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Underlying I/O failure. These are considered transient and may be
    /// retried by the cache according to `failure_retries`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file exists but is not a recognized or well-formed image.
    #[error("unrecognized or corrupt image data: {0}")]
    Corrupt(String),

    /// The file uses a feature the decoder does not support.
    #[error("unsupported image feature: {0}")]
    Unsupported(String),
}

/// Errors surfaced by the image cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The named file could not be located on disk or via the search path.
    #[error("file \"{0}\" not found")]
    FileNotFound(String),

    /// The file was found but could not be opened as an image.
    #[error("could not open \"{name}\": {reason}")]
    Unreadable { name: String, reason: String },

    /// Subimage index out of range for the file.
    #[error("\"{name}\" has no subimage {subimage}")]
    BadSubimage { name: String, subimage: u32 },

    /// MIP level out of range for the subimage.
    #[error("\"{name}\" subimage {subimage} has no miplevel {miplevel}")]
    BadMipLevel {
        name: String,
        subimage: u32,
        miplevel: u32,
    },

    /// Requested region is degenerate or entirely outside the image.
    #[error("invalid region of interest: {0}")]
    BadRoi(String),

    /// Destination buffer geometry does not match the request.
    #[error("type or layout mismatch: {0}")]
    TypeMismatch(String),

    /// Unknown attribute name, or a value of the wrong type.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// A read failed in a way that may succeed if retried.
    #[error("transient I/O failure reading \"{name}\": {reason}")]
    TransientIo { name: String, reason: String },

    /// A tile's pixel allocation failed or exceeded sane limits.
    #[error("cannot allocate {bytes} bytes for a tile of \"{name}\"")]
    TileAlloc { name: String, bytes: usize },

    /// The filename is a UDIM pattern; individual atlas tiles must be
    /// resolved before pixels can be read.
    #[error("\"{0}\" is a UDIM pattern and cannot be read directly")]
    UdimPattern(String),

    /// Scanline (untiled) file rejected because `accept_untiled` is off.
    #[error("\"{0}\" is untiled and accept_untiled is disabled")]
    Untiled(String),

    /// Un-mipmapped file rejected because `accept_unmipped` is off.
    #[error("\"{0}\" is un-mipmapped and accept_unmipped is disabled")]
    Unmipped(String),
}

impl CacheError {
    /// Whether the error may succeed on retry after closing and reopening
    /// the file.
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::TransientIo { .. })
    }
}
