use std::fmt;

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// List of specific errors that may occur when using this library.
///
/// Every kind corresponds to one of the signed status codes used by the PX14400 driver and its
/// companion tools. Use [`ErrorKind::code`] to obtain it, or [`status_code`] to turn any
/// operation's result into the integer form.
///
/// [`ErrorKind::code`]: #method.code
/// [`status_code`]: fn.status_code.html
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An unspecified error occurred.
    ///
    /// This is also the kind of errors reported by the operating system while talking to the
    /// kernel driver (eg. a failing `ioctl` or `mmap` call).
    Generic,

    /// An argument was out of its valid range.
    InvalidArg,

    /// An index was out of bounds (eg. a boot buffer index of 4 or above).
    OutOfBounds,

    /// Host memory for a bookkeeping structure could not be obtained.
    OutOfMemory,

    /// The driver could not allocate a DMA buffer of the requested size.
    ///
    /// Requesting a smaller buffer may succeed. The chain builder relies on this kind to drive
    /// its size-halving retry policy.
    DmaBufAllocFail,

    /// The device handle is not valid.
    InvalidHandle,

    /// The device (or a buffer) is busy, typically because a DMA transfer is in progress.
    Busy,

    /// A firmware manifest or provider file is not well-formed XML.
    XmlMalformed,

    /// An XML document is well-formed but has the wrong root element.
    XmlInvalid,

    /// An XML document was missing a required element.
    XmlGeneric,

    /// The operation is only available on a locally attached device.
    RemoteCallNotAvailable,

    /// The firmware file type could not be determined from its name.
    UnknownFwFile,

    /// Playing a firmware bitstream over JTAG failed.
    FirmwareUploadFailed,

    /// The firmware package is not a valid PX14400 firmware package.
    InvalidFwFile,

    /// A destination file could not be created.
    DestFileOpenFailed,

    /// A source file could not be opened.
    SourceFileOpenFailed,

    /// A file operation (including archive extraction) failed.
    FileIo,

    /// The firmware is not compatible with this device.
    ///
    /// The error message (also available through [`DeviceSession::error_extra`]) names the
    /// requirement that was not met.
    ///
    /// [`DeviceSession::error_extra`]: ../struct.DeviceSession.html#method.error_extra
    IncompatibleFirmware,

    /// The driver did not recognize the size of a request structure.
    UnknownStructSize,

    /// The firmware requirements of the device could not be determined.
    CannotDetermineFwReq,

    /// The package contains no firmware applicable to this device.
    RequiredFwNotFound,

    /// The operation is not implemented for virtual devices.
    NoVirtualImplementation,

    /// Communication over the JTAG interface failed, or the interface is owned by someone else.
    JtagIo,

    /// The requested operating mode change is not allowed in the current state.
    InvalidModeChange,

    /// The discovered JTAG chain does not match any known board configuration.
    UnknownJtagChain,

    /// A required pointer argument was null.
    NullPointer,

    /// A system resource could not be allocated.
    ResourceAllocFailure,

    /// A boot buffer is already checked out by another handle.
    BufferCheckedOut,

    /// No boot buffer was allocated by the driver for the given index.
    BufferNotAllocated,
}

macro_rules! status_codes {
    (
        $(
            $kind:ident = $code:literal,
        )+
    ) => {
        impl ErrorKind {
            /// Returns the signed status code associated with this error kind.
            ///
            /// All codes are negative. 0 is reserved for success.
            pub fn code(self) -> i32 {
                match self {
                    $( ErrorKind::$kind => $code, )+
                }
            }

            /// Looks up the error kind for a status code reported by the driver.
            ///
            /// Returns `None` for 0 (success) and for unknown codes.
            pub fn from_code(code: i32) -> Option<Self> {
                match code {
                    $( $code => Some(ErrorKind::$kind), )+
                    _ => None,
                }
            }
        }
    };
}

status_codes! {
    Generic = -1,
    InvalidArg = -2,
    OutOfBounds = -3,
    OutOfMemory = -5,
    DmaBufAllocFail = -6,
    InvalidHandle = -513,
    Busy = -527,
    XmlMalformed = -529,
    XmlInvalid = -530,
    XmlGeneric = -531,
    RemoteCallNotAvailable = -548,
    UnknownFwFile = -549,
    FirmwareUploadFailed = -550,
    InvalidFwFile = -551,
    DestFileOpenFailed = -552,
    SourceFileOpenFailed = -553,
    FileIo = -554,
    IncompatibleFirmware = -555,
    UnknownStructSize = -556,
    CannotDetermineFwReq = -574,
    RequiredFwNotFound = -575,
    NoVirtualImplementation = -577,
    JtagIo = -579,
    InvalidModeChange = -583,
    UnknownJtagChain = -587,
    NullPointer = -591,
    ResourceAllocFailure = -594,
    BufferCheckedOut = -596,
    BufferNotAllocated = -597,
}

pub(crate) trait Cause {
    const KIND: ErrorKind;
}

/// The error type used by this library.
///
/// Errors can be introspected by the user by calling [`Error::kind`] and inspecting the returned
/// [`ErrorKind`].
///
/// [`Error::kind`]: #method.kind
/// [`ErrorKind`]: enum.ErrorKind.html
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: BoxedError,
    while_: Option<&'static str>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, inner: impl Into<BoxedError>) -> Self {
        Self {
            kind,
            inner: inner.into(),
            while_: None,
        }
    }

    pub(crate) fn with_while(
        kind: ErrorKind,
        inner: impl Into<BoxedError>,
        while_: &'static str,
    ) -> Self {
        Self {
            kind,
            inner: inner.into(),
            while_: Some(while_),
        }
    }

    /// Creates an error from a status code returned by the driver.
    ///
    /// Unknown codes are reported as [`ErrorKind::Generic`].
    ///
    /// [`ErrorKind::Generic`]: enum.ErrorKind.html#variant.Generic
    pub(crate) fn from_status(code: i32, what: &'static str) -> Self {
        let kind = ErrorKind::from_code(code).unwrap_or(ErrorKind::Generic);
        Self::with_while(kind, format!("driver returned status {}", code), what)
    }

    /// Returns the [`ErrorKind`] describing this error.
    ///
    /// [`ErrorKind`]: enum.ErrorKind.html
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the signed status code of this error.
    pub fn code(&self) -> i32 {
        self.kind.code()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(while_) = self.while_ {
            write!(f, "error while {}: ", while_)?;
        }

        // Prefix foreign errors with further explanation where they're coming from
        match self.kind {
            ErrorKind::FileIo => write!(f, "file I/O error: {}", self.inner),
            ErrorKind::XmlMalformed => write!(f, "malformed XML: {}", self.inner),
            ErrorKind::FirmwareUploadFailed => {
                write!(f, "firmware upload failed: {}", self.inner)
            }
            _ => self.inner.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

/// Converts the outcome of any operation into the signed integer status code.
///
/// Success maps to 0, failures to the (negative) code of their [`ErrorKind`].
///
/// [`ErrorKind`]: enum.ErrorKind.html
pub fn status_code<T>(res: &Result<T, Error>) -> i32 {
    match res {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

pub(crate) trait ResultExt<T, E> {
    fn px14_err(self) -> Result<T, Error>
    where
        E: Cause + Into<BoxedError>;

    fn px14_err_while(self, while_: &'static str) -> Result<T, Error>
    where
        E: Cause + Into<BoxedError>;
}

impl<T, E> ResultExt<T, E> for Result<T, E> {
    fn px14_err(self) -> Result<T, Error>
    where
        E: Cause + Into<BoxedError>,
    {
        self.map_err(|e| Error::new(E::KIND, e))
    }

    fn px14_err_while(self, while_: &'static str) -> Result<T, Error>
    where
        E: Cause + Into<BoxedError>,
    {
        self.map_err(|e| Error::with_while(E::KIND, e, while_))
    }
}

macro_rules! error_mapping {
    (
        $(
            $errty:ty => $kind:ident,
        )+
    ) => {
        $(
            impl Cause for $errty {
                const KIND: ErrorKind = ErrorKind::$kind;
            }
        )+
    };
}

error_mapping! {
    std::io::Error => FileIo,
    zip::result::ZipError => FileIo,
    roxmltree::Error => XmlMalformed,
    crate::xsvf::XsvfError => FirmwareUploadFailed,
    String => Generic,
}

#[cfg(target_os = "linux")]
error_mapping! {
    nix::Error => Generic,
}
