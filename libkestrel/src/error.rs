pub(crate) use anyhow::Context;
pub(crate) use anyhow::Error;
use std::fmt::Display;
use std::path::PathBuf;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Prints the supplied error to stderr, then exits with a failure status. All diagnosed link
/// failures funnel through here so that we exit with status 1 exactly as other linkers do.
pub fn report_error_and_exit(error: &Error) -> ! {
    eprintln!("kestrel: error: {error:#}");
    std::process::exit(1);
}

/// The user-diagnosable failure categories. Internal failures (I/O, allocation) are reported as
/// plain `anyhow` errors with context; these kinds exist so that diagnostics carry a stable,
/// recognisable leading phrase.
#[derive(Debug)]
pub(crate) enum LinkError {
    UnknownFileType(PathBuf),
    LibraryNotFound(String),
    DuplicateSymbol {
        name: String,
        file_a: String,
        file_b: String,
    },
    UndefinedSymbol {
        name: String,
        referenced_by: String,
    },
    UnknownRelocation {
        r_type: u32,
        place: String,
    },
    BadArchive {
        path: PathBuf,
        reason: String,
    },
    MalformedElf {
        path: PathBuf,
        reason: String,
    },
    MissingOption(&'static str),
}

impl Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::UnknownFileType(path) => {
                write!(f, "{}: unknown file type", path.display())
            }
            LinkError::LibraryNotFound(name) => write!(f, "library not found: {name}"),
            LinkError::DuplicateSymbol {
                name,
                file_a,
                file_b,
            } => {
                write!(f, "duplicate symbol: {file_a}: {file_b}: {name}")
            }
            LinkError::UndefinedSymbol {
                name,
                referenced_by,
            } => {
                write!(f, "undefined symbol: {referenced_by}: {name}")
            }
            LinkError::UnknownRelocation { r_type, place } => {
                write!(
                    f,
                    "{place}: unknown relocation: {}",
                    crate::x86_64::rel_type_to_string(*r_type)
                )
            }
            LinkError::BadArchive { path, reason } => {
                write!(f, "{}: bad archive: {reason}", path.display())
            }
            LinkError::MalformedElf { path, reason } => {
                write!(f, "{}: malformed ELF: {reason}", path.display())
            }
            LinkError::MissingOption(name) => write!(f, "{name} option is missing"),
        }
    }
}

impl core::error::Error for LinkError {}
