#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Error type for errors during linking
pub enum Error {
    #[error("{file}: malformed input at offset {offset:#x}: {message}")]
    MalformedInput {
        file: String,
        offset: u64,
        message: String,
    },
    #[error("{file}: unsupported feature: {message}")]
    UnsupportedFeature { file: String, message: String },
    #[error("unsupported machine type: {machine}")]
    UnsupportedMachine { machine: String },
    #[error("duplicate symbol: {name}: defined in both {file1} and {file2}")]
    DuplicateDefinition {
        name: String,
        file1: String,
        file2: String,
    },
    #[error("undefined symbol: {name}, referenced by {referer}")]
    UndefinedSymbol { name: String, referer: String },
    #[error("{file}: incompatible symbol kinds for {name}: {message}")]
    IncompatibleSymbol {
        file: String,
        name: String,
        message: String,
    },
    #[error(
        "{file}:({section}+{offset:#x}): relocation {rel_type} against {symbol} \
         out of range: {value} is not in [{lo}, {hi})"
    )]
    RelocationOutOfRange {
        file: String,
        section: String,
        offset: u64,
        rel_type: String,
        symbol: String,
        value: i64,
        lo: i64,
        hi: i64,
    },
    #[error("{file}:({section}): unknown relocation type {rel_type}")]
    UnknownRelocation {
        file: String,
        section: String,
        rel_type: u32,
    },
    #[error("{file}:({section}+{offset:#x}): {message}")]
    BadRelocation {
        file: String,
        section: String,
        offset: u64,
        message: String,
    },
    #[error("{0}")]
    UserError(String),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn malformed(
        file: impl Into<String>,
        offset: u64,
        message: impl Into<String>,
    ) -> Self {
        Error::MalformedInput {
            file: file.into(),
            offset,
            message: message.into(),
        }
    }

    pub(crate) fn unsupported(file: impl Into<String>, message: impl Into<String>) -> Self {
        Error::UnsupportedFeature {
            file: file.into(),
            message: message.into(),
        }
    }

    pub(crate) fn user(message: impl Into<String>) -> Self {
        Error::UserError(message.into())
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Accumulator for diagnostics raised inside a pass. Fatal errors are
/// batched so that, for example, every unresolved symbol in a link is
/// reported in a single run rather than one per invocation. A checkpoint at
/// the end of each stage stops the pipeline if anything fatal accumulated.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<Error>,
    num_warnings: usize,
    fatal_warnings: bool,
}

impl Diagnostics {
    pub fn new(fatal_warnings: bool) -> Self {
        Diagnostics {
            errors: Vec::new(),
            num_warnings: 0,
            fatal_warnings,
        }
    }

    pub fn error(&mut self, err: Error) {
        log::error!("{err}");
        self.errors.push(err);
    }

    pub fn warn(&mut self, err: Error) {
        if self.fatal_warnings {
            self.error(err);
        } else {
            log::warn!("{err}");
            self.num_warnings += 1;
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Stage barrier. Returns the first accumulated fatal error, after all
    /// of them have been reported.
    pub fn checkpoint(&mut self) -> Result<()> {
        match self.errors.first() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_checkpoint_passes_when_clean() {
        let mut diags = Diagnostics::new(false);
        diags.warn(Error::user("just a warning"));
        assert!(diags.checkpoint().is_ok());
    }

    #[test]
    fn test_checkpoint_reports_first_error() {
        let mut diags = Diagnostics::new(false);
        diags.error(Error::UndefinedSymbol {
            name: "foo".into(),
            referer: "a.o".into(),
        });
        diags.error(Error::UndefinedSymbol {
            name: "bar".into(),
            referer: "b.o".into(),
        });
        let err = diags.checkpoint().unwrap_err();
        assert!(matches!(err, Error::UndefinedSymbol { name, .. } if name == "foo"));
    }

    #[test]
    fn test_fatal_warnings_escalate() {
        let mut diags = Diagnostics::new(true);
        diags.warn(Error::user("escalated"));
        assert!(diags.checkpoint().is_err());
    }
}
