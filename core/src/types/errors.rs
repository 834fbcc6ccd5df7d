use std::fmt;

/// Unified error for every operation the engine exposes. Each variant keeps
/// an `origin` tag (the function or phase that produced it) so log lines can
/// be traced back without a backtrace; `Display` renders the user-facing
/// description only.
#[derive(Debug)]
pub enum GinError {
    /// The caller violated a precondition; the operation never started.
    Usage {
        origin: &'static str,
        message: String,
    },
    /// The server or transport refused us (HTTP non-2xx, SSH refusal).
    Remote {
        origin: &'static str,
        message: String,
    },
    /// A push was rejected because the server holds newer history.
    Rejected {
        origin: &'static str,
        hint: String,
    },
    /// A child output line could not be understood.
    Parse {
        origin: &'static str,
        line: String,
    },
    /// A child process exited non-zero without a better diagnostic.
    Child {
        origin: &'static str,
        exit_code: Option<i32>,
        stderr: String,
    },
    Internal(anyhow::Error),
}

impl GinError {
    pub fn usage(origin: &'static str, message: impl Into<String>) -> Self {
        GinError::Usage {
            origin,
            message: message.into(),
        }
    }

    pub fn remote(origin: &'static str, message: impl Into<String>) -> Self {
        GinError::Remote {
            origin,
            message: message.into(),
        }
    }

    pub fn rejected(origin: &'static str, hint: impl Into<String>) -> Self {
        GinError::Rejected {
            origin,
            hint: hint.into(),
        }
    }

    pub fn parse(origin: &'static str, line: impl Into<String>) -> Self {
        GinError::Parse {
            origin,
            line: line.into(),
        }
    }

    pub fn child(origin: &'static str, exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        GinError::Child {
            origin,
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Process exit code for this error: misuse is 2, everything else 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            GinError::Usage { .. } => 2,
            _ => 1,
        }
    }

    pub fn origin(&self) -> &str {
        match self {
            GinError::Usage { origin, .. }
            | GinError::Remote { origin, .. }
            | GinError::Rejected { origin, .. }
            | GinError::Parse { origin, .. }
            | GinError::Child { origin, .. } => origin,
            GinError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for GinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GinError::Usage { message, .. } => write!(f, "{}", message),
            GinError::Remote { message, .. } => write!(f, "{}", message),
            GinError::Rejected { hint, .. } => write!(f, "{}", hint),
            GinError::Parse { line, .. } => write!(f, "could not parse output line: {}", line),
            GinError::Child {
                exit_code, stderr, ..
            } => match exit_code {
                Some(code) => write!(f, "command failed (exit {}): {}", code, stderr.trim()),
                None => write!(f, "command terminated: {}", stderr.trim()),
            },
            GinError::Internal(e) => write!(f, "{}", e),
        }
    }
}

impl<E> From<E> for GinError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self::Internal(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_hides_origin() {
        let err = GinError::usage("login", "you are not logged in");
        assert_eq!(err.to_string(), "you are not logged in");
        assert_eq!(err.origin(), "login");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: GinError = io.into();
        assert!(matches!(err, GinError::Internal(_)));
    }

    #[test]
    fn usage_errors_exit_with_2() {
        assert_eq!(GinError::usage("ls", "not a repository").exit_code(), 2);
        assert_eq!(GinError::remote("login", "authorisation failed").exit_code(), 1);
        assert_eq!(GinError::rejected("push", "rejected").exit_code(), 1);
    }

    #[test]
    fn child_error_trims_stderr() {
        let err = GinError::child("git clone", Some(128), "fatal: repository not found\n");
        assert_eq!(
            err.to_string(),
            "command failed (exit 128): fatal: repository not found"
        );
    }
}
