use ninmu_core::{JobId, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categorization of failures returned by the PostgreSQL backend.
pub enum ErrorKind {
    /// Errors originating from database interactions.
    DataBase,
    /// A stored row or payload could not be decoded.
    Decode,
    /// A payload or parameter could not be encoded.
    Encode,
    /// No job with the given id for this kind.
    NotFound,
    /// The job's state does not allow the operation.
    InvalidState,
    /// The worker lost its lease (token mismatch or 0 rows affected).
    LostLease,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + 'static>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, error: Box<dyn std::error::Error + Send + 'static>) -> Self {
        Self { kind, inner: error }
    }

    pub(crate) fn new_database(error: Box<dyn std::error::Error + Send + 'static>) -> Self {
        Self::new(ErrorKind::DataBase, error)
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Decode, Box::new(Message(message.into())))
    }

    pub(crate) fn not_found(id: JobId) -> Self {
        Self::new(ErrorKind::NotFound, Box::new(Message(format!("job {id} not found"))))
    }

    pub(crate) fn invalid_state(id: JobId, state: JobState) -> Self {
        Self::new(
            ErrorKind::InvalidState,
            Box::new(Message(format!("job {id} is already {state}"))),
        )
    }

    pub(crate) fn lost_lease(id: JobId) -> Self {
        Self::new(
            ErrorKind::LostLease,
            Box::new(Message(format!("lost lease for job {id}"))),
        )
    }

    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self::new_database(Box::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        let kind = if value.is_data() || value.is_syntax() || value.is_eof() {
            ErrorKind::Decode
        } else {
            ErrorKind::Encode
        };
        Self::new(kind, Box::new(value))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug)]
struct Message(String);

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}
