use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Socket operation failed: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to encode or decode wire JSON: {0}")]
    WireError(#[from] serde_json::Error),

    #[error("Datastore operation failed: {0}")]
    DatastoreError(#[from] rusqlite::Error),

    #[error("Failed to write metrics CSV: {0}")]
    CsvError(#[from] csv::Error),

    /// Not enough FREE classrooms to cover the plan. The message doubles
    /// as the user-facing DENIED reason.
    #[error("No hay suficientes aulas libres")]
    ShortageClass,

    /// Not enough spare classrooms left to adapt as mobile labs.
    #[error("No hay recursos para adaptar laboratorios")]
    ShortageLab,

    #[error("Broker backend has no route to client {0}")]
    ClientGone(u64),
}

impl Error {
    /// True for the allocation shortages that map to a DENIED resolution.
    pub fn is_shortage(&self) -> bool {
        matches!(self, Error::ShortageClass | Error::ShortageLab)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
