use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Payload is not valid JSON"))]
    Decode {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Payload must be a JSON object, found {found}"))]
    NotAnObject { found: &'static str },

    #[snafu(display("Invalid task: {message}"))]
    Validation { message: String },

    #[snafu(display("Error returned from store"))]
    Store {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Error returned from broker"))]
    Protocol {
        #[snafu(source)]
        source: lapin::Error,
    },

    #[snafu(display("Consumer stream closed by broker"))]
    ConsumerClosed,

    #[snafu(display("Internal error"))]
    Internal {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Store { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<lapin::Error> for Error {
    fn from(source: lapin::Error) -> Self {
        Self::Protocol { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Decode { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Internal { source: Some(e) }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Errors caused by the payload itself. Redelivering the same bytes can
    /// never succeed, so these are dead-lettered on the first attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. } | Self::NotAnObject { .. } | Self::Validation { .. }
        )
    }

    /// Broker-level failures end the consumer loop instead of a single message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::ConsumerClosed)
    }
}
