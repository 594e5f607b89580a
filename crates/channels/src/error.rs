/// Result type for channel contract helpers.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors a plugin reports back through the channel contract.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No account with this ID was started.
    #[error("unknown channel account: {account_id}")]
    UnknownAccount { account_id: String },

    /// The account exists but its connection is not running.
    #[error("channel account not running: {account_id}")]
    NotRunning { account_id: String },

    /// The plugin was started without the host runtime it needs.
    #[error("channel host not attached")]
    HostMissing,
}

impl Error {
    #[must_use]
    pub fn unknown_account(account_id: impl std::fmt::Display) -> Self {
        Self::UnknownAccount {
            account_id: account_id.to_string(),
        }
    }

    #[must_use]
    pub fn not_running(account_id: impl std::fmt::Display) -> Self {
        Self::NotRunning {
            account_id: account_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_name_the_account() {
        assert_eq!(
            Error::unknown_account("ops").to_string(),
            "unknown channel account: ops"
        );
        assert!(matches!(
            Error::not_running("ops"),
            Error::NotRunning { account_id } if account_id == "ops"
        ));
    }
}
