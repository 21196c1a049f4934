/// Outcome reported by a handler for a single event.
///
/// The retry path only acts on [`ProcessStatus::RetryRequested`]; the value is
/// always handed back to the caller unchanged so acknowledgement behaviour is
/// driven by what the handler said, not by whether a retry publish succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessStatus {
    Completed,
    RetryRequested,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::RetryRequested => "retry_requested",
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
