use std::{fmt, io};

use crate::Pid;

/// Reasons a leak-check run ends without a report.
#[derive(Debug)]
pub enum CheckError {
    /// No heap is registered under the requested binary name.
    HeapNotFound(String),
    /// The heap exists but no binary with that name is loaded.
    BinaryNotFound(String),
    /// The scheduler does not know the calling task.
    UnknownTask(Pid),
    /// More allocated nodes than the index can track.
    CapacityExceeded { capacity: usize, required: usize },
    /// Another run is in progress on the same detector.
    AlreadyRunning,
    /// The tracking index could not be allocated from the kernel heap.
    AllocationFailed,
    InvalidSettings(&'static str),
    /// Writing the report to the output sink failed.
    Output(io::Error),
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeapNotFound(name) => write!(f, "no heap found for '{name}'"),
            Self::BinaryNotFound(name) => {
                write!(f, "no loaded binary named '{name}'")
            }
            Self::UnknownTask(pid) => write!(f, "no task with pid {pid}"),
            Self::CapacityExceeded { capacity, required } => write!(
                f,
                "too many allocated nodes: capacity is {capacity}, need at least {required}"
            ),
            Self::AlreadyRunning => write!(f, "a leak check is already running"),
            Self::AllocationFailed => {
                write!(f, "failed to allocate the tracking index")
            }
            Self::InvalidSettings(reason) => {
                write!(f, "invalid checker settings: {reason}")
            }
            Self::Output(err) => write!(f, "failed to write report: {err}"),
        }
    }
}

impl std::error::Error for CheckError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Output(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CheckError {
    fn from(err: io::Error) -> Self {
        Self::Output(err)
    }
}
