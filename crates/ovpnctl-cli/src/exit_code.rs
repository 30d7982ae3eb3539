//! Process exit codes for supervisor failures

use ovpnctl_core::{ConnectError, DisconnectError, PrivilegeError, ValidationError};

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const INVALID_INPUT: i32 = 2;
pub const ALREADY_CONNECTED: i32 = 3;
pub const TIMED_OUT: i32 = 4;
pub const CANCELLED: i32 = 5;
pub const NOT_CONNECTED: i32 = 6;
pub const ABNORMAL_EXIT: i32 = 7;
pub const INTERNAL: i32 = 70;

/// Exit code for the first typed supervisor error in `err`'s chain
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<ConnectError>() {
            return connect(e);
        }
        if let Some(e) = cause.downcast_ref::<DisconnectError>() {
            return disconnect(e);
        }
        if cause.downcast_ref::<ValidationError>().is_some() {
            return INVALID_INPUT;
        }
        if let Some(e) = cause.downcast_ref::<PrivilegeError>() {
            return privilege(e);
        }
    }
    FAILURE
}

fn connect(err: &ConnectError) -> i32 {
    match err {
        ConnectError::AlreadyConnected { .. } | ConnectError::AttemptInProgress => {
            ALREADY_CONNECTED
        }
        ConnectError::Privilege(e) => privilege(e),
        ConnectError::Timeout { .. } => TIMED_OUT,
        ConnectError::Cancelled => CANCELLED,
        ConnectError::Internal(_) => INTERNAL,
        ConnectError::Registry(_) | ConnectError::Readiness(_) | ConnectError::Launch(_) => {
            FAILURE
        }
    }
}

fn disconnect(err: &DisconnectError) -> i32 {
    match err {
        DisconnectError::NoActiveConnection | DisconnectError::ProcessAlreadyExited { .. } => {
            NOT_CONNECTED
        }
        DisconnectError::DidNotExit { .. } | DisconnectError::AbnormalTermination { .. } => {
            ABNORMAL_EXIT
        }
        DisconnectError::Privilege(e) => privilege(e),
        DisconnectError::Registry(_) | DisconnectError::Signal(_) => FAILURE,
    }
}

fn privilege(err: &PrivilegeError) -> i32 {
    match err {
        PrivilegeError::MissingCredential { .. } => INVALID_INPUT,
        PrivilegeError::Probe(_) => FAILURE,
    }
}
