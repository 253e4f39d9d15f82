//! Two-phase commit vocabulary
//!
//! Transaction branch identifiers, start/end flags, prepare votes and the
//! XA error codes exchanged between a resource manager and the transaction
//! manager driving it.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Maximum length of the global transaction id and branch qualifier
pub const MAX_XID_PART: usize = 64;

/// Global transaction branch identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    format_id: i32,
    global_id: Vec<u8>,
    branch: Vec<u8>,
}

impl Xid {
    /// Build an xid from its parts
    ///
    /// Returns `XAER_INVAL` if either part exceeds [`MAX_XID_PART`] bytes.
    pub fn new(format_id: i32, global_id: &[u8], branch: &[u8]) -> Result<Self, XaError> {
        if global_id.len() > MAX_XID_PART || branch.len() > MAX_XID_PART {
            return Err(XaError::new(XaCode::Inval, "xid part exceeds 64 bytes"));
        }
        Ok(Xid {
            format_id,
            global_id: global_id.to_vec(),
            branch: branch.to_vec(),
        })
    }

    /// Generate a fresh xid with a random global id and empty branch
    pub fn generate(format_id: i32) -> Self {
        Xid {
            format_id,
            global_id: Uuid::new_v4().as_bytes().to_vec(),
            branch: Vec::new(),
        }
    }

    /// Derive a branch of this global transaction
    pub fn with_branch(&self, branch: &[u8]) -> Self {
        let mut branch = branch.to_vec();
        branch.truncate(MAX_XID_PART);
        Xid {
            format_id: self.format_id,
            global_id: self.global_id.clone(),
            branch,
        }
    }

    /// Format identifier
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Global transaction id bytes
    pub fn global_id(&self) -> &[u8] {
        &self.global_id
    }

    /// Branch qualifier bytes
    pub fn branch(&self) -> &[u8] {
        &self.branch
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid({}:", self.format_id)?;
        for b in &self.global_id {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ":")?;
        for b in &self.branch {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Flags accepted by `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFlag {
    /// Start a new transaction branch
    NoFlags,
    /// Join an existing branch
    Join,
    /// Resume a suspended branch
    Resume,
}

/// Flags accepted by `end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndFlag {
    /// Work completed successfully
    Success,
    /// Work failed, the branch must be rolled back
    Fail,
    /// Work suspended, to be resumed later
    Suspend,
}

/// Outcome of a successful `prepare`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Ready to commit
    Ok,
    /// Nothing to commit, the branch is already complete
    ReadOnly,
}

/// XA error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaCode {
    /// Rolled back for an unspecified reason
    RbRollback,
    /// Rolled back because of a deadlock
    RbDeadlock,
    /// Rolled back because of a protocol error in the resource manager
    RbProto,
    /// Rolled back because the branch took too long
    RbTimeout,
    /// Rolled back because of an integrity violation
    RbIntegrity,
    /// Rolled back for another reason
    RbOther,
    /// Branch was heuristically rolled back
    HeurRb,
    /// Branch was heuristically committed
    HeurCom,
    /// Branch was partly committed and partly rolled back
    HeurMix,
    /// Branch may have been heuristically completed
    HeurHaz,
    /// Asynchronous operation already outstanding
    Async,
    /// Resource manager error
    RmErr,
    /// Unknown xid
    NotA,
    /// Invalid arguments
    Inval,
    /// Routine invoked in an improper context
    Proto,
    /// Resource manager unavailable
    RmFail,
    /// Xid already exists
    DupId,
    /// Resource manager doing work outside a global transaction
    Outside,
}

impl XaCode {
    /// True for the `XA_RB*` family: the branch has been rolled back
    pub fn is_rollback(self) -> bool {
        matches!(
            self,
            XaCode::RbRollback
                | XaCode::RbDeadlock
                | XaCode::RbProto
                | XaCode::RbTimeout
                | XaCode::RbIntegrity
                | XaCode::RbOther
        )
    }

    /// True for the `XA_HEUR*` family: the branch requires `forget`
    pub fn is_heuristic(self) -> bool {
        matches!(
            self,
            XaCode::HeurRb | XaCode::HeurCom | XaCode::HeurMix | XaCode::HeurHaz
        )
    }

    /// Canonical XA name
    pub fn name(self) -> &'static str {
        match self {
            XaCode::RbRollback => "XA_RBROLLBACK",
            XaCode::RbDeadlock => "XA_RBDEADLOCK",
            XaCode::RbProto => "XA_RBPROTO",
            XaCode::RbTimeout => "XA_RBTIMEOUT",
            XaCode::RbIntegrity => "XA_RBINTEGRITY",
            XaCode::RbOther => "XA_RBOTHER",
            XaCode::HeurRb => "XA_HEURRB",
            XaCode::HeurCom => "XA_HEURCOM",
            XaCode::HeurMix => "XA_HEURMIX",
            XaCode::HeurHaz => "XA_HEURHAZ",
            XaCode::Async => "XAER_ASYNC",
            XaCode::RmErr => "XAER_RMERR",
            XaCode::NotA => "XAER_NOTA",
            XaCode::Inval => "XAER_INVAL",
            XaCode::Proto => "XAER_PROTO",
            XaCode::RmFail => "XAER_RMFAIL",
            XaCode::DupId => "XAER_DUPID",
            XaCode::Outside => "XAER_OUTSIDE",
        }
    }
}

impl fmt::Display for XaCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error raised across the two-phase commit boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct XaError {
    /// XA error code
    pub code: XaCode,
    /// Human-readable detail
    pub message: String,
}

impl XaError {
    /// Create an XA error
    pub fn new(code: XaCode, message: impl Into<String>) -> Self {
        XaError {
            code,
            message: message.into(),
        }
    }
}
