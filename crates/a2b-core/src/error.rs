use thiserror::Error;

/// Error taxonomy shared by every layer of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum A2bError {
    /// Caller input failed validation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// The stack heap could not satisfy an allocation.
    #[error("allocation failure")]
    AllocFailure,
    /// Domain or ownership mismatch.
    #[error("permission denied: {0}")]
    Permission(&'static str),
    /// Node, context, or mailbox is absent.
    #[error("does not exist")]
    DoesNotExist,
    /// Busy, or no plugin is available to handle the request.
    #[error("resource unavailable")]
    ResourceUnavailable,
    /// The operation was cancelled before completion.
    #[error("cancelled")]
    Cancelled,
    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// Result severity bit of a packed [`ResultCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Failure,
}

/// Stack facility that produced a packed [`ResultCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Facility {
    Stack = 1,
    Router = 2,
    Executor = 3,
    Plugin = 4,
    Sequencer = 5,
}

impl Facility {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Stack),
            2 => Some(Self::Router),
            3 => Some(Self::Executor),
            4 => Some(Self::Plugin),
            5 => Some(Self::Sequencer),
            _ => None,
        }
    }
}

const SEVERITY_FAILURE_BIT: u32 = 1 << 31;
const FACILITY_SHIFT: u32 = 16;

const CODE_INVALID_PARAMETER: u16 = 1;
const CODE_ALLOC_FAILURE: u16 = 2;
const CODE_PERMISSION: u16 = 3;
const CODE_DOES_NOT_EXIST: u16 = 4;
const CODE_RESOURCE_UNAVAILABLE: u16 = 5;
const CODE_CANCELLED: u16 = 6;
const CODE_INTERNAL: u16 = 7;

/// Packed `(severity, facility, code)` status word.
///
/// Bit 31 is the failure flag, bits 16..24 hold the facility and the low
/// 16 bits the code. This is the form a status takes inside a fixed
/// message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);

    pub fn make(severity: Severity, facility: Facility, code: u16) -> Self {
        let sev = match severity {
            Severity::Success => 0,
            Severity::Failure => SEVERITY_FAILURE_BIT,
        };
        Self(sev | ((facility as u32) << FACILITY_SHIFT) | code as u32)
    }

    pub fn from_result(result: Result<(), A2bError>, facility: Facility) -> Self {
        match result {
            Ok(()) => Self::SUCCESS,
            Err(err) => err.code(facility),
        }
    }

    pub fn severity(self) -> Severity {
        if self.0 & SEVERITY_FAILURE_BIT != 0 {
            Severity::Failure
        } else {
            Severity::Success
        }
    }

    pub fn facility(self) -> Option<Facility> {
        Facility::from_u8(((self.0 >> FACILITY_SHIFT) & 0xFF) as u8)
    }

    pub fn code(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Decodes the status word back into a result.
    ///
    /// Returns `None` for words that no stack facility could have produced.
    pub fn into_result(self) -> Option<Result<(), A2bError>> {
        if self.0 & !(SEVERITY_FAILURE_BIT | (0xFF << FACILITY_SHIFT) | 0xFFFF) != 0 {
            return None;
        }
        match self.severity() {
            Severity::Success => (self.code() == 0).then_some(Ok(())),
            Severity::Failure => {
                self.facility()?;
                let err = match self.code() {
                    CODE_INVALID_PARAMETER => A2bError::InvalidParameter("reported by peer"),
                    CODE_ALLOC_FAILURE => A2bError::AllocFailure,
                    CODE_PERMISSION => A2bError::Permission("reported by peer"),
                    CODE_DOES_NOT_EXIST => A2bError::DoesNotExist,
                    CODE_RESOURCE_UNAVAILABLE => A2bError::ResourceUnavailable,
                    CODE_CANCELLED => A2bError::Cancelled,
                    CODE_INTERNAL => A2bError::Internal("reported by peer"),
                    _ => return None,
                };
                Some(Err(err))
            }
        }
    }
}

impl A2bError {
    /// Packs this error as a failure status attributed to `facility`.
    pub fn code(&self, facility: Facility) -> ResultCode {
        let code = match self {
            Self::InvalidParameter(_) => CODE_INVALID_PARAMETER,
            Self::AllocFailure => CODE_ALLOC_FAILURE,
            Self::Permission(_) => CODE_PERMISSION,
            Self::DoesNotExist => CODE_DOES_NOT_EXIST,
            Self::ResourceUnavailable => CODE_RESOURCE_UNAVAILABLE,
            Self::Cancelled => CODE_CANCELLED,
            Self::Internal(_) => CODE_INTERNAL,
        };
        ResultCode::make(Severity::Failure, facility, code)
    }

    /// Whether this error means "no plugin at that address" during a scan.
    pub fn is_absent_node(&self) -> bool {
        matches!(self, Self::DoesNotExist | Self::ResourceUnavailable)
    }
}
