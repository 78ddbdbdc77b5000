use core::fmt;
use log::error;
use std::{error::Error, panic::Location};

/// 驱动或设备管理库返回的原始结果码。
///
/// 结果码原样传递给调用者，不做任何转换。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct DriverError(pub i32);

pub type DriverResult<T = ()> = Result<T, DriverError>;

impl DriverError {
    pub const INVALID_VALUE: Self = Self(1);
    pub const OUT_OF_MEMORY: Self = Self(2);
    pub const NOT_INITIALIZED: Self = Self(3);
    pub const NO_DEVICE: Self = Self(100);
    pub const INVALID_IMAGE: Self = Self(200);
    pub const INVALID_HANDLE: Self = Self(400);
    pub const NOT_FOUND: Self = Self(500);
    pub const NOT_SUPPORTED: Self = Self(801);

    #[inline]
    pub const fn code(self) -> i32 {
        self.0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::INVALID_VALUE => "invalid value",
            Self::OUT_OF_MEMORY => "out of memory",
            Self::NOT_INITIALIZED => "not initialized",
            Self::NO_DEVICE => "no device",
            Self::INVALID_IMAGE => "invalid image",
            Self::INVALID_HANDLE => "invalid handle",
            Self::NOT_FOUND => "not found",
            Self::NOT_SUPPORTED => "not supported",
            _ => return None,
        })
    }
}

impl Error for DriverError {}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "driver error {} ({name})", self.0),
            None => write!(f, "driver error {}", self.0),
        }
    }
}

/// 检查结果码，失败时打印出错位置和函数名。
#[track_caller]
pub fn check(code: i32, function: &str) -> DriverResult {
    if code == 0 {
        Ok(())
    } else {
        let location = Location::caller();
        error!(
            "Driver error {code} encountered at {}[{}] in function {function}",
            location.file(),
            location.line(),
        );
        Err(DriverError(code))
    }
}

/// 初始化阶段的错误。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceError {
    NoDevicesFound,
    ProgramNotFound,
    InvalidProgram(DriverError),
}

impl Error for DeviceError {}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoDevicesFound => write!(f, "no devices found"),
            Self::ProgramNotFound => write!(f, "device program not found"),
            Self::InvalidProgram(e) => write!(f, "device program rejected: {e}"),
        }
    }
}

/// 带出错函数和说明的结果码，用于拓扑查询等可选子系统。
#[derive(Clone)]
pub struct ErrorCode {
    function: &'static str,
    code: i32,
    message: String,
}

impl Error for ErrorCode {}

impl ErrorCode {
    #[inline]
    pub fn new(function: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self {
            function,
            code,
            message: message.into(),
        }
    }

    #[inline]
    pub const fn function(&self) -> &'static str {
        self.function
    }

    #[inline]
    pub const fn code(&self) -> i32 {
        self.code
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for ErrorCode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {:?} ({})", self.function, self.message, self.code)
    }
}

impl fmt::Display for ErrorCode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {} ({})", self.function, self.message, self.code)
    }
}

#[test]
fn test_check() {
    assert_eq!(check(0, "noop"), Ok(()));
    assert_eq!(check(2, "alloc"), Err(DriverError::OUT_OF_MEMORY));
    assert_eq!(check(719, "launch"), Err(DriverError(719)));
}

#[test]
fn test_display() {
    assert_eq!(
        DriverError::NOT_INITIALIZED.to_string(),
        "driver error 3 (not initialized)"
    );
    assert_eq!(DriverError(719).to_string(), "driver error 719");

    let e = ErrorCode::new("query_nvlink", -1, "Failed to load NVML");
    assert_eq!(e.to_string(), "query_nvlink: Failed to load NVML (-1)");
    assert_eq!(e.code(), -1);
    assert_eq!(
        DeviceError::InvalidProgram(DriverError::INVALID_IMAGE).to_string(),
        "device program rejected: driver error 200 (invalid image)"
    );
}
