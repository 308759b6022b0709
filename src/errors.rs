use std::fmt;

/// Flowweave custom `Result` type, using `Error` as the `Err` type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
/// Flowweave custom error type.
pub struct Error(pub String);

impl<T: std::error::Error + std::fmt::Display> From<T> for Error {
    fn from(e: T) -> Error {
        Error(format!("flowweave err: {}", e))
    }
}

#[derive(Debug, Clone)]
pub struct RoutingMissError(pub u32);
impl std::error::Error for RoutingMissError {
    fn description(&self) -> &str {
        "destination ip has no entry in the next-hop table"
    }
}
impl std::fmt::Display for RoutingMissError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "destination ip {:#010x} has no entry in the next-hop table",
            self.0
        )
    }
}

#[derive(Debug, Clone)]
pub struct MissingTagError;
impl std::error::Error for MissingTagError {
    fn description(&self) -> &str {
        "a tagged packet was expected but no tag was present"
    }
}
impl std::fmt::Display for MissingTagError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a tagged packet was expected but no tag was present")
    }
}

#[derive(Debug, Clone)]
pub struct EmptyPathSetError(pub u32);
impl std::error::Error for EmptyPathSetError {
    fn description(&self) -> &str {
        "no paths are enumerated toward the destination ToR"
    }
}
impl std::fmt::Display for EmptyPathSetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "no paths are enumerated toward destination ToR {}",
            self.0
        )
    }
}
