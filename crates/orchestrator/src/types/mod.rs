mod build;
mod cvd;
mod error;
pub mod rpc;

pub use build::{AndroidBuild, AndroidCiBuild, AndroidCiBuildSource, BuildSource, UserBuildSource};
pub use cvd::{CreateCvdRequest, CreateCvdResponse, Cvd, ListCvdsResponse};
pub use error::{ApiError, ErrorKind, MultiError};
