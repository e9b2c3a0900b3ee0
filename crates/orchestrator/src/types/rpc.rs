use crate::types::ApiError;
use jsonrpsee::IntoResponse;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse<T: Clone> {
    Ok(T),
    Err(ApiError),
}

impl<T: Clone> From<RpcResponse<T>> for Result<T, ApiError> {
    fn from(response: RpcResponse<T>) -> Self {
        match response {
            RpcResponse::Ok(v) => Ok(v),
            RpcResponse::Err(err) => Err(err),
        }
    }
}

impl<T: Clone> From<Result<T, ApiError>> for RpcResponse<T> {
    fn from(result: Result<T, ApiError>) -> Self {
        match result {
            Ok(v) => RpcResponse::Ok(v),
            Err(err) => RpcResponse::Err(err),
        }
    }
}

impl<T: Clone + Serialize> IntoResponse for RpcResponse<T> {
    type Output = RpcResponse<T>;

    fn into_response(self) -> jsonrpsee::types::ResponsePayload<'static, Self::Output> {
        jsonrpsee::types::ResponsePayload::Result(Cow::Owned(self))
    }
}
