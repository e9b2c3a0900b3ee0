use std::{net::SocketAddr, sync::Arc, time::Duration};

use eyre::Result;
use jsonrpsee::{
    server::{RpcModule, Server, ServerHandle},
    types::Params,
};

use crate::{
    cli::Config,
    operation::Operation,
    orchestrator::InstanceManager,
    types::{rpc::RpcResponse, ApiError, CreateCvdRequest, CreateCvdResponse, ListCvdsResponse},
};

struct Context {
    instance_manager: Arc<InstanceManager>,
    operation_wait: Duration,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC Context")
    }
}

pub struct RpcServer {
    local_addr: SocketAddr,
    server_handle: ServerHandle,
}

impl RpcServer {
    pub async fn run(cfg: &Config, instance_manager: Arc<InstanceManager>) -> Result<Self> {
        let server = Server::builder().build(cfg.json_rpc_listen_addr).await?;
        let mut module = RpcModule::new(Context {
            instance_manager,
            operation_wait: cfg.operation_wait(),
        });

        module.register_async_method("createCvd", create_cvd)?;
        module.register_async_method("listCvds", list_cvds)?;
        module.register_async_method("listOperations", list_operations)?;
        module.register_async_method("getOperation", get_operation)?;
        module.register_async_method("getOperationResult", get_operation_result)?;
        module.register_async_method("waitOperation", wait_operation)?;

        let local_addr = server.local_addr()?;
        let server_handle = server.start(module);
        tracing::info!("listening for json-rpc at {}", local_addr);
        Ok(RpcServer {
            local_addr,
            server_handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(&self) -> Result<()> {
        self.server_handle.stop().map_err(|e| e.into())
    }
}

fn parse_one<T: serde::de::DeserializeOwned>(params: &Params<'static>) -> Result<T, ApiError> {
    params.one().map_err(|e| {
        tracing::error!("failed to parse request params: {}", e);
        ApiError::bad_request(e.to_string())
    })
}

#[tracing::instrument(level = "info")]
async fn create_cvd(
    params: Params<'static>,
    ctx: Arc<Context>,
) -> RpcResponse<Operation<CreateCvdResponse>> {
    tracing::info!("JSON-RPC: create_cvd()");

    let req: CreateCvdRequest = match parse_one(&params) {
        Ok(req) => req,
        Err(err) => return RpcResponse::Err(err),
    };

    ctx.instance_manager.create_cvd(req).await.into()
}

#[tracing::instrument(level = "info")]
async fn list_cvds(_params: Params<'static>, ctx: Arc<Context>) -> RpcResponse<ListCvdsResponse> {
    tracing::info!("JSON-RPC: list_cvds()");
    ctx.instance_manager.list_cvds().await.into()
}

#[tracing::instrument(level = "info")]
async fn list_operations(
    _params: Params<'static>,
    ctx: Arc<Context>,
) -> RpcResponse<Vec<Operation<CreateCvdResponse>>> {
    tracing::info!("JSON-RPC: list_operations()");
    RpcResponse::Ok(ctx.instance_manager.operations().list_running().await)
}

#[tracing::instrument(level = "info")]
async fn get_operation(
    params: Params<'static>,
    ctx: Arc<Context>,
) -> RpcResponse<Operation<CreateCvdResponse>> {
    let name: String = match parse_one(&params) {
        Ok(name) => name,
        Err(err) => return RpcResponse::Err(err),
    };

    tracing::info!("JSON-RPC: get_operation()");

    ctx.instance_manager
        .operations()
        .get(&name)
        .await
        .map_err(ApiError::from)
        .into()
}

#[tracing::instrument(level = "info")]
async fn get_operation_result(
    params: Params<'static>,
    ctx: Arc<Context>,
) -> RpcResponse<CreateCvdResponse> {
    let name: String = match parse_one(&params) {
        Ok(name) => name,
        Err(err) => return RpcResponse::Err(err),
    };

    tracing::info!("JSON-RPC: get_operation_result()");

    match ctx.instance_manager.operations().get_result(&name).await {
        Ok(result) => result.into(),
        Err(err) => RpcResponse::Err(err.into()),
    }
}

#[tracing::instrument(level = "info")]
async fn wait_operation(
    params: Params<'static>,
    ctx: Arc<Context>,
) -> RpcResponse<CreateCvdResponse> {
    let name: String = match parse_one(&params) {
        Ok(name) => name,
        Err(err) => return RpcResponse::Err(err),
    };

    tracing::info!("JSON-RPC: wait_operation()");

    match ctx
        .instance_manager
        .operations()
        .wait(&name, ctx.operation_wait)
        .await
    {
        Ok(result) => result.into(),
        Err(err) => RpcResponse::Err(err.into()),
    }
}
