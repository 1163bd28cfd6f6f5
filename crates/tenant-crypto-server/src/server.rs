use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use shared::error::CommonError;
use tenant_crypto::router::{TenantCryptoService, create_router};
use tracing::info;

pub struct StartAxumServerParams {
    pub host: String,
    pub port: u16,
    pub service: TenantCryptoService,
}

pub fn start_axum_server(
    params: StartAxumServerParams,
) -> Result<
    (
        impl Future<Output = Result<(), std::io::Error>>,
        axum_server::Handle,
        SocketAddr,
    ),
    CommonError,
> {
    let addr: SocketAddr = format!("{}:{}", params.host, params.port)
        .parse()
        .map_err(|e| CommonError::AddrParseError { source: e })?;

    info!("starting server on {addr}");

    let (api_router, _spec) = create_router()
        .with_state(params.service)
        .split_for_parts();
    let router = Router::new().merge(api_router);

    let handle = axum_server::Handle::new();
    let server_fut = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(router.into_make_service());

    Ok((server_fut, handle, addr))
}
