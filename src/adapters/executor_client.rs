use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use url::Url;

use crate::{
    core::{
        address::ServiceAddress,
        function::{ExecutionStrategy, FunctionIdentity, FunctionSpec},
    },
    ports::address_resolver::{AddressResolver, ResolverError, ResolverResult},
};

const GET_SERVICE_PATH: &str = "/v2/getServiceForFunction";
const TAP_SERVICES_PATH: &str = "/v2/tapServices";
const UNTAP_SERVICE_PATH: &str = "/v2/unTapService";

#[derive(Serialize)]
struct FunctionRequest<'a> {
    #[serde(flatten)]
    identity: &'a FunctionIdentity,
    strategy: ExecutionStrategy,
}

#[derive(Serialize)]
struct TapRequest<'a> {
    #[serde(flatten)]
    function: FunctionRequest<'a>,
    service_url: String,
}

/// `AddressResolver` speaking JSON over HTTP to the executor.
pub struct ExecutorClient {
    base: Url,
    client: Client,
}

impl ExecutorClient {
    pub fn new(base_url: &str, timeout: Duration) -> eyre::Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| eyre::eyre!("Invalid executor URL '{base_url}': {e}"))?;
        let client = Client::builder().timeout(timeout).build()?;
        tracing::info!(executor = %base, "Created executor client");
        Ok(Self { base, client })
    }

    fn endpoint(&self, path: &str) -> ResolverResult<Url> {
        self.base
            .join(path)
            .map_err(|e| ResolverError::new(None, format!("invalid executor endpoint {path}: {e}")))
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> ResolverResult<reqwest::Response> {
        let url = self.endpoint(path)?;
        self.client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| ResolverError::new(None, format!("executor request {path} failed: {e}")))
    }

    async fn expect_success(path: &str, response: reqwest::Response) -> ResolverResult<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ResolverError::new(
            Some(status),
            format!("executor {path} returned {status}: {}", body.trim()),
        ))
    }
}

#[async_trait]
impl AddressResolver for ExecutorClient {
    async fn get_address_for_function(
        &self,
        function: &FunctionSpec,
    ) -> ResolverResult<Option<ServiceAddress>> {
        let request = FunctionRequest {
            identity: &function.identity,
            strategy: function.strategy,
        };
        let response = self.post(GET_SERVICE_PATH, &request).await?;

        match response.status() {
            StatusCode::ACCEPTED | StatusCode::NO_CONTENT => {
                tracing::debug!(function = %function.identity, "Executor reports backend not ready");
                Ok(None)
            }
            StatusCode::OK => {
                let body = response.text().await.map_err(|e| {
                    ResolverError::new(None, format!("reading executor response: {e}"))
                })?;
                let address = ServiceAddress::parse(&body).map_err(|e| {
                    ResolverError::new(None, format!("executor returned a bad address: {e}"))
                })?;
                tracing::debug!(function = %function.identity, %address, "Executor resolved address");
                Ok(Some(address))
            }
            // Only 200 carries an address.
            status if status.is_success() => Err(ResolverError::new(
                None,
                format!("executor {GET_SERVICE_PATH} answered with unexpected status {status}"),
            )),
            _ => Self::expect_success(GET_SERVICE_PATH, response)
                .await
                .map(|_| None),
        }
    }

    async fn tap(&self, function: &FunctionSpec, address: &ServiceAddress) -> ResolverResult<()> {
        let request = [TapRequest {
            function: FunctionRequest {
                identity: &function.identity,
                strategy: function.strategy,
            },
            service_url: address.to_string(),
        }];
        let response = self.post(TAP_SERVICES_PATH, &request).await?;
        Self::expect_success(TAP_SERVICES_PATH, response).await
    }

    async fn untap(
        &self,
        function: &FunctionSpec,
        address: &ServiceAddress,
    ) -> ResolverResult<()> {
        let request = TapRequest {
            function: FunctionRequest {
                identity: &function.identity,
                strategy: function.strategy,
            },
            service_url: address.to_string(),
        };
        let response = self.post(UNTAP_SERVICE_PATH, &request).await?;
        Self::expect_success(UNTAP_SERVICE_PATH, response).await
    }
}
