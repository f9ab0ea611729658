use crate::{
    api::{
        self,
        registry_client::RegistryClient,
        registry_server::{Registry, RegistryServer},
        registry_update,
    },
    authz::to_status,
    metrics::{GrpcServerMetricsFamily, ResponseObserver},
};
use futures::prelude::*;
use gatehouse_core::{
    registry::{Deployment, DeploymentId, DeploymentStore, Registration, RegistryEvent},
    routes::Protocol,
    Error,
};
use gatehouse_index::{RegistryFeed, RegistryStream};
use std::{pin::Pin, sync::Arc};
use tokio::sync::{broadcast, Mutex};
use tonic::transport::Endpoint;
use tracing::{debug, info, instrument, warn};

const SERVICE: &str = "gatehouse.registry.Registry";

/// Namespace used to validate registrations before they are stored.
const VALIDATION_NAMESPACE: &str = "registry";

const UPDATES_CAPACITY: usize = 128;

/// Accepts service registrations and streams them to gateways.
#[derive(Debug)]
pub struct DeploymentRegistry<S> {
    store: Arc<S>,
    /// Held across each store change and its broadcast, so watchers see
    /// changes in the order the store applied them.
    writes: Arc<Mutex<()>>,
    updates: broadcast::Sender<RegistryEvent>,
    drain: drain::Watch,
    metrics: GrpcServerMetricsFamily,
}

/// Follows a remote registry's `Watch` stream.
#[derive(Clone, Debug)]
pub struct RegistryFeedClient {
    endpoint: Endpoint,
}

type WatchStream = Pin<Box<dyn Stream<Item = Result<api::RegistryUpdate, tonic::Status>> + Send>>;

// === impl DeploymentRegistry ===

impl<S> Clone for DeploymentRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            writes: self.writes.clone(),
            updates: self.updates.clone(),
            drain: self.drain.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S> DeploymentRegistry<S>
where
    S: DeploymentStore + 'static,
{
    pub fn new(store: Arc<S>, drain: drain::Watch, metrics: GrpcServerMetricsFamily) -> Self {
        let (updates, _) = broadcast::channel(UPDATES_CAPACITY);
        Self {
            store,
            writes: Arc::default(),
            updates,
            drain,
            metrics,
        }
    }

    pub fn svc(self) -> RegistryServer<Self> {
        RegistryServer::new(self)
    }

    fn publish(&self, event: RegistryEvent) {
        // No watchers is fine; they receive a full reset when they connect.
        let _ = self.updates.send(event);
    }
}

#[async_trait::async_trait]
impl<S> Registry for DeploymentRegistry<S>
where
    S: DeploymentStore + 'static,
{
    #[instrument(skip_all)]
    async fn start_routing(
        &self,
        req: tonic::Request<api::StartRoutingRequest>,
    ) -> Result<tonic::Response<api::DeployedService>, tonic::Status> {
        let observer = self.metrics.unary_rpc(SERVICE, "StartRouting").start();
        let res = async {
            let registration = req
                .into_inner()
                .registration
                .map(Registration::from)
                .ok_or_else(|| tonic::Status::invalid_argument("a registration is required"))?;
            registration
                .to_route(VALIDATION_NAMESPACE)
                .map_err(|error| tonic::Status::invalid_argument(error.to_string()))?;

            let deployment = Deployment {
                id: DeploymentId::generate(),
                registration,
            };
            let id = deployment.id;
            let _write = self.writes.lock().await;
            let previous = self
                .store
                .insert(deployment.clone())
                .await
                .map_err(to_status)?;
            if let Some(previous) = previous {
                debug!(previous = %previous.id, "Replaced deployment");
            }
            info!(%id, service = %deployment.registration.service, "Routing started");
            self.publish(RegistryEvent::Upsert(deployment.registration));

            Ok(api::DeployedService {
                deployment_id: id.to_string(),
            })
        }
        .await;
        observer.respond(res)
    }

    #[instrument(skip_all)]
    async fn stop_routing(
        &self,
        req: tonic::Request<api::StopRoutingRequest>,
    ) -> Result<tonic::Response<api::StopRoutingResponse>, tonic::Status> {
        let observer = self.metrics.unary_rpc(SERVICE, "StopRouting").start();
        let res = async {
            let id = req
                .into_inner()
                .deployment_id
                .parse::<DeploymentId>()
                .map_err(|error| tonic::Status::invalid_argument(error.to_string()))?;
            let _write = self.writes.lock().await;
            let removed = self.store.delete(id).await.map_err(to_status)?;
            if let Some(Deployment { registration, .. }) = &removed {
                info!(%id, service = %registration.service, "Routing stopped");
                self.publish(RegistryEvent::Remove {
                    service: registration.service.clone(),
                });
            }
            Ok(api::StopRoutingResponse {
                removed: removed.is_some(),
            })
        }
        .await;
        observer.respond(res)
    }

    type WatchStream = WatchStream;

    async fn watch(
        &self,
        _req: tonic::Request<api::WatchRequest>,
    ) -> Result<tonic::Response<WatchStream>, tonic::Status> {
        let observer = self.metrics.server_stream_rpc(SERVICE, "Watch").start();

        // No change may land between the snapshot and the subscription.
        let write = self.writes.lock().await;
        let updates = self.updates.subscribe();
        let registrations = match self.store.list().await {
            Ok(deployments) => deployments.into_iter().map(|d| d.registration).collect(),
            Err(error) => {
                let status = to_status(error);
                observer.end(status.code());
                return Err(status);
            }
        };
        drop(write);

        Ok(tonic::Response::new(response_stream(
            self.drain.clone(),
            observer,
            registrations,
            updates,
        )))
    }
}

fn response_stream(
    drain: drain::Watch,
    observer: ResponseObserver,
    registrations: Vec<Registration>,
    mut updates: broadcast::Receiver<RegistryEvent>,
) -> WatchStream {
    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        observer.msg_sent();
        yield to_update(RegistryEvent::Reset(registrations));

        let skipped = loop {
            tokio::select! {
                res = updates.recv() => match res {
                    Ok(event) => {
                        observer.msg_sent();
                        yield to_update(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => break skipped,
                    Err(broadcast::error::RecvError::Closed) => return,
                },

                // Close the stream so that it doesn't hold the server open.
                _ = (&mut shutdown) => return,
            }
        };

        // The watcher reconnects and starts over from a reset.
        warn!(skipped, "Watch fell behind");
        observer.end(tonic::Code::DataLoss);
        Err::<(), _>(tonic::Status::data_loss(format!("{skipped} updates were skipped")))?;
    })
}

fn to_update(event: RegistryEvent) -> api::RegistryUpdate {
    let kind = match event {
        RegistryEvent::Reset(registrations) => registry_update::Kind::Reset(api::Reset {
            registrations: registrations.into_iter().map(Into::into).collect(),
        }),
        RegistryEvent::Upsert(registration) => registry_update::Kind::Upsert(registration.into()),
        RegistryEvent::Remove { service } => registry_update::Kind::Remove(api::Removed {
            service_name: service,
        }),
    };
    api::RegistryUpdate { kind: Some(kind) }
}

fn from_update(update: api::RegistryUpdate) -> Result<RegistryEvent, Error> {
    match update.kind {
        Some(registry_update::Kind::Reset(api::Reset { registrations })) => Ok(
            RegistryEvent::Reset(registrations.into_iter().map(Into::into).collect()),
        ),
        Some(registry_update::Kind::Upsert(registration)) => {
            Ok(RegistryEvent::Upsert(registration.into()))
        }
        Some(registry_update::Kind::Remove(api::Removed { service_name })) => {
            if service_name.is_empty() {
                return Err(Error::MalformedRegistrationEvent(
                    "removal without a service name".to_string(),
                ));
            }
            Ok(RegistryEvent::Remove {
                service: service_name,
            })
        }
        None => Err(Error::MalformedRegistrationEvent(
            "update without an event".to_string(),
        )),
    }
}

impl From<Registration> for api::Registration {
    fn from(r: Registration) -> Self {
        let protocol = match r.protocol {
            Protocol::Http1 => api::Protocol::Http1,
            Protocol::Http2 => api::Protocol::Http2,
        };
        Self {
            service_name: r.service,
            path: r.path,
            hosts: r.hosts,
            port: r.port.into(),
            tls: r.tls,
            protocol: protocol.into(),
            permission: r.permission.unwrap_or_default(),
        }
    }
}

impl From<api::Registration> for Registration {
    fn from(r: api::Registration) -> Self {
        let protocol = match r.protocol() {
            api::Protocol::Http1 => Protocol::Http1,
            api::Protocol::Http2 => Protocol::Http2,
        };
        Self {
            // Out-of-range ports become 0, which fails route validation.
            port: u16::try_from(r.port).unwrap_or(0),
            service: r.service_name,
            path: r.path,
            hosts: r.hosts,
            tls: r.tls,
            protocol,
            permission: Some(r.permission).filter(|p| !p.is_empty()),
        }
    }
}

// === impl RegistryFeedClient ===

impl RegistryFeedClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait::async_trait]
impl RegistryFeed for RegistryFeedClient {
    async fn watch(&self) -> Result<RegistryStream, Error> {
        let channel = self
            .endpoint
            .connect()
            .await
            .map_err(|error| Error::TransportFailure(error.to_string()))?;
        let rsp = RegistryClient::new(channel)
            .watch(api::WatchRequest {})
            .await
            .map_err(|status| Error::TransportFailure(status.message().to_string()))?;

        let events = rsp.into_inner().map(|res| match res {
            Ok(update) => from_update(update),
            Err(status) => Err(Error::TransportFailure(status.message().to_string())),
        });
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> Registration {
        Registration {
            service: "svc-b".to_string(),
            path: "/svc/b".to_string(),
            hosts: vec!["10.0.0.2".to_string()],
            port: 8080,
            tls: true,
            protocol: Protocol::Http2,
            permission: Some("svc-b-access".to_string()),
        }
    }

    #[test]
    fn empty_permission_is_public() {
        let mut msg = api::Registration::from(registration());
        msg.permission.clear();
        assert_eq!(Registration::from(msg).permission, None);
    }

    #[test]
    fn oversized_ports_are_rejected() {
        let mut msg = api::Registration::from(registration());
        msg.port = 70_000;
        let registration = Registration::from(msg);
        assert!(registration.to_route("registry").is_err());
    }

    #[test]
    fn updates_without_an_event_are_malformed() {
        assert!(matches!(
            from_update(api::RegistryUpdate { kind: None }),
            Err(Error::MalformedRegistrationEvent(_))
        ));
        assert!(matches!(
            from_update(api::RegistryUpdate {
                kind: Some(registry_update::Kind::Remove(api::Removed::default())),
            }),
            Err(Error::MalformedRegistrationEvent(_))
        ));
    }

    #[test]
    fn events_survive_the_wire() {
        let event = RegistryEvent::Reset(vec![registration()]);
        assert_eq!(from_update(to_update(event.clone())), Ok(event));
    }
}
