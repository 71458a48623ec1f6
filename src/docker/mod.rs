//! Client side of the Docker remote API.
//!
//! One [`DockerEndpoint`] per daemon address, all of them behind the
//! [`DockerService`] trait. See `client` for the HTTP implementation,
//! `stream` for the frame decoders and `model` for the wire types.

pub mod args;
pub mod client;
pub mod model;
pub mod result;
pub mod service;
pub mod stream;

pub use args::{
    DeleteContainerArg, GetContainersArg, GetEventsArg, GetImagesArg, GetLogsArg,
    GetStatisticsArg, KillContainerArg, RemoveImageArg, StopContainerArg, TagImageArg,
};
pub use client::{DockerEndpoint, OfflineCause};
pub use model::{
    Container, ContainerConfig, ContainerDetails, CreateContainerSpec, DockerEvent, HostConfig,
    ImageDescriptor, ImageItem, Info, Network, Port, RestartPolicy, Statistics,
    UpdateContainerSpec,
};
pub use result::{ResultCode, ServiceCallResult};
pub use service::{
    service_topic, ClusterConfig, CreateContainerResult, DockerError, DockerService,
    DockerServiceEvent, DockerServiceEventKind, NodeInfoProvider, ServiceInfo, ServiceNodeInfo,
};
pub use stream::{CancelToken, ProcessEvent, StreamKind};
