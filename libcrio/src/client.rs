use std::collections::HashMap;

use hyper_util::rt::TokioIo;
use log::{debug, info};
use serde::Deserialize;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::config::{unix_socket_path, CrioConfig};
use crate::runtime::runtime_service_client::RuntimeServiceClient;
use crate::runtime::{
    Container, ContainerState, ContainerStateValue, ContainerStatusRequest, ContainerFilter,
    ListContainersRequest, VersionRequest,
};
use crate::Result;

/// Read-only client over the container runtime's unix socket.
#[derive(Clone)]
pub struct CrioClient {
    client: RuntimeServiceClient<Channel>,
}

impl CrioClient {
    /// Connects to the runtime endpoint. The per-RPC timeout from the config
    /// applies to every call made through the returned client.
    pub async fn connect(cfg: &CrioConfig) -> Result<Self> {
        let path = unix_socket_path(&cfg.runtime_endpoint)?;
        info!("connecting to container runtime at {path}");

        // The URI is a placeholder; the connector below dials the socket.
        let channel = Endpoint::try_from("http://[::1]:50051")?
            .timeout(cfg.timeout)
            .connect_timeout(cfg.timeout)
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?))
                }
            }))
            .await?;

        Ok(Self {
            client: RuntimeServiceClient::new(channel),
        })
    }

    /// Confirms the runtime answers. Used as a startup probe.
    pub async fn version(&self) -> Result<String> {
        let resp = self
            .client
            .clone()
            .version(VersionRequest::default())
            .await?
            .into_inner();
        Ok(resp.runtime_version)
    }

    /// The id of the single running container whose metadata name equals
    /// `container_name`, if one exists.
    pub async fn resolve_running_container(
        &self,
        container_name: &str,
    ) -> Result<Option<String>> {
        let filter = ContainerFilter {
            state: Some(ContainerStateValue {
                state: ContainerState::ContainerRunning as i32,
            }),
            ..Default::default()
        };
        let resp = self
            .client
            .clone()
            .list_containers(ListContainersRequest {
                filter: Some(filter),
            })
            .await?
            .into_inner();
        debug!(
            "runtime lists {} running containers while resolving {container_name}",
            resp.containers.len()
        );
        Ok(pick_running_container(resp.containers, container_name))
    }

    /// The host pid of a container, from the verbose status info blob.
    pub async fn container_pid(&self, container_id: &str) -> Result<Option<i32>> {
        let resp = self
            .client
            .clone()
            .container_status(ContainerStatusRequest {
                container_id: container_id.to_string(),
                verbose: true,
            })
            .await?
            .into_inner();
        Ok(pid_from_info(&resp.info))
    }
}

fn pick_running_container(containers: Vec<Container>, name: &str) -> Option<String> {
    containers
        .into_iter()
        .find(|c| {
            c.state == ContainerState::ContainerRunning as i32
                && c.metadata.as_ref().is_some_and(|m| m.name == name)
        })
        .map(|c| c.id)
}

/// The verbose status response carries a runtime-specific JSON blob under
/// the `info` key; the host pid lives in its `pid` field.
fn pid_from_info(info: &HashMap<String, String>) -> Option<i32> {
    #[derive(Deserialize)]
    struct Information {
        #[serde(default)]
        pid: i32,
    }

    let blob = info.get("info")?;
    let parsed: Information = serde_json::from_str(blob).ok()?;
    (parsed.pid > 0).then_some(parsed.pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ContainerMetadata;

    fn container(id: &str, name: &str, state: ContainerState) -> Container {
        Container {
            id: id.to_string(),
            metadata: Some(ContainerMetadata {
                name: name.to_string(),
                attempt: 0,
            }),
            state: state as i32,
            ..Default::default()
        }
    }

    #[test]
    fn test_pick_running_container() {
        let containers = vec![
            container("aaa1234567", "router-a", ContainerState::ContainerExited),
            container("bbb1234567", "router-b", ContainerState::ContainerRunning),
            container("ccc1234567", "router-a", ContainerState::ContainerRunning),
        ];
        assert_eq!(
            pick_running_container(containers.clone(), "router-a"),
            Some("ccc1234567".to_string())
        );
        assert_eq!(pick_running_container(containers, "router-c"), None);
    }

    #[test]
    fn test_pid_from_info() {
        let mut info = HashMap::new();
        info.insert(
            "info".to_string(),
            r#"{"sandboxID":"deadbeef","pid":4242,"runtimeSpec":{}}"#.to_string(),
        );
        assert_eq!(pid_from_info(&info), Some(4242));

        info.insert("info".to_string(), r#"{"pid":0}"#.to_string());
        assert_eq!(pid_from_info(&info), None);

        info.insert("info".to_string(), "not-json".to_string());
        assert_eq!(pid_from_info(&info), None);

        assert_eq!(pid_from_info(&HashMap::new()), None);
    }
}
