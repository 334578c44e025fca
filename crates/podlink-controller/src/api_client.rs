use crate::error::{ControllerError, Result};
use crate::traits::VncApi;
use async_trait::async_trait;
use podlink_core::{
    FqName, InstanceIp, ObjectKind, ObjectRef, RefOp, VirtualMachine, VirtualMachineInterface,
    VirtualNetwork, VirtualRouter,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// HTTP client for the SDN resource-graph API.
///
/// Objects travel wrapped in their kind (`{"virtual-machine": {...}}`).
/// Every request carries the configured timeout; nothing is retried here.
pub struct VncClient {
    base_url: String,
    client: Client,
    auth_token: Option<String>,
}

impl VncClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            ControllerError::invalid_config(
                format!("failed to build HTTP client: {}", e),
                "Check the TLS setup of this host",
            )
        })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            auth_token: None,
        })
    }

    /// Send `X-Auth-Token` with every request
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn object_url(&self, kind: ObjectKind, uuid: &str) -> String {
        format!("{}/{}/{}", self.base_url, kind, uuid)
    }

    fn collection_url(&self, kind: ObjectKind) -> String {
        format!("{}/{}s", self.base_url, kind)
    }

    async fn send(
        &self,
        op: &str,
        kind: ObjectKind,
        id: &str,
        request: RequestBuilder,
    ) -> Result<Response> {
        let request = match &self.auth_token {
            Some(token) => request.header("X-Auth-Token", token),
            None => request,
        };
        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ControllerError::timeout(op)
            } else {
                ControllerError::remote_failure(op, format!("HTTP request failed: {}", e))
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(status_error(op, kind, id, status, &body))
    }

    async fn json_body(op: &str, resp: Response) -> Result<Value> {
        resp.json::<Value>().await.map_err(|e| {
            ControllerError::remote_failure(op, format!("Failed to parse response: {}", e))
        })
    }

    async fn read<T: DeserializeOwned>(&self, kind: ObjectKind, uuid: &str) -> Result<T> {
        let op = format!("{}-read", kind);
        let url = self.object_url(kind, uuid);
        debug!("GET {}", url);

        let resp = self.send(&op, kind, uuid, self.client.get(&url)).await?;
        let body = Self::json_body(&op, resp).await?;
        unwrap_object(&op, kind, body)
    }

    async fn create<T: Serialize>(&self, kind: ObjectKind, uuid: &str, obj: &T) -> Result<String> {
        let op = format!("{}-create", kind);
        let url = self.collection_url(kind);
        debug!("POST {}", url);

        let request = self.client.post(&url).json(&json!({ kind.as_str(): obj }));
        let resp = self.send(&op, kind, uuid, request).await?;
        let body = Self::json_body(&op, resp).await?;
        body[kind.as_str()]["uuid"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ControllerError::remote_failure(op, "response carries no uuid"))
    }

    async fn update<T: Serialize>(&self, kind: ObjectKind, uuid: &str, obj: &T) -> Result<()> {
        let op = format!("{}-update", kind);
        let url = self.object_url(kind, uuid);
        debug!("PUT {}", url);

        let request = self.client.put(&url).json(&json!({ kind.as_str(): obj }));
        self.send(&op, kind, uuid, request).await?;
        Ok(())
    }

    async fn delete(&self, kind: ObjectKind, uuid: &str) -> Result<()> {
        let op = format!("{}-delete", kind);
        let url = self.object_url(kind, uuid);
        debug!("DELETE {}", url);

        self.send(&op, kind, uuid, self.client.delete(&url)).await?;
        Ok(())
    }

    async fn list<T: DeserializeOwned>(&self, kind: ObjectKind, filters: &[(&str, &str)]) -> Result<Vec<T>> {
        let op = format!("{}-list", kind);
        let url = self.collection_url(kind);
        debug!("GET {} {:?}", url, filters);

        let mut query = vec![("detail", "true")];
        query.extend_from_slice(filters);
        let resp = self
            .send(&op, kind, "*", self.client.get(&url).query(&query))
            .await?;
        let body = Self::json_body(&op, resp).await?;

        let items = body[format!("{}s", kind)].as_array().cloned().unwrap_or_default();
        items
            .into_iter()
            .map(|item| unwrap_object(&op, kind, item))
            .collect()
    }

    async fn post_action(&self, op: &str, kind: ObjectKind, id: &str, path: &str, body: Value) -> Result<()> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("POST {}", url);
        self.send(op, kind, id, self.client.post(&url).json(&body))
            .await?;
        Ok(())
    }
}

/// Map a non-success HTTP status to the error taxonomy
fn status_error(op: &str, kind: ObjectKind, id: &str, status: StatusCode, body: &str) -> ControllerError {
    match status {
        StatusCode::NOT_FOUND => ControllerError::object_not_found(kind, id),
        StatusCode::CONFLICT => ControllerError::already_exists(kind, id),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ControllerError::timeout(op),
        _ => ControllerError::remote_failure(op, format!("status {}: {}", status, body)),
    }
}

/// Extract `{"<kind>": {...}}`
fn unwrap_object<T: DeserializeOwned>(op: &str, kind: ObjectKind, mut body: Value) -> Result<T> {
    let inner = body
        .get_mut(kind.as_str())
        .map(Value::take)
        .ok_or_else(|| ControllerError::remote_failure(op, format!("response carries no {}", kind)))?;
    serde_json::from_value(inner).map_err(|e| {
        ControllerError::remote_failure(op, format!("Failed to decode {}: {}", kind, e))
    })
}

#[async_trait]
impl VncApi for VncClient {
    async fn virtual_network_read(&self, fq_name: &FqName) -> Result<VirtualNetwork> {
        let kind = ObjectKind::VirtualNetwork;
        let op = "fqname-to-id";
        let url = format!("{}/fqname-to-id", self.base_url);
        debug!("POST {} ({})", url, fq_name);

        let request = self
            .client
            .post(&url)
            .json(&json!({ "type": kind.as_str(), "fq_name": fq_name }));
        let resp = self.send(op, kind, &fq_name.to_string(), request).await?;
        let body = Self::json_body(op, resp).await?;
        let uuid = body["uuid"]
            .as_str()
            .ok_or_else(|| ControllerError::remote_failure(op, "response carries no uuid"))?
            .to_string();

        self.read(kind, &uuid).await
    }

    async fn virtual_machine_create(&self, vm: &VirtualMachine) -> Result<String> {
        self.create(ObjectKind::VirtualMachine, &vm.uuid, vm).await
    }

    async fn virtual_machine_read(&self, uuid: &str) -> Result<VirtualMachine> {
        self.read(ObjectKind::VirtualMachine, uuid).await
    }

    async fn virtual_machine_update(&self, vm: &VirtualMachine) -> Result<()> {
        self.update(ObjectKind::VirtualMachine, &vm.uuid, vm).await
    }

    async fn virtual_machine_delete(&self, uuid: &str) -> Result<()> {
        self.delete(ObjectKind::VirtualMachine, uuid).await
    }

    async fn virtual_machine_list(&self) -> Result<Vec<VirtualMachine>> {
        self.list(ObjectKind::VirtualMachine, &[]).await
    }

    async fn virtual_machine_interface_create(
        &self,
        vmi: &VirtualMachineInterface,
    ) -> Result<String> {
        self.create(ObjectKind::VirtualMachineInterface, &vmi.uuid, vmi)
            .await
    }

    async fn virtual_machine_interface_read(&self, uuid: &str) -> Result<VirtualMachineInterface> {
        self.read(ObjectKind::VirtualMachineInterface, uuid).await
    }

    async fn virtual_machine_interface_update(&self, vmi: &VirtualMachineInterface) -> Result<()> {
        self.update(ObjectKind::VirtualMachineInterface, &vmi.uuid, vmi)
            .await
    }

    async fn virtual_machine_interface_delete(&self, uuid: &str) -> Result<()> {
        self.delete(ObjectKind::VirtualMachineInterface, uuid).await
    }

    async fn instance_ip_create(&self, iip: &InstanceIp) -> Result<String> {
        self.create(ObjectKind::InstanceIp, &iip.uuid, iip).await
    }

    async fn instance_ip_update(&self, iip: &InstanceIp) -> Result<()> {
        self.update(ObjectKind::InstanceIp, &iip.uuid, iip).await
    }

    async fn instance_ip_delete(&self, uuid: &str) -> Result<()> {
        self.delete(ObjectKind::InstanceIp, uuid).await
    }

    async fn instance_ip_find(
        &self,
        address: &str,
        network: &FqName,
    ) -> Result<Option<InstanceIp>> {
        let filter = format!("instance_ip_address=={}", address);
        let iips: Vec<InstanceIp> = self
            .list(ObjectKind::InstanceIp, &[("filters", filter.as_str())])
            .await?;
        Ok(iips.into_iter().find(|iip| &iip.virtual_network == network))
    }

    async fn floating_ip_delete(&self, uuid: &str) -> Result<()> {
        self.delete(ObjectKind::FloatingIp, uuid).await
    }

    async fn virtual_router_read(&self, uuid: &str) -> Result<VirtualRouter> {
        self.read(ObjectKind::VirtualRouter, uuid).await
    }

    async fn virtual_router_list(&self) -> Result<Vec<VirtualRouter>> {
        self.list(ObjectKind::VirtualRouter, &[]).await
    }

    async fn ref_update(&self, from: &ObjectRef, to: &ObjectRef, op: RefOp) -> Result<()> {
        let body = json!({
            "type": from.kind,
            "uuid": from.uuid,
            "ref-type": to.kind,
            "ref-uuid": to.uuid,
            "operation": op,
        });
        // A missing endpoint is reported as the target, which is the one that races
        self.post_action("ref-update", to.kind, &to.uuid, "ref-update", body)
            .await
    }

    async fn set_tag(&self, vmi_uuid: &str, key: &str, value: &str) -> Result<()> {
        let body = json!({
            "obj_uuid": vmi_uuid,
            key: { "is_global": false, "value": value },
        });
        self.post_action(
            "set-tag",
            ObjectKind::VirtualMachineInterface,
            vmi_uuid,
            "set-tag",
            body,
        )
        .await
    }

    async fn unset_tag(&self, vmi_uuid: &str, key: &str) -> Result<()> {
        let body = json!({ "obj_uuid": vmi_uuid, key: null });
        self.post_action(
            "unset-tag",
            ObjectKind::VirtualMachineInterface,
            vmi_uuid,
            "set-tag",
            body,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = VncClient::new("http://sdn:8082/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "http://sdn:8082");
        assert_eq!(
            client.object_url(ObjectKind::InstanceIp, "iip-1"),
            "http://sdn:8082/instance-ip/iip-1"
        );
        assert_eq!(
            client.collection_url(ObjectKind::VirtualMachine),
            "http://sdn:8082/virtual-machines"
        );
    }

    #[test]
    fn test_status_mapping() {
        let kind = ObjectKind::VirtualMachine;
        assert!(status_error("vm-read", kind, "p1", StatusCode::NOT_FOUND, "").is_not_found());
        assert!(status_error("vm-create", kind, "p1", StatusCode::CONFLICT, "").is_already_exists());
        assert!(matches!(
            status_error("vm-read", kind, "p1", StatusCode::GATEWAY_TIMEOUT, ""),
            ControllerError::Timeout { .. }
        ));
        assert!(matches!(
            status_error("vm-read", kind, "p1", StatusCode::UNAUTHORIZED, "denied"),
            ControllerError::RemoteFailure { .. }
        ));
    }

    #[test]
    fn test_unwrap_object() {
        let body = json!({
            "virtual-router": {
                "uuid": "vr-1",
                "name": "node1",
                "ip-address": "10.0.0.5"
            }
        });
        let vr: VirtualRouter =
            unwrap_object("virtual-router-read", ObjectKind::VirtualRouter, body).unwrap();
        assert_eq!(vr.ip_address, "10.0.0.5");
        assert!(vr.virtual_machines.is_empty());

        let err = unwrap_object::<VirtualRouter>("x", ObjectKind::VirtualRouter, json!({}))
            .unwrap_err();
        assert!(matches!(err, ControllerError::RemoteFailure { .. }));
    }
}
