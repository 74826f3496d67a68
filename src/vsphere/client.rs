use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    decode_entity_metric, Connector, EntityMetric, ManagedObjectRef, ObjectContent, PerfQuerySpec,
    ServiceContent, Session, VsphereError,
};
use crate::config::{VCenterConfig, VsphereConfig};

/// Header carrying the session token on every authenticated request.
const SESSION_HEADER: &str = "vmware-api-session-id";

/// Opens [`HttpSession`]s using the vSphere Web Services JSON protocol.
pub struct HttpConnector {
    cfg: VsphereConfig,
}

impl HttpConnector {
    pub fn new(cfg: VsphereConfig) -> Self {
        Self { cfg }
    }
}

impl Connector for HttpConnector {
    type Session = HttpSession;

    async fn connect(&self, source: &VCenterConfig) -> Result<HttpSession> {
        HttpSession::login(&self.cfg, source).await
    }
}

/// Authenticated VI/JSON session against one vCenter.
pub struct HttpSession {
    http: reqwest::Client,
    base: String,
    session_id: String,
    content: ServiceContent,
}

impl HttpSession {
    /// Fetch the service content and log in with the source's credentials.
    pub async fn login(cfg: &VsphereConfig, source: &VCenterConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(60)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(source.insecure)
            .build()
            .context("building HTTP client")?;

        let base = base_url(&source.hostname, &cfg.api_release);

        let response = http
            .get(format!("{base}/ServiceInstance/ServiceInstance/content"))
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("requesting service content from {}", source.hostname))?;
        let content: ServiceContent = decode_response("RetrieveServiceContent", response).await?;

        let login_url = method_url(&base, &content.session_manager, "Login");
        let response = http
            .post(&login_url)
            .json(&json!({
                "userName": source.username,
                "password": source.password,
            }))
            .send()
            .await
            .with_context(|| format!("logging in to {}", source.hostname))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VsphereError::Status {
                method: "Login".to_string(),
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(VsphereError::NoSessionId)?;

        debug!(vcenter = %source.hostname, "vSphere session established");

        Ok(Self {
            http,
            base,
            session_id,
            content,
        })
    }

    /// Invoke a managed object method and decode its JSON return value.
    async fn invoke<T: DeserializeOwned>(
        &self,
        obj: &ManagedObjectRef,
        method: &str,
        body: &Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(method_url(&self.base, obj, method))
            .header(SESSION_HEADER, &self.session_id)
            .json(body)
            .send()
            .await
            .with_context(|| format!("invoking {method} on {obj}"))?;

        decode_response(method, response).await
    }

    async fn retrieve_contents(&self, spec_set: Value) -> Result<Vec<ObjectContent>> {
        let collector = &self.content.property_collector;

        let mut result: Option<RetrieveResultJson> = self
            .invoke(
                collector,
                "RetrievePropertiesEx",
                &json!({
                    "specSet": [spec_set],
                    "options": {"_typeName": "RetrieveOptions"},
                }),
            )
            .await?;

        let mut contents = Vec::new();
        while let Some(page) = result.take() {
            contents.extend(page.objects.into_iter().map(ObjectContentJson::into_content));

            if let Some(token) = page.token {
                result = self
                    .invoke(
                        collector,
                        "ContinueRetrievePropertiesEx",
                        &json!({ "token": token }),
                    )
                    .await?;
            }
        }

        Ok(contents)
    }
}

impl Session for HttpSession {
    fn service_content(&self) -> &ServiceContent {
        &self.content
    }

    async fn retrieve_one(&self, obj: &ManagedObjectRef, paths: &[&str]) -> Result<ObjectContent> {
        let mut contents = self
            .retrieve_properties(std::slice::from_ref(obj), paths)
            .await?;

        Ok(contents
            .pop()
            .unwrap_or_else(|| ObjectContent::new(obj.clone())))
    }

    async fn retrieve_properties(
        &self,
        objs: &[ManagedObjectRef],
        paths: &[&str],
    ) -> Result<Vec<ObjectContent>> {
        if objs.is_empty() {
            return Ok(Vec::new());
        }

        self.retrieve_contents(property_filter_spec(objs, paths))
            .await
            .context("retrieving properties")
    }

    async fn create_container_view(
        &self,
        container: &ManagedObjectRef,
        types: &[String],
        recursive: bool,
    ) -> Result<ManagedObjectRef> {
        self.invoke(
            &self.content.view_manager,
            "CreateContainerView",
            &json!({
                "container": moref_json(container),
                "type": types,
                "recursive": recursive,
            }),
        )
        .await
    }

    async fn query_perf(&self, specs: &[PerfQuerySpec]) -> Result<Vec<EntityMetric>> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        let query_spec: Vec<Value> = specs.iter().map(query_spec_json).collect();

        let results: Option<Vec<Value>> = self
            .invoke(
                &self.content.perf_manager,
                "QueryPerf",
                &json!({ "querySpec": query_spec }),
            )
            .await?;

        results
            .unwrap_or_default()
            .into_iter()
            .map(decode_entity_metric)
            .collect()
    }

    async fn logout(&self) -> Result<()> {
        let response = self
            .http
            .post(method_url(&self.base, &self.content.session_manager, "Logout"))
            .header(SESSION_HEADER, &self.session_id)
            .send()
            .await
            .context("invoking Logout")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VsphereError::Status {
                method: "Logout".to_string(),
                status: status.as_u16(),
                body,
            }
            .into());
        }

        Ok(())
    }
}

fn base_url(hostname: &str, release: &str) -> String {
    format!("https://{hostname}/sdk/vim25/{release}")
}

fn method_url(base: &str, obj: &ManagedObjectRef, method: &str) -> String {
    format!("{base}/{}/{}/{method}", obj.kind, obj.value)
}

async fn decode_response<T: DeserializeOwned>(method: &str, response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(VsphereError::Status {
            method: method.to_string(),
            status: status.as_u16(),
            body,
        }
        .into());
    }

    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("reading {method} response"))?;

    // Methods with no return value answer with an empty body.
    let body: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
        b"null"
    } else {
        &bytes
    };

    serde_json::from_slice(body).with_context(|| format!("decoding {method} response"))
}

fn moref_json(obj: &ManagedObjectRef) -> Value {
    json!({
        "_typeName": "ManagedObjectReference",
        "type": obj.kind,
        "value": obj.value,
    })
}

/// One `PropertySpec` per distinct object type, all sharing `paths`.
fn property_filter_spec(objs: &[ManagedObjectRef], paths: &[&str]) -> Value {
    let kinds: BTreeSet<&str> = objs.iter().map(|obj| obj.kind.as_str()).collect();

    let prop_set: Vec<Value> = kinds
        .iter()
        .map(|kind| {
            json!({
                "_typeName": "PropertySpec",
                "type": kind,
                "pathSet": paths,
            })
        })
        .collect();

    let object_set: Vec<Value> = objs
        .iter()
        .map(|obj| {
            json!({
                "_typeName": "ObjectSpec",
                "obj": moref_json(obj),
                "skip": false,
            })
        })
        .collect();

    json!({
        "_typeName": "PropertyFilterSpec",
        "propSet": prop_set,
        "objectSet": object_set,
    })
}

fn query_spec_json(spec: &PerfQuerySpec) -> Value {
    let metric_id: Vec<Value> = spec
        .metric_ids
        .iter()
        .map(|id| {
            json!({
                "_typeName": "PerfMetricId",
                "counterId": id.counter_id,
                "instance": id.instance,
            })
        })
        .collect();

    json!({
        "_typeName": "PerfQuerySpec",
        "entity": moref_json(&spec.entity),
        "startTime": format_time(spec.start_time),
        "endTime": format_time(spec.end_time),
        "metricId": metric_id,
        "intervalId": spec.interval_id,
    })
}

fn format_time(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Strips the `{"_typeName": .., "_value": ..}` boxing of `xsd:anyType` values.
fn unbox(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("_value") => {
            map.remove("_value").unwrap_or(Value::Null)
        }
        other => other,
    }
}

// --- JSON response structures ---

#[derive(Deserialize)]
struct RetrieveResultJson {
    #[serde(default)]
    objects: Vec<ObjectContentJson>,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectContentJson {
    obj: ManagedObjectRef,
    #[serde(default)]
    prop_set: Vec<DynamicPropertyJson>,
}

#[derive(Deserialize)]
struct DynamicPropertyJson {
    name: String,
    #[serde(default)]
    val: Value,
}

impl ObjectContentJson {
    fn into_content(self) -> ObjectContent {
        let mut content = ObjectContent::new(self.obj);
        for prop in self.prop_set {
            content.props.insert(prop.name, unbox(prop.val));
        }
        content
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;
    use crate::vsphere::PerfMetricId;

    #[test]
    fn test_urls() {
        let base = base_url("vc01.corp.local", "8.0.1.0");
        assert_eq!(base, "https://vc01.corp.local/sdk/vim25/8.0.1.0");

        let perf = ManagedObjectRef::new("PerformanceManager", "PerfMgr");
        assert_eq!(
            method_url(&base, &perf, "QueryPerf"),
            "https://vc01.corp.local/sdk/vim25/8.0.1.0/PerformanceManager/PerfMgr/QueryPerf"
        );
    }

    #[test]
    fn test_unbox() {
        let boxed = json!({"_typeName": "int", "_value": 8});
        assert_eq!(unbox(boxed), json!(8));

        let array = json!({
            "_typeName": "ArrayOfManagedObjectReference",
            "_value": [{"type": "Datastore", "value": "datastore-1"}]
        });
        assert_eq!(
            unbox(array),
            json!([{"type": "Datastore", "value": "datastore-1"}])
        );

        let data_object = json!({"_typeName": "ClusterConfigInfo", "dasVmConfig": []});
        assert_eq!(unbox(data_object.clone()), data_object);
    }

    #[test]
    fn test_property_filter_spec_groups_types() {
        let objs = vec![
            ManagedObjectRef::new("VirtualMachine", "vm-1"),
            ManagedObjectRef::new("HostSystem", "host-1"),
            ManagedObjectRef::new("VirtualMachine", "vm-2"),
        ];

        let spec = property_filter_spec(&objs, &["name"]);
        let prop_set = spec["propSet"].as_array().expect("propSet array");
        assert_eq!(prop_set.len(), 2);
        assert_eq!(prop_set[0]["type"], "HostSystem");
        assert_eq!(prop_set[1]["type"], "VirtualMachine");
        assert_eq!(prop_set[1]["pathSet"], json!(["name"]));

        let object_set = spec["objectSet"].as_array().expect("objectSet array");
        assert_eq!(object_set.len(), 3);
        assert_eq!(object_set[2]["obj"]["value"], "vm-2");
        assert_eq!(object_set[2]["skip"], false);
    }

    #[test]
    fn test_query_spec_json() {
        let spec = PerfQuerySpec {
            entity: ManagedObjectRef::new("VirtualMachine", "vm-42"),
            start_time: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            end_time: UNIX_EPOCH + Duration::from_secs(1_700_000_060),
            metric_ids: vec![PerfMetricId {
                counter_id: 2,
                instance: "*".to_string(),
            }],
            interval_id: 20,
        };

        let value = query_spec_json(&spec);
        assert_eq!(value["entity"]["type"], "VirtualMachine");
        assert_eq!(value["startTime"], "2023-11-14T22:13:20Z");
        assert_eq!(value["endTime"], "2023-11-14T22:14:20Z");
        assert_eq!(value["metricId"][0]["counterId"], 2);
        assert_eq!(value["metricId"][0]["instance"], "*");
        assert_eq!(value["intervalId"], 20);
    }

    #[test]
    fn test_object_content_json_unboxes_values() {
        let raw: ObjectContentJson = serde_json::from_value(json!({
            "_typeName": "ObjectContent",
            "obj": {"_typeName": "ManagedObjectReference", "type": "HostSystem", "value": "host-9"},
            "propSet": [
                {"_typeName": "DynamicProperty", "name": "summary.hardware.numCpuThreads",
                 "val": {"_typeName": "short", "_value": 32}},
                {"_typeName": "DynamicProperty", "name": "summary.config.name",
                 "val": {"_typeName": "string", "_value": "esx01.corp.local"}}
            ]
        }))
        .expect("object content should decode");

        let content = raw.into_content();
        let threads: Option<i64> = content
            .get("summary.hardware.numCpuThreads")
            .expect("decode");
        let name: Option<String> = content.get("summary.config.name").expect("decode");
        assert_eq!(threads, Some(32));
        assert_eq!(name.as_deref(), Some("esx01.corp.local"));
    }
}
