//! Registry-credential injection into stack entry files.
//!
//! Docker engines: when an edge update is active and the stack carries
//! registry credentials, the credentials are exposed to the `updater`
//! service as an environment entry.
//!
//! Kubernetes: workload documents get an `imagePullSecrets` reference
//! and a matching dockerconfigjson Secret document is appended to the
//! manifest.

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use edge_deployer::EngineType;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::client::{RegistryCredential, StackPayload};

/// Environment variable carrying the credential set, as consumed by the
/// updater service.
const CREDENTIALS_ENV_VAR: &str = "EDGE_REGISTRY_CREDENTIALS";

/// Name of the injected image-pull secret.
const PULL_SECRET_NAME: &str = "edge-registry-credentials";

/// Rewrite the entry file of `payload` in place for the given engine.
/// No-op when the stack carries nothing to inject. Fails when the entry
/// file is absent from the manifest set.
pub fn add_registry_to_entry_file(payload: &mut StackPayload, engine: EngineType) -> Result<()> {
    match engine {
        EngineType::DockerStandalone | EngineType::DockerSwarm => {
            if payload.registry_credentials.is_empty() || payload.edge_update_id == 0 {
                return Ok(());
            }

            let credentials = payload.registry_credentials.clone();
            let content = entry_file_content(payload)?;
            *content = add_credentials_to_updater_service(content, &credentials)?;
        }

        EngineType::Kubernetes => {
            if payload.registry_credentials.is_empty() {
                return Ok(());
            }

            let credentials = payload.registry_credentials.clone();
            let content = entry_file_content(payload)?;
            *content = add_image_pull_secrets(content, &credentials)?;
        }

        EngineType::Nomad => {}
    }

    Ok(())
}

fn entry_file_content<'a>(payload: &'a mut StackPayload) -> Result<&'a mut String> {
    let entry_file_name = payload.entry_file_name.clone();
    payload
        .dir_entries
        .iter_mut()
        .find(|entry| entry.is_file && entry.name == entry_file_name)
        .map(|entry| &mut entry.content)
        .ok_or_else(|| anyhow!("entry file {entry_file_name} not found in manifest set"))
}

/// Add the credential environment entry to the `updater` service of a
/// compose file.
fn add_credentials_to_updater_service(
    content: &str,
    credentials: &[RegistryCredential],
) -> Result<String> {
    let mut doc: Value = serde_yaml::from_str(content).context("parsing compose file")?;

    let services = doc
        .get_mut("services")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| anyhow!("compose file has no services section"))?;

    let updater = services
        .get_mut("updater")
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| anyhow!("compose file has no updater service"))?;

    let encoded = serde_json::to_string(credentials)?;
    push_environment(updater, CREDENTIALS_ENV_VAR, &encoded)?;

    serde_yaml::to_string(&doc).context("serializing compose file")
}

/// Append `name=value` to a service's environment, handling both the
/// list and the map form.
fn push_environment(service: &mut Mapping, name: &str, value: &str) -> Result<()> {
    let key = Value::from("environment");

    match service.get_mut(&key) {
        None => {
            let mut env = Mapping::new();
            env.insert(Value::from(name), Value::from(value));
            service.insert(key, Value::Mapping(env));
        }
        Some(Value::Sequence(seq)) => {
            seq.push(Value::from(format!("{name}={value}")));
        }
        Some(Value::Mapping(map)) => {
            map.insert(Value::from(name), Value::from(value));
        }
        Some(_) => bail!("unexpected environment format in compose file"),
    }

    Ok(())
}

/// Add `imagePullSecrets` references to every workload document and
/// append the Secret document itself.
fn add_image_pull_secrets(content: &str, credentials: &[RegistryCredential]) -> Result<String> {
    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(content) {
        let doc = Value::deserialize(doc).context("parsing kubernetes manifest")?;
        if !doc.is_null() {
            docs.push(doc);
        }
    }

    for doc in &mut docs {
        if let Some(pod_spec) = pod_spec_of(doc) {
            let secrets = pod_spec
                .entry(Value::from("imagePullSecrets"))
                .or_insert_with(|| Value::Sequence(Vec::new()));
            if let Value::Sequence(seq) = secrets {
                let mut reference = Mapping::new();
                reference.insert(Value::from("name"), Value::from(PULL_SECRET_NAME));
                seq.push(Value::Mapping(reference));
            }
        }
    }

    docs.push(pull_secret_document(credentials)?);

    let rendered: Result<Vec<String>> = docs
        .iter()
        .map(|doc| serde_yaml::to_string(doc).context("serializing kubernetes manifest"))
        .collect();
    Ok(rendered?.join("---\n"))
}

/// The pod spec of a workload document: `spec` for Pod kinds,
/// `spec.template.spec` for controller kinds. Non-workload documents
/// yield None.
fn pod_spec_of(doc: &mut Value) -> Option<&mut Mapping> {
    let kind = doc.get("kind")?.as_str()?.to_string();

    let spec = doc.get_mut("spec")?.as_mapping_mut()?;
    if kind == "Pod" {
        return Some(spec);
    }

    spec.get_mut("template")?
        .as_mapping_mut()?
        .get_mut("spec")?
        .as_mapping_mut()
}

fn pull_secret_document(credentials: &[RegistryCredential]) -> Result<Value> {
    let mut auths = serde_json::Map::new();
    for credential in credentials {
        let auth = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", credential.username, credential.secret));
        auths.insert(
            credential.server_url.clone(),
            serde_json::json!({
                "username": credential.username,
                "password": credential.secret,
                "auth": auth,
            }),
        );
    }

    let dockerconfig = serde_json::json!({ "auths": auths }).to_string();
    let encoded = base64::engine::general_purpose::STANDARD.encode(dockerconfig);

    let secret = format!(
        "apiVersion: v1\nkind: Secret\nmetadata:\n  name: {PULL_SECRET_NAME}\ntype: kubernetes.io/dockerconfigjson\ndata:\n  .dockerconfigjson: {encoded}\n"
    );
    serde_yaml::from_str(&secret).context("building pull secret document")
}
