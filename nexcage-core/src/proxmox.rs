//! The Proxmox control client: talks to the cluster either over the HTTP
//! API or by shelling out to `pct`/`qm`, depending on whether an API token
//! is configured.
//!
//! The HTTP path is grounded in the same `ureq` idiom the OCI registry
//! client uses: free functions, `.header()` chained before `.call()`, no
//! shared `reqwest::Client`. The CLI path runs `pct`/`qm` as a child
//! process and classifies its exit code and stderr the way every other
//! subprocess boundary in this crate does.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ProxmoxConfig;
use crate::error::{Error, Result};

/// Lowest VMID this crate will ever allocate; below 100 is reserved for
/// Proxmox's own use.
const MIN_VMID: u32 = 100;

/// How many times `allocate_vmid` retries after a create races it.
const VMID_ALLOC_RETRIES: u32 = 3;

/// Current status of an LXC container or VM, as reported by Proxmox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    /// Not running.
    Stopped,
    /// Running.
    Running,
    /// Suspended to disk/memory (QEMU `qm suspend`).
    Paused,
    /// Proxmox reported a status string this client doesn't recognize.
    Unknown,
}

impl RemoteStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "stopped" => Self::Stopped,
            "running" => Self::Running,
            "paused" => Self::Paused,
            _ => Self::Unknown,
        }
    }
}

/// One entry from a cluster-resources listing.
#[derive(Debug, Clone)]
pub struct RemoteContainer {
    /// VMID.
    pub vmid: u32,
    /// Container/VM name, as configured.
    pub name: String,
    /// Current status.
    pub status: RemoteStatus,
    /// `"lxc"` or `"qemu"`.
    pub kind: String,
}

/// Talks to one Proxmox node, via the HTTP API when a token is
/// configured, otherwise via the local `pct`/`qm` binaries.
pub struct ProxmoxClient {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
    node: String,
    pct_path: String,
    qm_path: String,
}

impl ProxmoxClient {
    /// Builds a client from a parsed `config.json`'s `proxmox` section.
    #[must_use]
    pub fn new(config: &ProxmoxConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout)))
            .tls_config(
                ureq::tls::TlsConfig::builder()
                    .disable_verification(!config.verify_ssl)
                    .build(),
            )
            .build();
        Self {
            agent: agent_config.into(),
            base_url: format!("https://{}:{}/api2/json", config.host, config.port),
            token: config.token.clone(),
            node: config.node.clone(),
            pct_path: config.pct_path.clone(),
            qm_path: config.qm_path.clone(),
        }
    }

    /// Whether this client prefers the HTTP API over the CLI. The CLI is
    /// always the fallback; the API is used when a token is present.
    #[must_use]
    pub fn uses_api(&self) -> bool {
        self.token.is_some()
    }

    /// Path to the `pct` binary, as configured under `proxmox.pct_path`.
    #[must_use]
    pub fn pct_path(&self) -> &str {
        &self.pct_path
    }

    fn node_url(&self, suffix: &str) -> String {
        format!("{}/nodes/{}{}", self.base_url, self.node, suffix)
    }

    fn auth_header(&self) -> Option<String> {
        self.token.clone()
    }

    // ---- HTTP API -----------------------------------------------------

    fn http_get(&self, url: &str) -> Result<Vec<u8>> {
        let mut req = self.agent.get(url);
        if let Some(token) = self.auth_header() {
            req = req.header("Authorization", &token);
        }
        let response = req.call().map_err(|e| self.classify_ureq_error(url, &e))?;
        self.drain_body(response)
    }

    fn http_post_form(&self, url: &str, form: &[(&str, String)]) -> Result<Vec<u8>> {
        let body = form
            .iter()
            .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let mut req = self
            .agent
            .post(url)
            .header("Content-Type", "application/x-www-form-urlencoded");
        if let Some(token) = self.auth_header() {
            req = req.header("Authorization", &token);
        }
        let response = req
            .send(&body)
            .map_err(|e| self.classify_ureq_error(url, &e))?;
        self.drain_body(response)
    }

    fn http_delete(&self, url: &str) -> Result<Vec<u8>> {
        let mut req = self.agent.delete(url);
        if let Some(token) = self.auth_header() {
            req = req.header("Authorization", &token);
        }
        let response = req.call().map_err(|e| self.classify_ureq_error(url, &e))?;
        self.drain_body(response)
    }

    fn drain_body(&self, response: ureq::http::Response<ureq::Body>) -> Result<Vec<u8>> {
        let status = response.status().as_u16();
        let mut body = Vec::new();
        response
            .into_body()
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| Error::io(Path::new("<proxmox response>"), e))?;
        if status >= 400 {
            let excerpt: String = String::from_utf8_lossy(&body).chars().take(256).collect();
            return Err(Error::ProxmoxApiError {
                status,
                body_excerpt: crate::error::scrub_secrets(&excerpt),
            });
        }
        Ok(body)
    }

    fn classify_ureq_error(&self, url: &str, err: &ureq::Error) -> Error {
        warn!(url, error = %err, "proxmox request failed");
        if matches!(err, ureq::Error::Timeout(_)) {
            Error::Timeout(format!("request to {url} timed out"))
        } else {
            Error::Unreachable(format!("{url}: {err}"))
        }
    }

    /// Lists every LXC container and VM on the configured node.
    pub fn list_containers(&self) -> Result<Vec<RemoteContainer>> {
        if !self.uses_api() {
            return self.cli_list_containers();
        }
        let url = format!("{}/cluster/resources?type=vm", self.base_url);
        let body = self.http_get(&url)?;
        let parsed: ClusterResourcesResponse = serde_json::from_slice(&body)?;
        Ok(parsed
            .data
            .into_iter()
            .map(|r| RemoteContainer {
                vmid: r.vmid,
                name: r.name.unwrap_or_default(),
                status: RemoteStatus::parse(&r.status),
                kind: r.kind,
            })
            .collect())
    }

    /// Looks up a VMID by exact container name.
    pub fn find_vmid_by_name(&self, name: &str) -> Result<Option<u32>> {
        Ok(self
            .list_containers()?
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.vmid))
    }

    /// Finds the lowest unused VMID `>= MIN_VMID`, retrying the
    /// observe-then-claim race up to `VMID_ALLOC_RETRIES` times: each
    /// retry re-lists remote VMIDs, so a concurrent allocator that won
    /// the race is visible on the next attempt.
    pub fn allocate_vmid(&self) -> Result<u32> {
        for attempt in 0..VMID_ALLOC_RETRIES {
            let used: HashSet<u32> = self.list_containers()?.into_iter().map(|c| c.vmid).collect();
            let candidate = (MIN_VMID..).find(|v| !used.contains(v)).ok_or_else(|| {
                Error::InternalError("VMID space exhausted".to_string())
            })?;
            if self.reserve_vmid(candidate) {
                debug!(vmid = candidate, attempt, "allocated vmid");
                return Ok(candidate);
            }
            warn!(vmid = candidate, attempt, "vmid claimed concurrently, retrying");
        }
        Err(Error::InternalError(
            "failed to allocate a vmid after retries".to_string(),
        ))
    }

    /// Best-effort claim of `vmid`: true if nothing currently holds it.
    /// Proxmox itself is the final arbiter at create time; this only
    /// narrows the race window.
    fn reserve_vmid(&self, vmid: u32) -> bool {
        !self
            .list_containers()
            .map(|list| list.iter().any(|c| c.vmid == vmid))
            .unwrap_or(true)
    }

    /// Current status of `vmid`.
    pub fn status(&self, vmid: u32, kind: &str) -> Result<RemoteStatus> {
        if !self.uses_api() {
            return self.cli_status(vmid, kind);
        }
        let url = self.node_url(&format!("/{kind}/{vmid}/status/current"));
        let body = self.http_get(&url)?;
        let parsed: StatusResponse = serde_json::from_slice(&body)?;
        Ok(RemoteStatus::parse(&parsed.data.status))
    }

    /// Starts `vmid`.
    pub fn start(&self, vmid: u32, kind: &str) -> Result<()> {
        if !self.uses_api() {
            return self.cli_run(kind, &["start", &vmid.to_string()]);
        }
        let url = self.node_url(&format!("/{kind}/{vmid}/status/start"));
        self.http_post_form(&url, &[])?;
        Ok(())
    }

    /// Stops `vmid`.
    pub fn stop(&self, vmid: u32, kind: &str) -> Result<()> {
        if !self.uses_api() {
            return self.cli_run(kind, &["stop", &vmid.to_string()]);
        }
        let url = self.node_url(&format!("/{kind}/{vmid}/status/stop"));
        self.http_post_form(&url, &[])?;
        Ok(())
    }

    /// Destroys `vmid`.
    pub fn destroy(&self, vmid: u32, kind: &str) -> Result<()> {
        if !self.uses_api() {
            return self.cli_run(kind, &["destroy", &vmid.to_string()]);
        }
        let url = self.node_url(&format!("/{kind}/{vmid}"));
        self.http_delete(&url)?;
        Ok(())
    }

    /// Uploads a packed template to node storage, streaming the file body
    /// rather than buffering it whole.
    pub fn upload_template(&self, storage: &str, template_path: &Path) -> Result<()> {
        if !self.uses_api() {
            return Err(Error::UnsupportedBackend(
                "template upload requires the Proxmox API; no token configured".to_string(),
            ));
        }
        let url = self.node_url(&format!("/storage/{storage}/upload"));
        let file = std::fs::File::open(template_path).map_err(|e| Error::io(template_path, e))?;
        let size = file.metadata().map_err(|e| Error::io(template_path, e))?.len();
        let filename = template_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::UsageError("template path has no file name".to_string()))?;

        let boundary = "nexcage-template-upload-boundary";
        let preamble = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"content\"\r\n\r\nvztmpl\r\n\
             --{boundary}\r\nContent-Disposition: form-data; name=\"filename\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        );
        let epilogue = format!("\r\n--{boundary}--\r\n");
        let content_length = preamble.len() as u64 + size + epilogue.len() as u64;

        let preamble_bytes = preamble.into_bytes();
        let mut reader = preamble_bytes
            .as_slice()
            .chain(file)
            .chain(std::io::Cursor::new(epilogue.into_bytes()));

        let mut req = self
            .agent
            .post(&url)
            .header("Content-Type", &format!("multipart/form-data; boundary={boundary}"))
            .header("Content-Length", &content_length.to_string());
        if let Some(token) = self.auth_header() {
            req = req.header("Authorization", &token);
        }
        let response = req
            .send(ureq::SendBody::from_reader(&mut reader))
            .map_err(|e| self.classify_ureq_error(&url, &e))?;
        self.drain_body(response)?;
        info!(storage, template = filename, size, "uploaded template");
        Ok(())
    }

    /// Lists `vztmpl` volume IDs already present on `storage`, via the API
    /// when a token is configured, otherwise via `pvesm list`.
    pub fn list_templates(&self, storage: &str) -> Result<Vec<String>> {
        if !self.uses_api() {
            return self.cli_list_templates(storage);
        }
        let url = self.node_url(&format!("/storage/{storage}/content?content=vztmpl"));
        let body = self.http_get(&url)?;
        let parsed: StorageContentResponse = serde_json::from_slice(&body)?;
        Ok(parsed.data.into_iter().map(|e| e.volid).collect())
    }

    fn cli_list_templates(&self, storage: &str) -> Result<Vec<String>> {
        let output = Command::new("pvesm")
            .args(["list", storage, "--content", "vztmpl"])
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolMissing {
                        name: "pvesm".to_string(),
                    }
                } else {
                    Error::io(Path::new("pvesm"), e)
                }
            })?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    // ---- CLI fallback ---------------------------------------------------

    fn cli_binary(&self, kind: &str) -> &str {
        if kind == "qemu" {
            &self.qm_path
        } else {
            &self.pct_path
        }
    }

    fn cli_run(&self, kind: &str, args: &[&str]) -> Result<()> {
        let binary = self.cli_binary(kind);
        let output = Command::new(binary).args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ToolMissing {
                    name: binary.to_string(),
                }
            } else {
                Error::io(Path::new(binary), e)
            }
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ProxmoxCliError {
                argv_digest: nexcage_oci::content_digest(
                    format!("{binary} {}", args.join(" ")).as_bytes(),
                ),
                exit_code: output.status.code().unwrap_or(-1),
                stderr_excerpt: crate::error::scrub_secrets(
                    &stderr.chars().take(256).collect::<String>(),
                ),
            });
        }
        Ok(())
    }

    fn cli_status(&self, vmid: u32, kind: &str) -> Result<RemoteStatus> {
        let binary = self.cli_binary(kind);
        let output = Command::new(binary)
            .args(["status", &vmid.to_string()])
            .output()
            .map_err(|e| Error::io(Path::new(binary), e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ProxmoxCliError {
                argv_digest: nexcage_oci::content_digest(format!("{binary} status {vmid}").as_bytes()),
                exit_code: output.status.code().unwrap_or(-1),
                stderr_excerpt: crate::error::scrub_secrets(&stderr),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let status = stdout
            .split_whitespace()
            .nth(1)
            .map(RemoteStatus::parse)
            .unwrap_or(RemoteStatus::Unknown);
        Ok(status)
    }

    fn cli_list_containers(&self) -> Result<Vec<RemoteContainer>> {
        let mut containers = Vec::new();
        for (binary, kind) in [(self.pct_path.as_str(), "lxc"), (self.qm_path.as_str(), "qemu")] {
            let output = Command::new(binary).arg("list").output().map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolMissing {
                        name: binary.to_string(),
                    }
                } else {
                    Error::io(Path::new(binary), e)
                }
            })?;
            if !output.status.success() {
                continue;
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            for line in stdout.lines().skip(1) {
                let mut fields = line.split_whitespace();
                let Some(vmid) = fields.next().and_then(|s| s.parse::<u32>().ok()) else {
                    continue;
                };
                let status = fields.next().map(RemoteStatus::parse).unwrap_or(RemoteStatus::Unknown);
                let name = fields.last().unwrap_or_default().to_string();
                containers.push(RemoteContainer {
                    vmid,
                    name,
                    status,
                    kind: kind.to_string(),
                });
            }
        }
        Ok(containers)
    }

    /// Parses a `pct config <vmid>` / `qm config <vmid>` key: value block
    /// into a map, the format used both by the CLI and by the API's raw
    /// config endpoint.
    #[must_use]
    pub fn parse_config(raw: &str) -> std::collections::HashMap<String, String> {
        raw.lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect()
    }
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    data: StatusData,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ClusterResourcesResponse {
    data: Vec<ClusterResource>,
}

#[derive(Debug, Deserialize)]
struct ClusterResource {
    vmid: u32,
    #[serde(default)]
    name: Option<String>,
    status: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct StorageContentResponse {
    data: Vec<StorageContentEntry>,
}

#[derive(Debug, Deserialize)]
struct StorageContentEntry {
    volid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_status_parses_known_values() {
        assert_eq!(RemoteStatus::parse("running"), RemoteStatus::Running);
        assert_eq!(RemoteStatus::parse("stopped"), RemoteStatus::Stopped);
        assert_eq!(RemoteStatus::parse("paused"), RemoteStatus::Paused);
    }

    #[test]
    fn parse_config_splits_key_value_pairs() {
        let raw = "hostname: web-01\nmemory: 512\n";
        let parsed = ProxmoxClient::parse_config(raw);
        assert_eq!(parsed.get("hostname"), Some(&"web-01".to_string()));
        assert_eq!(parsed.get("memory"), Some(&"512".to_string()));
    }

    #[test]
    fn client_without_token_prefers_cli() {
        let config = ProxmoxConfig {
            token: None,
            ..ProxmoxConfig::default()
        };
        let client = ProxmoxClient::new(&config);
        assert!(!client.uses_api());
    }

    #[test]
    fn client_with_token_prefers_api() {
        let config = ProxmoxConfig {
            token: Some("PVEAPIToken=root@pam!id=secret".to_string()),
            ..ProxmoxConfig::default()
        };
        let client = ProxmoxClient::new(&config);
        assert!(client.uses_api());
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("a b"), "a%20b");
        assert_eq!(urlencode("name=eth0"), "name%3Deth0");
    }
}
