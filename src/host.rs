use log::{debug, warn};
use uuid::Uuid;

/// Identity of the machine doing the scanning, stamped on every event.
pub trait HostIdProvider: Send + Sync {
    fn host_id(&self) -> String;
}

impl HostIdProvider for String {
    fn host_id(&self) -> String {
        self.clone()
    }
}

/// Host id detected once at startup.
///
/// macOS uses the hardware `IOPlatformUUID`, other platforms the hostname.
/// When neither is available a random UUID is used for the process lifetime.
#[derive(Debug, Clone)]
pub struct SystemHostId {
    id: String,
}

impl SystemHostId {
    pub async fn detect() -> Self {
        let id = match platform_id().await {
            Some(id) => id,
            None => {
                let fallback = Uuid::new_v4().to_string();
                warn!("Could not determine host id, using random {}", fallback);
                fallback
            }
        };
        debug!("Host ID: {}", id);
        SystemHostId { id }
    }
}

impl HostIdProvider for SystemHostId {
    fn host_id(&self) -> String {
        self.id.clone()
    }
}

#[cfg(target_os = "macos")]
async fn platform_id() -> Option<String> {
    let output = tokio::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .await
        .map_err(|err| debug!("Error running ioreg: {}", err))
        .ok()?;

    parse_ioreg_uuid(&String::from_utf8_lossy(&output.stdout)).or_else(hostname)
}

#[cfg(not(target_os = "macos"))]
async fn platform_id() -> Option<String> {
    hostname()
}

fn hostname() -> Option<String> {
    sysinfo::System::host_name().filter(|name| !name.trim().is_empty())
}

/// Pull the value out of a `"IOPlatformUUID" = "..."` line.
#[cfg_attr(not(any(target_os = "macos", test)), allow(dead_code))]
fn parse_ioreg_uuid(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("IOPlatformUUID"))
        .and_then(|line| line.split('=').nth(1))
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}
