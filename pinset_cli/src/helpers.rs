use anyhow::{Context, Result, anyhow};
use iroh::{Endpoint, EndpointAddr, EndpointId};
use pinset_core::PeerId;
use pinset_net::{ApiClient, ApiError, endpoint_id, peer_id};
use pinset_node::config::PinsetNodeConfig;
use pinset_node::identity;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub fn load_config(node_config_file: &Path) -> Result<PinsetNodeConfig> {
    let toml_content = std::fs::read_to_string(node_config_file).with_context(|| {
        format!(
            "failed to read {}; run `pinset config init` first",
            node_config_file.display()
        )
    })?;
    toml::from_str(&toml_content)
        .with_context(|| format!("invalid node config {}", node_config_file.display()))
}

/// Client endpoints get a fresh identity; the node's key belongs to the
/// running node.
pub async fn build_endpoint() -> Result<Endpoint> {
    let endpoint = Endpoint::builder().bind().await?;
    Ok(endpoint)
}

pub fn local_peer_id(config: &PinsetNodeConfig, config_dir: Option<&Path>) -> Result<PeerId> {
    let secret_key = identity::load_secret_key(&config.identity, config_dir)?;
    Ok(peer_id(&secret_key.public()))
}

/// Address of the named peer, or of this node when `peer_name` is `None`.
pub fn peer_endpoint_addr(
    config: &PinsetNodeConfig,
    config_dir: Option<&Path>,
    peer_name: Option<&str>,
) -> Result<EndpointAddr> {
    let Some(peer_name) = peer_name else {
        let local = local_peer_id(config, config_dir)?;
        return Ok(EndpointAddr::from(endpoint_id(&local)?));
    };
    let dial_str = config
        .cluster
        .peers
        .get(peer_name)
        .with_context(|| format!("peer '{peer_name}' not found in node config"))?;
    let pid = EndpointId::from_str(dial_str)
        .with_context(|| format!("invalid endpoint id string '{dial_str}'"))?;
    Ok(EndpointAddr::from(pid))
}

pub fn parse_peer_id(s: &str) -> Result<PeerId> {
    PeerId::from_str(s.trim()).map_err(|err| anyhow!("invalid peer id '{s}': {err}"))
}

/// Runs `op` against `client`; if that replica is not the leader but knows
/// one, runs it once more against the leader.
pub async fn on_leader<T>(
    endpoint: &Endpoint,
    client: &ApiClient,
    op: impl AsyncFn(&ApiClient) -> Result<T>,
) -> Result<T> {
    let err = match op(client).await {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    let Some(ApiError::NotLeader {
        leader: Some(leader),
    }) = err.downcast_ref::<ApiError>()
    else {
        return Err(err);
    };
    info!(leader = %leader.fmt_short(), "redirecting to leader");
    let leader = ApiClient::connect(endpoint.clone(), EndpointAddr::from(endpoint_id(leader)?));
    op(&leader).await
}
