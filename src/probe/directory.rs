//! Speedtest directory documents
//!
//! Parses the client configuration and server list XML documents and picks
//! the servers closest to the client.

use super::ProbeError;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// The client configuration document (`<settings>` root)
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub client: ClientInfo,

    #[serde(rename = "server-config", default)]
    server_config: Option<ServerConfig>,
}

/// What the service knows about the caller
#[derive(Debug, Clone, Deserialize)]
pub struct ClientInfo {
    #[serde(rename = "@ip")]
    pub ip: String,

    #[serde(rename = "@isp", default)]
    pub isp: String,

    #[serde(rename = "@lat")]
    pub lat: f64,

    #[serde(rename = "@lon")]
    pub lon: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct ServerConfig {
    #[serde(rename = "@ignoreids", default)]
    ignoreids: String,
}

impl ClientConfig {
    /// Server ids the service asks clients not to use
    pub fn ignored_ids(&self) -> HashSet<u32> {
        self.server_config
            .as_ref()
            .map(|sc| {
                sc.ignoreids
                    .split(',')
                    .filter_map(|id| id.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Servers,
}

#[derive(Debug, Deserialize)]
struct Servers {
    #[serde(rename = "server", default)]
    server: Vec<ServerEntry>,
}

/// One measurement server from the directory
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerEntry {
    #[serde(rename = "@id")]
    pub id: u32,

    /// Upload endpoint; the other endpoints live next to it
    #[serde(rename = "@url")]
    pub url: String,

    #[serde(rename = "@lat")]
    pub lat: f64,

    #[serde(rename = "@lon")]
    pub lon: f64,

    #[serde(rename = "@name", default)]
    pub name: String,

    #[serde(rename = "@sponsor", default)]
    pub sponsor: String,

    #[serde(rename = "@country", default)]
    pub country: String,
}

impl ServerEntry {
    /// Directory holding `latency.txt` and the `random*.jpg` images
    pub fn base_url(&self) -> Result<&str, ProbeError> {
        self.url
            .rsplit_once('/')
            .map(|(base, _)| base)
            .filter(|base| base.contains("://"))
            .ok_or_else(|| {
                ProbeError::InvalidData(format!("server {} has invalid url {:?}", self.id, self.url))
            })
    }
}

/// Parse the client configuration document
pub fn parse_client_config(xml: &str) -> Result<ClientConfig, ProbeError> {
    let config: ClientConfig = quick_xml::de::from_str(xml).map_err(|e| {
        ProbeError::InvalidData(format!("malformed speedtest configuration: {}", e))
    })?;

    if config.client.ip.trim().is_empty() {
        return Err(ProbeError::InvalidData(
            "speedtest configuration has no client ip".to_string(),
        ));
    }
    if config.client.ip.trim().parse::<Ipv4Addr>().is_err() {
        return Err(ProbeError::InvalidData(format!(
            "client ip {:?} is not an IPv4 address",
            config.client.ip
        )));
    }

    Ok(config)
}

/// Parse a server directory document
pub fn parse_server_list(xml: &str) -> Result<Vec<ServerEntry>, ProbeError> {
    let list: ServerList = quick_xml::de::from_str(xml)
        .map_err(|e| ProbeError::InvalidData(format!("malformed speedtest server list: {}", e)))?;

    Ok(list.servers.server)
}

/// Great-circle distance between two coordinates
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Up to `limit` servers nearest to the client, nearest first
///
/// Ignored ids are skipped. Returns `NoServers` when nothing is left.
pub fn closest_servers(
    client: &ClientInfo,
    servers: Vec<ServerEntry>,
    ignored: &HashSet<u32>,
    limit: usize,
) -> Result<Vec<(ServerEntry, f64)>, ProbeError> {
    let mut ranked: Vec<(ServerEntry, f64)> = servers
        .into_iter()
        .filter(|s| !ignored.contains(&s.id))
        .map(|s| {
            let d = distance_km(client.lat, client.lon, s.lat, s.lon);
            (s, d)
        })
        .collect();

    if ranked.is_empty() {
        return Err(ProbeError::NoServers(
            "no matched servers in speedtest server list".to_string(),
        ));
    }

    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    ranked.truncate(limit);

    Ok(ranked)
}
