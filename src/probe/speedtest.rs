//! speedtest.net HTTP client
//!
//! Blocking, sequential and single-attempt. Each transfer is timed on its
//! own and the rate is total bytes over total transfer time.

use super::directory::{closest_servers, parse_client_config, parse_server_list, ServerEntry};
use super::{Probe, ProbeError};
use crate::config::ProbeConfig;
use crate::sample::Sample;
use reqwest::blocking::Client;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use std::time::{Duration, Instant};

/// Default number of closest servers to consider
pub const MAX_SERVERS: usize = 5;

/// Latency charged for a round trip that failed
const FAILED_PING: Duration = Duration::from_secs(3600);

/// Round trips per candidate server
const PINGS_PER_SERVER: usize = 3;

/// Characters the upload payload is built from
const UPLOAD_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Measures throughput against the speedtest.net server network
pub struct SpeedtestProbe {
    config: ProbeConfig,
}

impl SpeedtestProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Get the current configuration
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    fn build_client(&self) -> Result<Client, ProbeError> {
        let mut builder = Client::builder().user_agent(self.config.user_agent.as_str());
        if let Some(secs) = self.config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        builder
            .build()
            .map_err(|e| ProbeError::ConfigRetrieval(format!("cannot create http client: {}", e)))
    }

    /// Fetch a document as text, failing on transport errors and non-2xx status
    fn fetch_text(client: &Client, url: &str) -> Result<String, String> {
        let response = client
            .get(cache_busted(url, 0))
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("{} returned HTTP {}", url, response.status().as_u16()));
        }

        response.text().map_err(|e| e.to_string())
    }

    fn fetch_servers(&self, client: &Client) -> Result<Vec<ServerEntry>, ProbeError> {
        let mut last_error = "no server list urls configured".to_string();

        for url in &self.config.server_urls {
            let parsed = Self::fetch_text(client, url)
                .and_then(|body| parse_server_list(&body).map_err(|e| e.to_string()));

            match parsed {
                Ok(servers) => return Ok(servers),
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "Server list unavailable");
                    last_error = e;
                }
            }
        }

        Err(ProbeError::ServersRetrieval(format!(
            "cannot retrieve speedtest server list: {}",
            last_error
        )))
    }

    /// Average round trip to `latency.txt`
    fn latency(&self, client: &Client, server: &ServerEntry) -> Result<Duration, ProbeError> {
        let url = format!("{}/latency.txt", server.base_url()?);
        let mut total = Duration::ZERO;

        for i in 0..PINGS_PER_SERVER {
            let start = Instant::now();
            let ok = client
                .get(cache_busted(&url, i))
                .header(CACHE_CONTROL, "no-cache")
                .send()
                .ok()
                .filter(|r| r.status().is_success())
                .and_then(|r| r.text().ok())
                .map(|body| body.trim() == "test=test")
                .unwrap_or(false);

            total += if ok { start.elapsed() } else { FAILED_PING };
        }

        Ok(total / PINGS_PER_SERVER as u32)
    }

    fn best_server(
        &self,
        client: &Client,
        candidates: Vec<(ServerEntry, f64)>,
    ) -> Result<ServerEntry, ProbeError> {
        let mut best: Option<(ServerEntry, Duration)> = None;

        for (server, distance) in candidates {
            let latency = self.latency(client, &server)?;
            tracing::debug!(
                id = server.id,
                sponsor = %server.sponsor,
                distance_km = %format!("{:.1}", distance),
                latency_ms = latency.as_millis() as u64,
                "Pinged server"
            );

            if best.as_ref().map(|(_, l)| latency < *l).unwrap_or(true) {
                best = Some((server, latency));
            }
        }

        match best {
            Some((server, latency)) if latency < FAILED_PING => {
                tracing::info!(
                    id = server.id,
                    name = %server.name,
                    sponsor = %server.sponsor,
                    latency_ms = latency.as_millis() as u64,
                    "Selected best server"
                );
                Ok(server)
            }
            _ => Err(ProbeError::NoServers(
                "unable to reach any of the closest speedtest servers".to_string(),
            )),
        }
    }

    /// Download test, returns bits per second
    fn download(&self, client: &Client, server: &ServerEntry) -> Result<f64, ProbeError> {
        let base = server.base_url()?;
        let mut bytes = 0usize;
        let mut elapsed = Duration::ZERO;

        for (i, size) in self.config.download_sizes.iter().enumerate() {
            let url = format!("{}/random{}x{}.jpg", base, size, size);
            let start = Instant::now();

            let body = client
                .get(cache_busted(&url, i))
                .header(CACHE_CONTROL, "no-cache")
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.bytes())
                .map_err(|e| ProbeError::Transfer(format!("download failed: {}", e)))?;

            elapsed += start.elapsed();
            bytes += body.len();
        }

        bits_per_second(bytes, elapsed)
    }

    /// Upload test, returns bits per second
    fn upload(&self, client: &Client, server: &ServerEntry) -> Result<f64, ProbeError> {
        let mut bytes = 0usize;
        let mut elapsed = Duration::ZERO;

        for (i, &size) in self.config.upload_sizes.iter().enumerate() {
            let payload = upload_payload(size);
            let start = Instant::now();

            client
                .post(cache_busted(&server.url, i))
                .header(CACHE_CONTROL, "no-cache")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(payload)
                .send()
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.bytes())
                .map_err(|e| ProbeError::Transfer(format!("upload failed: {}", e)))?;

            elapsed += start.elapsed();
            bytes += size;
        }

        bits_per_second(bytes, elapsed)
    }
}

impl Probe for SpeedtestProbe {
    fn measure(&self) -> Result<Sample, ProbeError> {
        tracing::info!("Starting speedtest");
        let client = self.build_client()?;

        let body = Self::fetch_text(&client, &self.config.config_url).map_err(|e| {
            ProbeError::ConfigRetrieval(format!("cannot retrieve speedtest configuration: {}", e))
        })?;
        let config = parse_client_config(&body)?;
        tracing::info!(ip = %config.client.ip, isp = %config.client.isp, "Retrieved client configuration");

        let servers = self.fetch_servers(&client)?;
        let candidates = closest_servers(
            &config.client,
            servers,
            &config.ignored_ids(),
            self.config.max_servers,
        )?;
        let server = self.best_server(&client, candidates)?;

        let down = self.download(&client, &server)?;
        let up = self.upload(&client, &server)?;

        let sample = Sample::measured(config.client.ip, config.client.isp, down, up);
        tracing::info!(
            download_mbps = %format!("{:.2}", sample.download_mbps),
            upload_mbps = %format!("{:.2}", sample.upload_mbps),
            "Speedtest done"
        );
        Ok(sample)
    }
}

/// Append a unique query parameter so proxies never serve a cached copy
fn cache_busted(url: &str, seq: usize) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}x={}.{}",
        url,
        sep,
        chrono::Utc::now().timestamp_millis(),
        seq
    )
}

/// `content1=` followed by filler, `size` bytes in total
fn upload_payload(size: usize) -> Vec<u8> {
    let mut payload = b"content1=".to_vec();
    payload.truncate(size);
    payload.extend(
        UPLOAD_ALPHABET
            .iter()
            .cycle()
            .take(size.saturating_sub(payload.len())),
    );
    payload
}

fn bits_per_second(bytes: usize, elapsed: Duration) -> Result<f64, ProbeError> {
    let secs = elapsed.as_secs_f64();
    if bytes == 0 || secs <= 0.0 {
        return Err(ProbeError::InvalidData(
            "transfer test moved no data".to_string(),
        ));
    }
    Ok(bytes as f64 * 8.0 / secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    /// Loopback listener and its base url
    fn local_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        (listener, base)
    }

    /// Answer requests in the background
    ///
    /// `route` maps method and path (query dropped) to status and body. Each
    /// response closes its connection.
    fn spawn_responder<F>(listener: TcpListener, route: F)
    where
        F: Fn(&str, &str) -> (u16, Vec<u8>) + Send + 'static,
    {
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let _ = respond(stream, &route);
            }
        });
    }

    fn respond<F>(mut stream: TcpStream, route: &F) -> std::io::Result<()>
    where
        F: Fn(&str, &str) -> (u16, Vec<u8>),
    {
        let mut reader = BufReader::new(stream.try_clone()?);

        let mut request_line = String::new();
        reader.read_line(&mut request_line)?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts
            .next()
            .unwrap_or_default()
            .split('?')
            .next()
            .unwrap_or_default()
            .to_string();

        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 || line.trim().is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body)?;

        let (status, payload) = route(&method, &path);
        write!(
            stream,
            "HTTP/1.1 {} OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status,
            payload.len()
        )?;
        stream.write_all(&payload)?;
        stream.flush()
    }

    fn server(id: u32, url: String) -> ServerEntry {
        ServerEntry {
            id,
            url,
            lat: 52.52,
            lon: 13.40,
            name: format!("server {}", id),
            sponsor: "Test".to_string(),
            country: "DE".to_string(),
        }
    }

    fn local_speedtest(base: &str) -> SpeedtestProbe {
        SpeedtestProbe::new(ProbeConfig {
            config_url: format!("{}/speedtest-config.php", base),
            server_urls: vec![format!("{}/speedtest-servers.php", base)],
            timeout_secs: Some(10),
            download_sizes: vec![350, 500],
            upload_sizes: vec![32 * 1024, 64 * 1024],
            ..ProbeConfig::default()
        })
    }

    /// A complete measurement service for one client and one server
    fn speedtest_service(
        base: String,
        client_ip: &'static str,
    ) -> impl Fn(&str, &str) -> (u16, Vec<u8>) + Send + 'static {
        move |method: &str, path: &str| match (method, path) {
            ("GET", "/speedtest-config.php") => (
                200,
                format!(
                    r#"<settings><client ip="{}" lat="52.52" lon="13.40" isp="Acme"/><server-config ignoreids=""/></settings>"#,
                    client_ip
                )
                .into_bytes(),
            ),
            ("GET", "/speedtest-servers.php") => (
                200,
                format!(
                    r#"<settings><servers><server url="{}/speedtest/upload.php" lat="52.50" lon="13.30" name="Local" country="DE" sponsor="Loopback" id="7"/></servers></settings>"#,
                    base
                )
                .into_bytes(),
            ),
            ("GET", "/speedtest/latency.txt") => (200, b"test=test\n".to_vec()),
            ("GET", p) if p.starts_with("/speedtest/random") => (200, vec![0xA5; 64 * 1024]),
            ("POST", "/speedtest/upload.php") => (200, b"size=0".to_vec()),
            _ => (404, Vec::new()),
        }
    }

    #[test]
    fn test_server_list_tries_urls_in_order() {
        let (listener, base) = local_listener();
        spawn_responder(listener, |_, path| match path {
            "/missing.php" => (404, b"gone".to_vec()),
            "/broken.php" => (200, b"<settings><notice/></settings>".to_vec()),
            "/servers.php" => (
                200,
                br#"<settings><servers><server url="http://a.example/speedtest/upload.php" lat="1" lon="2" id="3"/></servers></settings>"#.to_vec(),
            ),
            _ => (500, Vec::new()),
        });

        let probe = SpeedtestProbe::new(ProbeConfig {
            server_urls: vec![
                format!("{}/missing.php", base),
                format!("{}/broken.php", base),
                format!("{}/servers.php", base),
            ],
            timeout_secs: Some(10),
            ..ProbeConfig::default()
        });
        let client = probe.build_client().unwrap();

        let servers = probe.fetch_servers(&client).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, 3);
    }

    #[test]
    fn test_server_list_all_urls_failing() {
        let (listener, base) = local_listener();
        spawn_responder(listener, |_, _| (503, Vec::new()));

        let probe = SpeedtestProbe::new(ProbeConfig {
            server_urls: vec![format!("{}/a.php", base), format!("{}/b.php", base)],
            timeout_secs: Some(10),
            ..ProbeConfig::default()
        });
        let client = probe.build_client().unwrap();

        let err = probe.fetch_servers(&client).unwrap_err();
        assert!(matches!(err, ProbeError::ServersRetrieval(_)));
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[test]
    fn test_no_server_answering_latency_is_no_servers() {
        let (listener, base) = local_listener();
        spawn_responder(listener, |_, path| match path {
            "/one/latency.txt" => (500, Vec::new()),
            "/two/latency.txt" => (200, b"unexpected".to_vec()),
            _ => (404, Vec::new()),
        });

        let probe = local_speedtest(&base);
        let client = probe.build_client().unwrap();
        let candidates = vec![
            (server(1, format!("{}/one/upload.php", base)), 1.0),
            (server(2, format!("{}/two/upload.php", base)), 2.0),
        ];

        let err = probe.best_server(&client, candidates).unwrap_err();
        assert!(matches!(err, ProbeError::NoServers(_)));
    }

    #[test]
    fn test_best_server_skips_unreachable() {
        let (listener, base) = local_listener();
        spawn_responder(listener, |_, path| match path {
            "/two/latency.txt" => (200, b"test=test".to_vec()),
            _ => (404, Vec::new()),
        });

        let probe = local_speedtest(&base);
        let client = probe.build_client().unwrap();
        let candidates = vec![
            (server(1, format!("{}/one/upload.php", base)), 1.0),
            (server(2, format!("{}/two/upload.php", base)), 2.0),
        ];

        assert_eq!(probe.best_server(&client, candidates).unwrap().id, 2);
    }

    #[test]
    fn test_measure_against_local_service() {
        let (listener, base) = local_listener();
        spawn_responder(listener, speedtest_service(base.clone(), "203.0.113.5"));

        let sample = local_speedtest(&base).measure().unwrap();

        assert_eq!(sample.client_ip, "203.0.113.5");
        assert_eq!(sample.isp, "Acme");
        assert!(sample.download_mbps > 0.0);
        assert!(sample.upload_mbps > 0.0);
        assert!(!sample.is_failure());
    }

    #[test]
    fn test_measure_rejects_ipv6_client() {
        let (listener, base) = local_listener();
        spawn_responder(
            listener,
            speedtest_service(base.clone(), "2001:db8:85a3::8a2e:370:7334"),
        );

        let err = local_speedtest(&base).measure().unwrap_err();
        assert!(matches!(err, ProbeError::InvalidData(_)));
    }

    #[test]
    fn test_download_fails_on_missing_image() {
        let (listener, base) = local_listener();
        spawn_responder(listener, |_, _| (404, Vec::new()));

        let probe = local_speedtest(&base);
        let client = probe.build_client().unwrap();
        let target = server(1, format!("{}/speedtest/upload.php", base));

        let err = probe.download(&client, &target).unwrap_err();
        assert!(matches!(err, ProbeError::Transfer(_)));
    }

    #[test]
    fn test_upload_payload() {
        let payload = upload_payload(32);
        assert_eq!(payload.len(), 32);
        assert!(payload.starts_with(b"content1=0123"));

        assert_eq!(upload_payload(4), b"cont".to_vec());
        assert!(upload_payload(0).is_empty());
    }

    #[test]
    fn test_cache_busted() {
        let url = cache_busted("http://host/speedtest/latency.txt", 2);
        assert!(url.starts_with("http://host/speedtest/latency.txt?x="));
        assert!(url.ends_with(".2"));

        let url = cache_busted("http://host/config.php?lang=en", 0);
        assert!(url.starts_with("http://host/config.php?lang=en&x="));
    }

    #[test]
    fn test_bits_per_second() {
        let bps = bits_per_second(1_000_000, Duration::from_secs(2)).unwrap();
        assert_eq!(bps, 4_000_000.0);

        // 1.25 MB in one second is 10 Mbit/s
        let bps = bits_per_second(1_250_000, Duration::from_secs(1)).unwrap();
        let sample = Sample::measured("203.0.113.5", "Acme", bps, bps / 2.0);
        assert_eq!(sample.download_mbps, 10.0);
        assert_eq!(sample.upload_mbps, 5.0);

        assert!(matches!(
            bits_per_second(0, Duration::from_secs(1)),
            Err(ProbeError::InvalidData(_))
        ));
        assert!(matches!(
            bits_per_second(10, Duration::ZERO),
            Err(ProbeError::InvalidData(_))
        ));
    }

    #[test]
    fn test_unreachable_service_is_config_retrieval_error() {
        let config = ProbeConfig {
            config_url: "http://127.0.0.1:1/speedtest-config.php".to_string(),
            timeout_secs: Some(5),
            ..ProbeConfig::default()
        };
        let probe = SpeedtestProbe::new(config);

        let err = probe.measure().unwrap_err();
        assert!(matches!(err, ProbeError::ConfigRetrieval(_)));
        assert!(err
            .to_string()
            .starts_with("cannot retrieve speedtest configuration"));
    }

    #[test]
    fn test_default_limit() {
        let probe = SpeedtestProbe::new(ProbeConfig::default());
        assert_eq!(probe.config().max_servers, MAX_SERVERS);
    }
}
