//! Tab discovery
//!
//! A browser started with remote debugging serves the list of its tabs as JSON on
//! `GET /json`. Each tab carries the WebSocket URL its debugger listens on, which is
//! missing while another client is attached to it.

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use url::Url;

use chromedbg_core::config::Config;
use chromedbg_core::transport;
use chromedbg_core::websocket::handshake::{build_request, read_http_response, HandshakeReader};
use chromedbg_core::{Error, Result};

/// One entry of the tab list
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TabDescriptor {
    #[serde(default)]
    pub id: Option<String>,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
    #[serde(default)]
    pub devtools_frontend_url: Option<String>,
}

impl TabDescriptor {
    pub fn is_attached_elsewhere(&self) -> bool {
        self.web_socket_debugger_url.is_none()
    }

    /// The WebSocket URL to attach to
    pub fn debugger_url(&self) -> Result<Url> {
        let raw = self.web_socket_debugger_url.as_ref().ok_or_else(|| {
            Error::InvalidState(format!("tab {:?} is attached to another debugger", self.url))
        })?;

        let url = Url::parse(raw)
            .map_err(|e| Error::Handshake(format!("bad debugger url {}: {}", raw, e)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            scheme => Err(Error::Handshake(format!(
                "debugger url {} has scheme {}",
                raw, scheme
            ))),
        }
    }
}

pub fn parse_tab_list(body: &str) -> Result<Vec<TabDescriptor>> {
    Ok(serde_json::from_str(body)?)
}

/// Request the tab list over an open stream
pub async fn fetch_tabs<S>(stream: S, host_field: &str) -> Result<Vec<TabDescriptor>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = HandshakeReader::new(stream);
    let fields = vec![
        format!("Host: {}", host_field),
        "Accept: application/json".to_string(),
        "Connection: close".to_string(),
    ];
    reader.write_all(&build_request("/json", &fields, b"")).await?;

    let response = read_http_response(&mut reader).await?;
    let body = match response
        .field("content-length")
        .and_then(|l| l.trim().parse::<usize>().ok())
    {
        Some(length) => reader.read_exact(length).await?,
        None => reader.read_to_end().await?,
    };
    let body = String::from_utf8(body)
        .map_err(|_| Error::MalformedMessage("tab list is not valid UTF-8".to_string()))?;

    if response.code != 200 {
        return Err(Error::ErrorPage {
            code: response.code,
            reason: response.reason,
            body,
        });
    }

    debug!("Tab list: {}", body);

    parse_tab_list(&body)
}

/// Connect to the browser at `host:port` and list its tabs
pub async fn list_tabs(host: &str, port: u16, config: &Config) -> Result<Vec<TabDescriptor>> {
    let host_field = format!("{}:{}", host, port);
    let stream = transport::open(&host_field, config.connect_timeout()).await?;

    let tabs = timeout(config.handshake_timeout(), fetch_tabs(stream, &host_field))
        .await
        .map_err(|_| Error::Timeout(format!("waiting for tab list from {}", host_field)))??;

    info!("Found {} tabs on {}", tabs.len(), host_field);

    Ok(tabs)
}
