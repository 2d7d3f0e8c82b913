//! Operations
//!
//! Runs one operation against a VM over the chosen protocol and renders the result
//! as lines of text.

use std::sync::Arc;

use log::{info, trace};

use chromedbg_core::config::Config;
use chromedbg_core::debugger::NullListener;
use chromedbg_core::script::Script;
use chromedbg_core::transport::ConnectionLogger;
use chromedbg_core::{Error, Result};

/// Protocols
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    #[cfg(feature = "v8")]
    V8,
    #[cfg(feature = "wip")]
    Wip,
}

/// How a V8 connection starts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeKind {
    Standalone,
    Chromium,
    None,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Version,
    Scripts,
    Evaluate(String),
    Source(String),
    Tabs,
}

#[derive(Clone, Debug)]
pub struct Options {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub handshake: HandshakeKind,
    pub tab: usize,
    pub log_traffic: bool,
    pub operation: Operation,
}

impl Operation {
    pub fn from_args(args: &[String]) -> Result<Operation> {
        let (name, rest) = args
            .split_first()
            .ok_or_else(|| Error::InvalidState("no operation given".to_string()))?;

        let argument = |what: &str| {
            if rest.is_empty() {
                Err(Error::InvalidState(format!("{} needs {}", name, what)))
            } else {
                Ok(rest.join(" "))
            }
        };

        match &name.to_ascii_lowercase()[..] {
            "version" => Ok(Operation::Version),
            "scripts" => Ok(Operation::Scripts),
            "evaluate" | "eval" => Ok(Operation::Evaluate(argument("an expression")?)),
            "source" => Ok(Operation::Source(argument("a script id")?)),
            "tabs" => Ok(Operation::Tabs),
            _ => Err(Error::InvalidState(format!(
                "Couldn't understand operation {}",
                name
            ))),
        }
    }
}

pub fn parse_protocol(protocol: Option<&str>) -> Result<Protocol> {
    match protocol.unwrap_or("v8").to_ascii_lowercase().as_str() {
        #[cfg(feature = "v8")]
        "v8" => Ok(Protocol::V8),
        #[cfg(feature = "wip")]
        "wip" => Ok(Protocol::Wip),
        s => Err(Error::InvalidState(format!(
            "Couldn't understand protocol {}",
            s
        ))),
    }
}

pub fn parse_handshake(handshake: Option<&str>) -> Result<HandshakeKind> {
    match handshake.unwrap_or("standalone").to_ascii_lowercase().as_str() {
        "standalone" => Ok(HandshakeKind::Standalone),
        "chromium" => Ok(HandshakeKind::Chromium),
        "none" => Ok(HandshakeKind::None),
        s => Err(Error::InvalidState(format!(
            "Couldn't understand handshake {}",
            s
        ))),
    }
}

/// Logs raw traffic at trace level
#[derive(Debug, Default)]
pub struct TraceLogger {}

impl ConnectionLogger for TraceLogger {
    fn log_incoming(&self, bytes: &[u8]) {
        trace!("<< {}", String::from_utf8_lossy(bytes));
    }

    fn log_outgoing(&self, bytes: &[u8]) {
        trace!(">> {}", String::from_utf8_lossy(bytes));
    }

    fn handle_eos(&self) {
        trace!("<< EOS");
    }
}

fn script_line(script: &Script) -> String {
    let mut line = format!("{}\t{}", script.id, script.display_name());
    if script.collected {
        line.push_str("\t(collected)");
    }
    line
}

pub async fn run(options: &Options, config: Config) -> Result<Vec<String>> {
    let logger: Option<Arc<dyn ConnectionLogger>> = if options.log_traffic {
        Some(Arc::new(TraceLogger {}))
    } else {
        None
    };

    info!(
        "Running {:?} against {}:{} with {:?}",
        options.operation, options.host, options.port, options.protocol
    );

    match options.protocol {
        #[cfg(feature = "v8")]
        Protocol::V8 => run_v8(options, config, logger).await,
        #[cfg(feature = "wip")]
        Protocol::Wip => run_wip(options, config, logger).await,
    }
}

#[cfg(feature = "v8")]
async fn run_v8(
    options: &Options,
    config: Config,
    logger: Option<Arc<dyn ConnectionLogger>>,
) -> Result<Vec<String>> {
    use chromedbg_v8::{DebugSession, EvaluateTarget, Handshaker};

    if options.operation == Operation::Tabs {
        return Err(Error::InvalidState(
            "tabs needs the wip protocol".to_string(),
        ));
    }

    let handshaker = match options.handshake {
        HandshakeKind::Standalone => Handshaker::StandaloneV8,
        HandshakeKind::Chromium => Handshaker::Chromium,
        HandshakeKind::None => Handshaker::None,
    };

    let addr = format!("{}:{}", options.host, options.port);
    let session =
        DebugSession::attach(&addr, handshaker, config, Arc::new(NullListener {}), logger).await?;

    let lines = match &options.operation {
        Operation::Version => vec![session.version().await?],
        Operation::Scripts => session.scripts().await?.iter().map(script_line).collect(),
        Operation::Evaluate(expression) => {
            let mirror = session.evaluate(expression, EvaluateTarget::Global).await?;
            if mirror.string().needs_reload() {
                session.reload_heavy_value(&mirror).await?;
            }
            vec![mirror.display_string()]
        }
        Operation::Source(id) => session
            .script_source(id)
            .await?
            .lines()
            .map(String::from)
            .collect(),
        Operation::Tabs => vec![],
    };

    session.detach().await?;
    Ok(lines)
}

#[cfg(feature = "wip")]
async fn run_wip(
    options: &Options,
    config: Config,
    logger: Option<Arc<dyn ConnectionLogger>>,
) -> Result<Vec<String>> {
    use chromedbg_core::websocket::hybi17::MaskStrategy;
    use chromedbg_core::websocket::WsVersion;
    use chromedbg_wip::{list_tabs, EvaluateTarget, WipSession};

    let tabs = list_tabs(&options.host, options.port, &config).await?;

    if options.operation == Operation::Tabs {
        return Ok(tabs
            .iter()
            .enumerate()
            .map(|(i, tab)| {
                let mut line = format!("{}\t{}\t{}", i, tab.title, tab.url);
                if tab.is_attached_elsewhere() {
                    line.push_str("\t(attached elsewhere)");
                }
                line
            })
            .collect());
    }

    let tab = tabs.get(options.tab).ok_or_else(|| {
        Error::InvalidState(format!(
            "no tab {}, the browser has {}",
            options.tab,
            tabs.len()
        ))
    })?;

    let version = WsVersion::Hybi17 {
        mask: MaskStrategy::NormalMask,
    };
    let session =
        WipSession::attach_tab(tab, &version, config, Arc::new(NullListener {}), logger).await?;

    let lines = match &options.operation {
        Operation::Version => {
            let agent = session
                .evaluate("navigator.userAgent", EvaluateTarget::Global)
                .await?;
            vec![agent.display_string()]
        }
        Operation::Scripts => session.scripts().iter().map(script_line).collect(),
        Operation::Evaluate(expression) => {
            let value = session.evaluate(expression, EvaluateTarget::Global).await?;
            vec![value.display_string()]
        }
        Operation::Source(id) => session
            .script_source(id)
            .await?
            .lines()
            .map(String::from)
            .collect(),
        Operation::Tabs => vec![],
    };

    session.detach().await?;
    Ok(lines)
}
