//! Command handlers for the mcplink CLI.

pub mod auth;
pub mod inspect;
pub mod invoke;
pub mod session;

pub use auth::*;
pub use inspect::*;
pub use invoke::*;

use anyhow::{bail, Context};
use clap::Args;
use mcplink_client::{ConnectionOptions, TransportPreference};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where and how to connect.
#[derive(Args, Debug, Default)]
pub struct ConnectArgs {
    /// MCP server URL
    #[arg(short, long, global = true)]
    pub url: Option<String>,

    /// Connection options file (JSON, camelCase keys)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Transport to use: auto, http or sse
    #[arg(short, long, global = true)]
    pub transport: Option<String>,

    /// Extra request header as NAME=VALUE (repeatable)
    #[arg(short = 'H', long = "header", global = true)]
    pub headers: Vec<String>,

    /// Print the authorization URL and wait instead of opening a browser
    #[arg(long, global = true)]
    pub manual_auth: bool,

    /// Do not open a browser for authorization
    #[arg(long, global = true)]
    pub no_browser: bool,

    /// Seconds to wait for the authorization callback
    #[arg(long, global = true)]
    pub auth_timeout: Option<u64>,
}

/// Everything a command needs to run.
pub struct Invocation {
    pub options: ConnectionOptions,
    pub open_browser: bool,
    pub json: bool,
}

impl Invocation {
    /// Connect and wait for the session to become ready.
    pub async fn open(self) -> anyhow::Result<session::LiveSession> {
        session::open_session(self.options, self.open_browser).await
    }
}

/// Merge the options file and command-line flags.
pub async fn build_options(args: &ConnectArgs, verbose: bool) -> anyhow::Result<ConnectionOptions> {
    let mut options = match &args.config {
        Some(path) => load_options(path, args.url.as_deref()).await?,
        None => match &args.url {
            Some(url) => ConnectionOptions::new(url.clone()),
            None => bail!("No server URL; pass --url or set \"url\" in --config"),
        },
    };

    if let Some(transport) = &args.transport {
        options = options.with_transport(transport.parse::<TransportPreference>()?);
    }
    for (name, value) in parse_pairs(&args.headers, "header")? {
        options = options.with_header(name, value);
    }
    if args.manual_auth {
        options = options.with_prevent_auto_auth(true);
    }
    if let Some(secs) = args.auth_timeout {
        options = options.with_auth_timeout(Duration::from_secs(secs));
    }
    if verbose {
        options = options.with_debug(true);
    }
    Ok(options)
}

async fn load_options(path: &Path, url: Option<&str>) -> anyhow::Result<ConnectionOptions> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut document: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;
    if let (Some(url), Some(map)) = (url, document.as_object_mut()) {
        map.insert("url".to_string(), serde_json::Value::String(url.to_string()));
    }
    Ok(ConnectionOptions::from_json(&document.to_string())?)
}

/// Parse `KEY=VALUE` arguments.
pub fn parse_pairs(pairs: &[String], what: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut parsed = HashMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid {what} '{pair}'; expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid {what} '{pair}'; key is empty");
        }
        parsed.insert(key.to_string(), value.to_string());
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn args_with_url(url: &str) -> ConnectArgs {
        ConnectArgs {
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_pairs() {
        let pairs = vec!["Authorization=Bearer a=b".to_string(), " x = y".to_string()];
        let parsed = parse_pairs(&pairs, "header").unwrap();
        assert_eq!(parsed["Authorization"], "Bearer a=b");
        assert_eq!(parsed["x"], " y");

        assert!(parse_pairs(&["novalue".to_string()], "header").is_err());
        assert!(parse_pairs(&["=value".to_string()], "header").is_err());
    }

    #[tokio::test]
    async fn test_flags_override_defaults() {
        let mut args = args_with_url("https://mcp.example.com/mcp");
        args.transport = Some("sse".to_string());
        args.headers = vec!["X-Team=core".to_string()];
        args.manual_auth = true;
        args.auth_timeout = Some(30);

        let options = build_options(&args, true).await.unwrap();
        assert_eq!(options.url, "https://mcp.example.com/mcp");
        assert_eq!(options.transport_type, TransportPreference::Sse);
        assert_eq!(options.custom_headers["X-Team"], "core");
        assert!(options.prevent_auto_auth);
        assert_eq!(options.auth_timeout(), Duration::from_secs(30));
        assert!(options.debug);
    }

    #[tokio::test]
    async fn test_unknown_transport_rejected() {
        let mut args = args_with_url("https://mcp.example.com/mcp");
        args.transport = Some("websocket".to_string());
        let err = build_options(&args, false).await.unwrap_err();
        assert!(err.to_string().contains("websocket"));
    }

    #[tokio::test]
    async fn test_url_required() {
        let err = build_options(&ConnectArgs::default(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--url"));
    }

    #[tokio::test]
    async fn test_url_flag_fills_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"transportType": "http", "autoRetry": 2000}}"#).unwrap();

        let args = ConnectArgs {
            url: Some("https://mcp.example.com/mcp".to_string()),
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let options = build_options(&args, false).await.unwrap();
        assert_eq!(options.url, "https://mcp.example.com/mcp");
        assert_eq!(options.transport_type, TransportPreference::Http);
        assert_eq!(
            options.auto_retry_delay(),
            Some(Duration::from_millis(2000))
        );
    }

    #[tokio::test]
    async fn test_config_without_url_is_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"debug": true}}"#).unwrap();

        let args = ConnectArgs {
            config: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(build_options(&args, false).await.is_err());
    }
}
