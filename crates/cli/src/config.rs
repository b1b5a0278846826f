//! Build a `TunnelConfig` from flags and an optional config file

use crate::Cli;
use anyhow::{Context, Result, bail};
use gate_tunnel::TunnelConfig;
use std::path::Path;
use url::Url;

/// Merge the config file (if any) with command line flags; flags win
pub fn tunnel_config(cli: &Cli) -> Result<TunnelConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let path_str = path
                .to_str()
                .with_context(|| format!("config path is not valid UTF-8: {}", path.display()))?;
            TunnelConfig::load_from_file(path_str)
                .with_context(|| format!("failed to load {}", path.display()))?
        }
        None => TunnelConfig::default(),
    };

    if let Some(port) = cli.port {
        config.local_port = port;
    }

    if let Some(host) = &cli.host {
        let (broker_host, port, tls) = parse_broker(host)?;
        config.broker_host = broker_host;
        config.broker_port = port;
        config.broker_tls = tls;
    }
    if let Some(port) = cli.broker_port {
        config.broker_port = port;
    }

    if let Some(subdomain) = &cli.subdomain {
        config.subdomain = Some(subdomain.clone());
    }
    if let Some(local_host) = &cli.local_host {
        config.local_host = Some(local_host.clone());
    }

    config.local_https |= cli.local_https;
    config.allow_invalid_cert |= cli.allow_invalid_cert;

    // Certificate material is irrelevant once validation is off
    if !config.allow_invalid_cert {
        if let (Some(cert), Some(key)) = (&cli.local_cert, &cli.local_key) {
            config.local_cert = Some(read_pem(cert)?);
            config.local_key = Some(read_pem(key)?);
        }
        if let Some(ca) = &cli.local_ca {
            config.local_ca = Some(read_pem(ca)?);
        }
    }

    config.validate()?;
    Ok(config)
}

/// Split a broker URL such as `https://localtunnel.me` into host, port and TLS flag
fn parse_broker(host: &str) -> Result<(String, u16, bool)> {
    let url = match Url::parse(host) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("https://{host}"))
            .with_context(|| format!("invalid broker host {host}"))?,
        Err(e) => bail!("invalid broker host {host}: {e}"),
    };

    let tls = match url.scheme() {
        "https" => true,
        "http" => false,
        other => bail!("unsupported broker scheme {other}"),
    };
    let Some(broker_host) = url.host_str() else {
        bail!("broker url {host} has no host");
    };
    let port = url
        .port_or_known_default()
        .unwrap_or(if tls { 443 } else { 80 });

    Ok((broker_host.to_string(), port, tls))
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("lt").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = tunnel_config(&parse(&["--port", "3000"])).unwrap();
        assert_eq!(config.local_port, 3000);
        assert_eq!(config.broker_host, "localtunnel.me");
        assert_eq!(config.broker_base_url(), "https://localtunnel.me");
        assert!(config.local_host.is_none());
        assert!(!config.local_https);
    }

    #[test]
    fn test_port_required_without_config() {
        assert!(Cli::try_parse_from(["lt"]).is_err());
    }

    #[test]
    fn test_broker_flags() {
        let config = tunnel_config(&parse(&[
            "--port",
            "8000",
            "--host",
            "http://broker.test:8080",
            "--subdomain",
            "demo",
            "--local-host",
            "127.0.0.1",
        ]))
        .unwrap();
        assert_eq!(config.broker_base_url(), "http://broker.test:8080");
        assert_eq!(config.subdomain.as_deref(), Some("demo"));
        assert_eq!(config.local_target(), ("127.0.0.1", 8000));

        let config =
            tunnel_config(&parse(&["-p", "8000", "-H", "broker.test", "--broker-port", "9443"]))
                .unwrap();
        assert_eq!(config.broker_base_url(), "https://broker.test:9443");
    }

    #[test]
    fn test_parse_broker() {
        assert_eq!(
            parse_broker("https://localtunnel.me").unwrap(),
            ("localtunnel.me".to_string(), 443, true)
        );
        assert_eq!(
            parse_broker("http://127.0.0.1").unwrap(),
            ("127.0.0.1".to_string(), 80, false)
        );
        assert!(parse_broker("ftp://broker.test").is_err());
    }

    #[test]
    fn test_invalid_subdomain_rejected() {
        assert!(tunnel_config(&parse(&["--port", "80", "--subdomain", "no_way"])).is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "local_port = 4000\nsubdomain = \"from-file\"").unwrap();
        let path = file.path().to_str().unwrap();

        let config = tunnel_config(&parse(&["--config", path])).unwrap();
        assert_eq!(config.local_port, 4000);
        assert_eq!(config.subdomain.as_deref(), Some("from-file"));

        let config =
            tunnel_config(&parse(&["--config", path, "--port", "5000", "-s", "flag"])).unwrap();
        assert_eq!(config.local_port, 5000);
        assert_eq!(config.subdomain.as_deref(), Some("flag"));
    }

    #[test]
    fn test_pem_files_loaded() {
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        ca.write_all(b"-----BEGIN CERTIFICATE-----\n").unwrap();
        let ca_path = ca.path().to_str().unwrap();

        let config =
            tunnel_config(&parse(&["--port", "443", "--local-https", "--local-ca", ca_path]))
                .unwrap();
        assert!(config.local_https);
        assert_eq!(
            config.local_ca.as_deref(),
            Some(&b"-----BEGIN CERTIFICATE-----\n"[..])
        );

        let config = tunnel_config(&parse(&[
            "--port",
            "443",
            "--local-https",
            "--allow-invalid-cert",
            "--local-ca",
            ca_path,
        ]))
        .unwrap();
        assert!(config.local_ca.is_none());

        assert!(
            tunnel_config(&parse(&["--port", "443", "--local-ca", "/nonexistent/ca.pem"])).is_err()
        );
    }
}
