use clap::Parser;
use forward_relay::config::{Config, ListenerTlsConfig, LogFormat, LogLevel, PersistencePolicy, UpstreamTlsConfig};
use forward_relay::config_validation::ConfigValidator;
use forward_relay::logging::{self, CustomLogger};
use forward_relay::proxy::Proxy;
use log::{error, info, warn};
use std::path::Path;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Forward HTTP proxy: CONNECT tunnels and absolute-URI request relay"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Timeout applied to every connect, read, write and handshake")]
    timeout: Option<u64>,

    #[clap(long, value_name = "BYTES", help = "Transfer buffer size for relayed requests")]
    relay_buffer_size: Option<usize>,

    #[clap(long, value_name = "BYTES", help = "Maximum HTTP header size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, help = "Reject requests that would close the client connection")]
    require_persistent: bool,

    #[clap(long, help = "Splice CONNECT tunnels without sending 200 Connection Established")]
    no_tunnel_announce: bool,

    #[clap(long, help = "Do not set SO_REUSEADDR on the listening socket")]
    no_reuse_address: bool,

    #[clap(long, value_name = "FILE", help = "Certificate file path for a TLS listener")]
    certificate: Option<String>,

    #[clap(long, value_name = "FILE", help = "Private key file path for a TLS listener")]
    private_key: Option<String>,

    #[clap(long, value_name = "FILE", help = "Extra CA certificate for https origins (can be used multiple times)")]
    upstream_ca: Vec<String>,

    #[clap(long, help = "Do not trust the bundled webpki roots for https origins")]
    no_webpki_roots: bool,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        Config::sample().to_file(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        let mut config = Config::from_file(config_file)?;
        apply_overrides(&mut config, &args)?;
        config
    } else {
        let mut config = Config::default();
        apply_overrides(&mut config, &args)?;
        config
    };

    init_logging(&config, &args)?;

    let validation = ConfigValidator::new(&config).validate();
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    for suggestion in &validation.suggestions {
        info!("Suggestion: {}", suggestion);
    }
    if !validation.is_valid {
        for e in &validation.errors {
            error!("{}", e);
        }
        return Err(format!("Invalid configuration: {}", validation.errors.join("; ")).into());
    }

    let proxy = Proxy::from_config(&config)?;
    let accept_loop = proxy.async_accept();

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = accept_loop => {
            if let Err(e) = result {
                error!("Accept loop failed: {}", e);
            }
        }
    }

    proxy.shutdown().await?;
    info!("Proxy stopped");
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.parse()?;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(size) = args.relay_buffer_size {
        config.relay_buffer_size = size;
    }
    if let Some(size) = args.max_header_size {
        config.max_header_size = size;
    }
    if args.require_persistent {
        config.persistence = PersistencePolicy::RequirePersistent;
    }
    if args.no_tunnel_announce {
        config.announce_tunnel = false;
    }
    if args.no_reuse_address {
        config.reuse_address = false;
    }

    match (&args.certificate, &args.private_key) {
        (Some(certificate), Some(private_key)) => {
            config.tls = Some(ListenerTlsConfig {
                certificate: certificate.clone(),
                private_key: private_key.clone(),
            });
        }
        (None, None) => {}
        _ => return Err("--certificate and --private-key must be given together".into()),
    }

    if !args.upstream_ca.is_empty() || args.no_webpki_roots {
        let upstream = config.upstream_tls.get_or_insert_with(UpstreamTlsConfig::default);
        upstream.ca_certificates.extend(args.upstream_ca.iter().cloned());
        if args.no_webpki_roots {
            upstream.use_webpki_roots = false;
        }
    }

    Ok(())
}

fn init_logging(config: &Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let level = args.log_level.as_deref().map(logging::parse_log_level).transpose()?;
    let format = args.log_format.as_deref().map(logging::parse_log_format).transpose()?;

    match &config.logging {
        Some(logging_config) => {
            let mut logging_config = logging_config.clone();
            if level.is_some() {
                logging_config.level = level;
            }
            if format.is_some() {
                logging_config.format = format;
            }
            CustomLogger::init(logging_config)?;
        }
        None => logging::init_fallback(level.unwrap_or(LogLevel::Info), format.unwrap_or(LogFormat::Text)),
    }
    Ok(())
}
